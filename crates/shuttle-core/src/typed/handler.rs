//! Handler trait - JobKind を実行する Handler の定義
//!
//! # 学習ポイント
//! - ジェネリック trait (Handler<T>)
//! - Object-safe trait (DynHandler)
//! - Type erasure パターン (TypedHandler<T, H> → DynHandler)

use std::marker::PhantomData;

use async_trait::async_trait;

use super::codec::PayloadCodec;
use super::job::JobKind;
use crate::domain::{JobError, JobId, JobOrigin};

/// What a handler knows about the attempt it is running.
#[derive(Debug, Clone, PartialEq)]
pub struct JobContext {
    pub job_id: JobId,
    pub queue: String,
    pub kind: String,
    /// 1-indexed attempt number.
    pub attempt: u32,
    pub max_attempts: u32,
    pub origin: JobOrigin,
}

/// Handler は JobKind を実行して結果を返す
///
/// # 使用例
/// ```ignore
/// struct ResizeHandler;
///
/// #[async_trait]
/// impl Handler<ResizeImage> for ResizeHandler {
///     async fn handle(&self, ctx: JobContext, job: ResizeImage) -> Result<Value, JobError> {
///         resize(&job.path, job.width).map_err(|e| JobError::retryable(e.to_string()))?;
///         Ok(json!({"resized": job.path}))
///     }
/// }
/// ```
///
/// エラーはデフォルトで retryable。`JobError::fatal` を返すと即 failed。
#[async_trait]
pub trait Handler<T: JobKind>: Send + Sync {
    async fn handle(&self, ctx: JobContext, job: T) -> Result<serde_json::Value, JobError>;
}

/// DynHandler は object-safe な Handler の抽象化
///
/// TypedHandler<T, H> を DynHandler に変換することで、
/// HashMap<String, Arc<dyn DynHandler>> に格納可能にします。
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn handle_dyn(
        &self,
        ctx: JobContext,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, JobError>;

    fn kind(&self) -> &'static str;
}

pub struct TypedHandler<T: JobKind, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: JobKind, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: JobKind, H: Handler<T>> DynHandler for TypedHandler<T, H> {
    async fn handle_dyn(
        &self,
        ctx: JobContext,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, JobError> {
        let job: T = PayloadCodec::decode(payload).map_err(|e| JobError::decode(e.to_string()))?;
        self.handler.handle(ctx, job).await
    }

    fn kind(&self) -> &'static str {
        T::KIND
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::typed::job::fixtures::{Add, Greet};
    use serde_json::json;

    pub struct AddHandler;

    #[async_trait]
    impl Handler<Add> for AddHandler {
        async fn handle(&self, _ctx: JobContext, job: Add) -> Result<serde_json::Value, JobError> {
            Ok(json!(job.a + job.b))
        }
    }

    pub struct GreetHandler;

    #[async_trait]
    impl Handler<Greet> for GreetHandler {
        async fn handle(&self, ctx: JobContext, job: Greet) -> Result<serde_json::Value, JobError> {
            if job.name.is_empty() {
                return Err(JobError::fatal("name is empty"));
            }
            Ok(json!(format!("hello {} (attempt {})", job.name, ctx.attempt)))
        }
    }

    pub fn context(kind: &str) -> JobContext {
        JobContext {
            job_id: JobId::from_ulid(ulid::Ulid::new()),
            queue: "default".to_string(),
            kind: kind.to_string(),
            attempt: 1,
            max_attempts: 3,
            origin: JobOrigin::Submitted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::{AddHandler, GreetHandler, context};
    use super::*;
    use crate::domain::FailureKind;
    use crate::typed::job::fixtures::{Add, Greet};
    use serde_json::json;

    #[tokio::test]
    async fn typed_handler_decodes_and_runs() {
        let handler = TypedHandler::<Add, _>::new(AddHandler);
        let result = handler
            .handle_dyn(context(Add::KIND), json!({"a": 2, "b": 3}))
            .await
            .unwrap();
        assert_eq!(result, json!(5));
        assert_eq!(handler.kind(), "test.add.v1");
    }

    #[tokio::test]
    async fn undecodable_payload_is_fatal() {
        let handler = TypedHandler::<Add, _>::new(AddHandler);
        let err = handler
            .handle_dyn(context(Add::KIND), json!({"a": "two"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Decode);
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn handler_errors_pass_through() {
        let handler = TypedHandler::<Greet, _>::new(GreetHandler);
        let err = handler
            .handle_dyn(context(Greet::KIND), json!({"name": ""}))
            .await
            .unwrap_err();
        assert_eq!(err, JobError::fatal("name is empty"));
    }
}
