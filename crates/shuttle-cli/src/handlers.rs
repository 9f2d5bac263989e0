//! デモ用の job kind
//!
//! - `demo.echo.v1`: payload をそのまま結果に返す
//! - `demo.sleep.v1`: 指定ミリ秒眠る（timeout / lease 更新の確認用）
//! - `demo.fail.v1`: 失敗を返す（`fatal` で retry を止める）

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use shuttle_core::app::{App, AppBuilder};
use shuttle_core::domain::JobError;
use shuttle_core::typed::{Handler, JobContext, JobKind};

#[derive(Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub(crate) struct Echo(Value);

impl JobKind for Echo {
    const KIND: &'static str = "demo.echo.v1";
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Sleep {
    pub(crate) ms: u64,
}

impl JobKind for Sleep {
    const KIND: &'static str = "demo.sleep.v1";
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Fail {
    #[serde(default)]
    pub(crate) message: Option<String>,
    #[serde(default)]
    pub(crate) fatal: bool,
}

impl JobKind for Fail {
    const KIND: &'static str = "demo.fail.v1";
}

struct EchoHandler;

#[async_trait]
impl Handler<Echo> for EchoHandler {
    async fn handle(&self, _ctx: JobContext, job: Echo) -> Result<Value, JobError> {
        Ok(job.0)
    }
}

struct SleepHandler;

#[async_trait]
impl Handler<Sleep> for SleepHandler {
    async fn handle(&self, ctx: JobContext, job: Sleep) -> Result<Value, JobError> {
        tracing::debug!(job_id = %ctx.job_id, ms = job.ms, "sleeping");
        tokio::time::sleep(Duration::from_millis(job.ms)).await;
        Ok(json!({ "slept_ms": job.ms }))
    }
}

struct FailHandler;

#[async_trait]
impl Handler<Fail> for FailHandler {
    async fn handle(&self, ctx: JobContext, job: Fail) -> Result<Value, JobError> {
        let message = job
            .message
            .unwrap_or_else(|| format!("requested failure on attempt {}", ctx.attempt));
        if job.fatal {
            Err(JobError::fatal(message))
        } else {
            Err(JobError::retryable(message))
        }
    }
}

pub(crate) fn app() -> anyhow::Result<App> {
    Ok(AppBuilder::new()
        .register::<Echo, _>(EchoHandler)?
        .register::<Sleep, _>(SleepHandler)?
        .register::<Fail, _>(FailHandler)?
        .build()?)
}
