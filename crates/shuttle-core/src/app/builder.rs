//! AppBuilder - handler の登録と起動時検証
//!
//! # Fail-fast 設計
//! - expect_kinds() で期待される kind を宣言
//! - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
//! - 不足があれば worker を起動する前に BuildError を返す

use std::sync::Arc;

use crate::typed::{Handler, JobKind, RegistryError, TypedRegistry};

/// # 使用例
/// ```ignore
/// let app = AppBuilder::new()
///     .register::<ResizeImage, _>(ResizeHandler)?
///     .expect_kinds(&["media.resize_image.v1"])
///     .build()?;
/// WorkerPool::spawn(settings, broker, app.registry, shutdown);
/// ```
#[derive(Default)]
pub struct AppBuilder {
    registry: TypedRegistry,
    expected_kinds: Option<Vec<String>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing handlers for kinds {0:?}: expected but not registered")]
    MissingKinds(Vec<String>),

    #[error("no handlers registered")]
    Empty,
}

impl AppBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: JobKind, H: Handler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register::<T, H>(handler)?;
        Ok(self)
    }

    pub fn expect_kinds(mut self, kinds: &[&str]) -> Self {
        self.expected_kinds = Some(kinds.iter().map(|k| k.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<App, BuildError> {
        if self.registry.is_empty() {
            return Err(BuildError::Empty);
        }
        if let Some(expected) = &self.expected_kinds {
            let registered = self.registry.registered_kinds();
            let missing: Vec<String> = expected
                .iter()
                .filter(|kind| !registered.contains(kind))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingKinds(missing));
            }
        }
        Ok(App {
            registry: Arc::new(self.registry),
        })
    }
}

/// Validated set of handlers, shared by every worker slot.
pub struct App {
    pub registry: Arc<TypedRegistry>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typed::handler::fixtures::{AddHandler, GreetHandler};
    use crate::typed::job::fixtures::{Add, Greet};

    #[test]
    fn build_success() {
        let app = AppBuilder::new()
            .register::<Add, _>(AddHandler)
            .unwrap()
            .register::<Greet, _>(GreetHandler)
            .unwrap()
            .expect_kinds(&[Add::KIND, Greet::KIND])
            .build()
            .unwrap();
        assert!(app.registry.get(Greet::KIND).is_some());
    }

    #[test]
    fn build_reports_missing_kinds() {
        let app = AppBuilder::new()
            .register::<Add, _>(AddHandler)
            .unwrap()
            .expect_kinds(&[Add::KIND, Greet::KIND])
            .build();
        assert!(matches!(
            app,
            Err(BuildError::MissingKinds(missing)) if missing == vec![Greet::KIND.to_string()]
        ));
    }

    #[test]
    fn build_without_handlers_fails() {
        assert!(matches!(AppBuilder::new().build(), Err(BuildError::Empty)));
    }
}
