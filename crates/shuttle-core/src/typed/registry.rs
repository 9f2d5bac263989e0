//! TypedRegistry - Handler の登録と管理
//!
//! # 学習ポイント
//! - HashMap での型消去された trait object の管理
//! - Generic methods での登録と型安全性
//! - Arc による共有所有権（全 worker slot が同じ registry を参照）

use std::collections::HashMap;
use std::sync::Arc;

use super::handler::{DynHandler, Handler, TypedHandler};
use super::job::JobKind;

/// TypedRegistry は型付き Handler を登録・管理
///
/// # 使用例
/// ```ignore
/// let mut registry = TypedRegistry::new();
/// registry.register::<ResizeImage, _>(ResizeHandler)?;
///
/// let handler = registry.get("media.resize_image.v1");
/// ```
#[derive(Default, Clone)]
pub struct TypedRegistry {
    handlers: HashMap<String, Arc<dyn DynHandler>>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("handler for kind '{0}' is already registered")]
    AlreadyRegistered(String),
}

impl TypedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: JobKind, H: Handler<T> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        let kind = T::KIND.to_string();
        if self.handlers.contains_key(&kind) {
            return Err(RegistryError::AlreadyRegistered(kind));
        }
        self.handlers
            .insert(kind, Arc::new(TypedHandler::new(handler)));
        Ok(())
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn DynHandler>> {
        self.handlers.get(kind).cloned()
    }

    /// Registered kinds, sorted.
    pub fn registered_kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.handlers.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typed::handler::fixtures::{AddHandler, GreetHandler};
    use crate::typed::job::fixtures::{Add, Greet};

    #[test]
    fn register_and_get() {
        let mut registry = TypedRegistry::new();
        registry.register::<Add, _>(AddHandler).unwrap();

        let handler = registry.get(Add::KIND).unwrap();
        assert_eq!(handler.kind(), Add::KIND);
        assert!(registry.get(Greet::KIND).is_none());
    }

    #[test]
    fn double_registration_is_rejected() {
        let mut registry = TypedRegistry::new();
        registry.register::<Add, _>(AddHandler).unwrap();
        let result = registry.register::<Add, _>(AddHandler);
        assert!(matches!(result, Err(RegistryError::AlreadyRegistered(kind)) if kind == Add::KIND));
    }

    #[test]
    fn registered_kinds_are_sorted() {
        let mut registry = TypedRegistry::new();
        registry.register::<Greet, _>(GreetHandler).unwrap();
        registry.register::<Add, _>(AddHandler).unwrap();
        assert_eq!(
            registry.registered_kinds(),
            vec![Add::KIND.to_string(), Greet::KIND.to_string()]
        );
    }
}
