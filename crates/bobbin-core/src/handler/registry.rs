//! HandlerRegistry - 名前 → ハンドラ生成クロージャの表
//!
//! 起動時に登録し、実行時は名前で引きます。
//! 見つからない名前はその WorkRecord だけの設定エラー（FAILED）になります。

use std::collections::HashMap;
use std::sync::Arc;

use super::handler::{NamedHandler, WorkHandler};

/// Builds a fresh handler for every attempt.
pub type HandlerFactory = Arc<dyn Fn() -> Box<dyn WorkHandler> + Send + Sync>;

/// RegistryError は登録時のエラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("{kind} '{name}' is already registered")]
    AlreadyRegistered { kind: &'static str, name: String },
}

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    factories: HashMap<String, HandlerFactory>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> Result<(), RegistryError>
    where
        F: Fn() -> Box<dyn WorkHandler> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered {
                kind: "handler",
                name,
            });
        }
        self.factories.insert(name, Arc::new(factory));
        Ok(())
    }

    /// Registers `H` under `H::NAME`, constructing it with `Default`.
    pub fn register_named<H: NamedHandler>(&mut self) -> Result<(), RegistryError> {
        self.register(H::NAME, || Box::new(H::default()) as Box<dyn WorkHandler>)
    }

    pub fn create(&self, name: &str) -> Option<Box<dyn WorkHandler>> {
        self.factories.get(name).map(|factory| factory())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn registered_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}
