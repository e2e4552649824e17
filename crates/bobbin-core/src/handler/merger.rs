//! InputMerger - 自分の入力と前提ジョブの出力を 1 つにまとめる戦略
//!
//! 名前で登録し、WorkRecord の `input_merger` で引きます。
//! 渡される順序は「自分の入力 → 前提ジョブの出力（id 順）」です。

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use super::registry::RegistryError;
use crate::domain::{DEFAULT_INPUT_MERGER, Data};

pub trait InputMerger: Send + Sync {
    fn merge(&self, inputs: &[Data]) -> Data;
}

/// Later payloads win per key.
#[derive(Debug, Default, Clone, Copy)]
pub struct OverwritingInputMerger;

impl OverwritingInputMerger {
    pub const NAME: &'static str = DEFAULT_INPUT_MERGER;
}

impl InputMerger for OverwritingInputMerger {
    fn merge(&self, inputs: &[Data]) -> Data {
        let mut merged = Data::empty();
        for data in inputs {
            for (key, value) in data.iter() {
                merged.insert(key.clone(), value.clone());
            }
        }
        merged
    }
}

/// Every key becomes an array; arrays are concatenated, scalars appended.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArrayCreatingInputMerger;

impl ArrayCreatingInputMerger {
    pub const NAME: &'static str = "array_creating";
}

impl InputMerger for ArrayCreatingInputMerger {
    fn merge(&self, inputs: &[Data]) -> Data {
        let mut arrays: HashMap<String, Vec<Value>> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        for data in inputs {
            for (key, value) in data.iter() {
                let slot = arrays.entry(key.clone()).or_insert_with(|| {
                    order.push(key.clone());
                    Vec::new()
                });
                match value {
                    Value::Array(items) => slot.extend(items.iter().cloned()),
                    other => slot.push(other.clone()),
                }
            }
        }
        order
            .into_iter()
            .filter_map(|key| arrays.remove(&key).map(|items| (key, Value::Array(items))))
            .collect()
    }
}

#[derive(Clone, Default)]
pub struct MergerRegistry {
    mergers: HashMap<String, Arc<dyn InputMerger>>,
}

impl MergerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `overwriting` and `array_creating` pre-registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .mergers
            .insert(OverwritingInputMerger::NAME.to_string(), Arc::new(OverwritingInputMerger));
        registry.mergers.insert(
            ArrayCreatingInputMerger::NAME.to_string(),
            Arc::new(ArrayCreatingInputMerger),
        );
        registry
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        merger: impl InputMerger + 'static,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        if self.mergers.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered {
                kind: "input merger",
                name,
            });
        }
        self.mergers.insert(name, Arc::new(merger));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn InputMerger>> {
        self.mergers.get(name).cloned()
    }
}
