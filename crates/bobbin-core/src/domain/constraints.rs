//! Constraints - 実行前に満たされている必要がある条件の集合
//!
//! 条件は名前だけで表します（"network", "charging" など）。
//! 条件が今満たされているかは `ConstraintTracker` port が答えます。

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Constraints(BTreeSet<String>);

impl Constraints {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn require(mut self, condition: impl Into<String>) -> Self {
        self.0.insert(condition.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// True when every named condition is met. An empty set is always met.
    pub fn all_met(&self, mut is_met: impl FnMut(&str) -> bool) -> bool {
        self.0.iter().all(|name| is_met(name))
    }
}
