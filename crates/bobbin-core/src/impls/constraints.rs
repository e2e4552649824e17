//! InMemoryConstraintTracker - 呼び出し側が値を設定する ConstraintTracker
//!
//! 実際の監視（OS のネットワーク通知など）はアプリ側で行い、結果を `set` で流し込みます。
//! テストでは条件を手で切り替えるのに使います。

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tracing::debug;

use crate::ports::ConstraintTracker;

#[derive(Debug)]
pub struct InMemoryConstraintTracker {
    conditions: Mutex<HashMap<String, bool>>,
    version: watch::Sender<u64>,
}

impl Default for InMemoryConstraintTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryConstraintTracker {
    pub fn new() -> Self {
        Self {
            conditions: Mutex::new(HashMap::new()),
            version: watch::channel(0).0,
        }
    }

    fn conditions(&self) -> MutexGuard<'_, HashMap<String, bool>> {
        self.conditions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records the current value of `condition`. Returns whether it changed.
    pub fn set(&self, condition: impl Into<String>, met: bool) -> bool {
        let condition = condition.into();
        let previous = self.conditions().insert(condition.clone(), met);
        let changed = previous.unwrap_or(false) != met;
        if changed {
            debug!(%condition, met, "constraint changed");
            self.version.send_modify(|version| *version = version.wrapping_add(1));
        }
        changed
    }
}

impl ConstraintTracker for InMemoryConstraintTracker {
    fn is_met(&self, condition: &str) -> bool {
        self.conditions().get(condition).copied().unwrap_or(false)
    }

    fn changes(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }
}
