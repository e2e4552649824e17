//! SnapshotStore port - WorkDatabase の永続化先
//!
//! WorkDatabase はコミットのたびに全体のスナップショットを書き出し、
//! 起動時に読み戻します。名前インデックスはレコードから再構築するため保存しません。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{StoreError, WorkId, WorkRecord};

/// Directed edge: `dependent` waits for `prerequisite`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dependency {
    pub prerequisite: WorkId,
    pub dependent: WorkId,
}

/// Engine-wide key/value state that lives next to the records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    pub last_cancel_all_at: Option<DateTime<Utc>>,

    /// True while an engine owns the store. Still true at startup means the previous
    /// process did not shut down cleanly.
    pub running: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    pub records: Vec<WorkRecord>,
    pub dependencies: Vec<Dependency>,
    pub preferences: Preferences,
}

pub trait SnapshotStore: Send + Sync {
    /// `None` when nothing was ever saved.
    fn load(&self) -> Result<Option<Snapshot>, StoreError>;

    fn save(&self, snapshot: &Snapshot) -> Result<(), StoreError>;
}
