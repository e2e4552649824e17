//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **MemorySnapshotStore / JsonFileSnapshotStore**: WorkDatabase の永続化先
//! - **GreedyScheduler**: プロセス内の即時ディスパッチ
//! - **DelayedScheduler**: 期限付きトリガー（min-heap タイマー）
//! - **InMemoryConstraintTracker**: 値を外から設定する実行条件

pub mod constraints;
pub mod delayed_scheduler;
pub mod greedy_scheduler;
pub mod snapshot;

pub use self::constraints::InMemoryConstraintTracker;
pub use self::delayed_scheduler::DelayedScheduler;
pub use self::greedy_scheduler::GreedyScheduler;
pub use self::snapshot::{JsonFileSnapshotStore, MemorySnapshotStore};
