//! Ports - 抽象化レイヤー
//!
//! エンジンが外部に依存する箇所（時刻、永続化、起動トリガー、実行条件）を trait として定義します。
//! 実装は `impls` にあります。

pub mod clock;
pub mod constraints;
pub mod scheduler;
pub mod snapshot_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::constraints::ConstraintTracker;
pub use self::scheduler::{Scheduler, WorkLauncher};
pub use self::snapshot_store::{Dependency, Preferences, Snapshot, SnapshotStore};
