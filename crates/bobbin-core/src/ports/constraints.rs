//! ConstraintTracker port - 名前付き条件の現在値と変化通知
//!
//! ネットワーク・充電状態などプラットフォーム固有の監視はこの trait の外側で行い、
//! エンジンは「条件名 → 今満たされているか」だけを見ます。

use tokio::sync::watch;

pub trait ConstraintTracker: Send + Sync {
    /// Whether the named condition holds right now. Unknown names never hold.
    fn is_met(&self, condition: &str) -> bool;

    /// Ticks whenever any condition changes.
    fn changes(&self) -> watch::Receiver<u64>;
}
