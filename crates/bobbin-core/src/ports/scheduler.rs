//! Scheduler port - 外部トリガー機構の抽象化
//!
//! 複数のバックエンド（即時ディスパッチ、遅延タイマーなど）が共存します。
//! バックエンドは「いつ起動するか」だけを決め、実行そのものは
//! `WorkLauncher`（Processor）に委ねます。

use crate::domain::{WorkId, WorkRecord};

pub trait Scheduler: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Best-effort: arrange for each record to run once it is due.
    fn schedule(&self, records: &[WorkRecord]);

    /// Best-effort: drop any pending trigger. Safe for ids this backend never saw.
    fn cancel(&self, id: WorkId);

    /// Called once when the engine shuts down.
    fn shutdown(&self) {}
}

/// Starts and stops executions. Implemented by the processor.
pub trait WorkLauncher: Send + Sync {
    /// Returns false when the id is already running or the launcher is shutting down.
    fn start_work(&self, id: WorkId) -> bool;

    /// Signals a cooperative stop. Returns false when the id is not running.
    fn stop_work(&self, id: WorkId) -> bool;
}
