//! 起動時リカバリ
//!
//! 前回のプロセスが正常終了しなかった場合（`preferences.running` が true のまま）を検出し、
//! RUNNING のまま取り残されたレコードを ENQUEUED に戻します。
//! インメモリのバックエンドはタイマーを失っているので、スケジュール済みの印もすべて消し、
//! 最後に再スケジュールパスを実行します。

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use super::engine_core::EngineCore;
use super::operation::Operation;
use crate::domain::{EngineError, StoreError, WorkId};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// The previous engine never marked the store as cleanly shut down.
    pub unclean_shutdown: bool,
    /// Records found RUNNING and put back to ENQUEUED.
    pub reset: Vec<WorkId>,
    /// Unfinished records whose schedule sentinel was cleared.
    pub unscheduled: usize,
}

pub(crate) fn recover(core: &EngineCore) -> Result<RecoveryReport, StoreError> {
    let report = core.db.transaction(|tx| {
        let unclean_shutdown = tx.preferences().running;
        let reset = tx.running_ids();
        for id in &reset {
            tx.update(*id, |record| record.reset_to_enqueued());
        }
        let unscheduled = tx.reset_scheduled_state();
        tx.preferences_mut().running = true;
        Ok::<_, StoreError>(RecoveryReport {
            unclean_shutdown,
            reset,
            unscheduled,
        })
    })?;

    if report.unclean_shutdown {
        warn!(
            reset = report.reset.len(),
            "previous engine did not shut down cleanly"
        );
    }
    if !report.reset.is_empty() {
        info!(ids = ?report.reset, "requeued work left running by the previous process");
    }
    core.schedule_pass()?;
    Ok(report)
}

/// Queues recovery on the background executor, ahead of anything else.
pub(crate) fn start(core: &Arc<EngineCore>) -> Result<Operation, EngineError> {
    let (completer, operation) = Operation::pending();
    let shared = Arc::clone(core);
    core.executor.execute(move || match recover(&shared) {
        Ok(report) => {
            info!(
                unclean_shutdown = report.unclean_shutdown,
                reset = report.reset.len(),
                "startup recovery finished"
            );
            let _ = shared.recovery.set(report);
            completer.succeed();
        }
        Err(err) => {
            warn!(error = %err, "startup recovery failed");
            completer.fail(err.to_string());
        }
    })?;
    Ok(operation)
}
