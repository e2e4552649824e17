//! Transitions - WorkRecord の状態遷移
//!
//! # 設計原則
//! - すべての関数は呼び出し側のトランザクション内で動く（1 遷移 = 1 トランザクション）
//! - 失敗とキャンセルの伝播は依存インデックス上のワークリストで辿る（再帰しない）
//! - 周期ジョブは終端状態に到達せず、次の周期へリセットされる
//!
//! ```text
//! BLOCKED ──(前提がすべて SUCCEEDED)──> ENQUEUED ──> RUNNING ──> SUCCEEDED
//!    │                                    ^   │          │
//!    │                                    └───┼── RETRY ─┤
//!    │                                        │          └──> FAILED ──> 依存先も FAILED
//!    └──────────────── CANCELLED <────────────┴── (未完了ならいつでも)
//! ```

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::domain::{Data, WorkId, WorkResult, WorkState};
use crate::store::Transaction;

/// What applying an attempt's result did to the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Applied {
    pub needs_reschedule: bool,
    pub finished: bool,
}

/// ENQUEUED -> RUNNING. Anything else means another actor got there first.
pub(crate) fn try_set_running(tx: &mut Transaction<'_>, id: WorkId) -> bool {
    if tx.state(id) != Some(WorkState::Enqueued) {
        return false;
    }
    tx.update(id, |record| record.start_attempt())
}

/// RUNNING -> SUCCEEDED, then unblocks dependents whose prerequisites all succeeded.
pub(crate) fn set_succeeded(
    tx: &mut Transaction<'_>,
    id: WorkId,
    output: Data,
    now: DateTime<Utc>,
) -> Vec<WorkId> {
    tx.update(id, |record| record.mark_succeeded(output));
    let mut unblocked = Vec::new();
    for dependent in tx.dependents(id) {
        if tx.state(dependent) == Some(WorkState::Blocked)
            && tx.has_completed_all_prerequisites(dependent)
        {
            tx.update(dependent, |record| record.unblock(now));
            unblocked.push(dependent);
        }
    }
    if !unblocked.is_empty() {
        debug!(%id, unblocked = unblocked.len(), "dependents unblocked");
    }
    unblocked
}

/// FAILED for `id` and every unfinished transitive dependent. Only `id` gets `output`.
pub(crate) fn fail_with_dependents(
    tx: &mut Transaction<'_>,
    id: WorkId,
    output: Option<Data>,
) -> Vec<WorkId> {
    let mut failed = Vec::new();
    if tx.update(id, |record| record.mark_failed(output)) {
        failed.push(id);
    }
    for dependent in tx.transitive_dependents(id) {
        if tx.state(dependent).is_some_and(|state| !state.is_finished()) {
            tx.update(dependent, |record| record.mark_failed(None));
            failed.push(dependent);
        }
    }
    if failed.len() > 1 {
        info!(%id, dependents = failed.len() - 1, "failure cascaded to dependents");
    }
    failed
}

/// Back to ENQUEUED with backoff; the schedule sentinel is cleared for the next pass.
pub(crate) fn retry(tx: &mut Transaction<'_>, id: WorkId, now: DateTime<Utc>) -> bool {
    tx.update(id, |record| record.requeue_for_retry(now))
}

pub(crate) fn reset_periodic(tx: &mut Transaction<'_>, id: WorkId) -> bool {
    tx.update(id, |record| record.advance_period())
}

/// CANCELLED for `id` and its transitive dependents, skipping finished records.
/// Returns the ids that changed.
pub(crate) fn cancel_with_dependents(tx: &mut Transaction<'_>, id: WorkId) -> Vec<WorkId> {
    let mut cancelled = Vec::new();
    let mut targets = vec![id];
    targets.extend(tx.transitive_dependents(id));
    for target in targets {
        if tx.state(target).is_some_and(|state| !state.is_finished()) {
            tx.update(target, |record| record.mark_cancelled());
            cancelled.push(target);
        }
    }
    cancelled
}

/// Maps a RUNNING record's attempt result onto its next state.
pub(crate) fn apply_result(
    tx: &mut Transaction<'_>,
    id: WorkId,
    result: WorkResult,
    now: DateTime<Utc>,
) -> Applied {
    let periodic = tx.get(id).is_some_and(|record| record.is_periodic());
    match result {
        WorkResult::Success(_) | WorkResult::Failure(_) if periodic => {
            reset_periodic(tx, id);
            Applied {
                needs_reschedule: false,
                finished: false,
            }
        }
        WorkResult::Success(output) => {
            set_succeeded(tx, id, output, now);
            Applied {
                needs_reschedule: false,
                finished: true,
            }
        }
        WorkResult::Failure(output) => {
            fail_with_dependents(tx, id, Some(output));
            Applied {
                needs_reschedule: false,
                finished: true,
            }
        }
        WorkResult::Retry => {
            retry(tx, id, now);
            Applied {
                needs_reschedule: true,
                finished: false,
            }
        }
    }
}
