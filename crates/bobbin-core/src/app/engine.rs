//! WorkEngine - 呼び出し側から見たエンジンの表面
//!
//! # 設計原則
//! - 書き込みはすべてバックグラウンド実行器に直列化し、結果は `Operation` で返す
//! - 呼び出し側の誤用（空のリスト、巨大な入力）は同期的に `Err` で返す
//! - 一度きりの問い合わせは同期、ストリームは `watch::Receiver`
//!
//! `WorkEngine` は安価に Clone でき、すべての Clone が同じエンジンを指します。

use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::config::Configuration;
use super::continuation::{self, ContinuationNode, WorkContinuation, validate_requests};
use super::engine_core::EngineCore;
use super::observer::observe;
use super::operation::Operation;
use super::processor::{ExecutionListener, Processor};
use super::recovery::{self, RecoveryReport};
use super::transitions;
use crate::domain::{
    Data, EngineError, ExistingPeriodicWorkPolicy, ExistingWorkPolicy, StoreError, WorkId,
    WorkRecord, WorkRequest, WorkState, WorkStatus,
};
use crate::ports::WorkLauncher;
use crate::store::Transaction;

struct EngineInner {
    core: Arc<EngineCore>,
    processor: Arc<Processor>,
    recovery: Operation,
}

#[derive(Clone)]
pub struct WorkEngine {
    inner: Arc<EngineInner>,
}

/// Puts an interrupted attempt back in line unless it reached a terminal state.
struct RescheduleInterrupted {
    core: Arc<EngineCore>,
    processor: Weak<Processor>,
}

impl ExecutionListener for RescheduleInterrupted {
    fn on_executed(&self, id: WorkId, needs_reschedule: bool) {
        if !needs_reschedule {
            return;
        }
        let Some(processor) = self.processor.upgrade() else {
            return;
        };
        if processor.is_shutting_down() {
            return;
        }
        let core = Arc::clone(&self.core);
        let queued = self.core.executor.execute(move || {
            // A rerun may already own the id again.
            if processor.is_running(id) {
                return;
            }
            let reset = core.db.transaction(|tx| {
                let reset = tx.state(id) == Some(WorkState::Running)
                    && tx.update(id, WorkRecord::reset_to_enqueued);
                Ok::<_, StoreError>(reset)
            });
            match reset {
                Ok(true) => debug!(%id, "interrupted work put back in line"),
                Ok(false) => {}
                Err(err) => warn!(%id, error = %err, "could not requeue interrupted work"),
            }
            core.schedule_pass_logged();
        });
        if let Err(err) = queued {
            debug!(%id, error = %err, "reschedule not queued");
        }
    }
}

impl WorkEngine {
    /// Wires the listener and queues startup recovery ahead of any caller operation.
    pub(crate) fn start(core: Arc<EngineCore>, processor: Arc<Processor>) -> Result<Self, EngineError> {
        processor.add_listener(Arc::new(RescheduleInterrupted {
            core: Arc::clone(&core),
            processor: Arc::downgrade(&processor),
        }));
        let recovery = recovery::start(&core)?;
        info!(schedulers = ?core.schedulers().names(), "work engine started");
        Ok(Self {
            inner: Arc::new(EngineInner {
                core,
                processor,
                recovery,
            }),
        })
    }

    pub(crate) fn core(&self) -> &Arc<EngineCore> {
        &self.inner.core
    }

    pub(crate) fn processor(&self) -> &Arc<Processor> {
        &self.inner.processor
    }

    pub(crate) fn same_engine(&self, other: &WorkEngine) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// `listener` hears about every finished execution, after the engine's own bookkeeping.
    pub fn add_execution_listener(&self, listener: Arc<dyn ExecutionListener>) {
        self.inner.processor.add_listener(listener);
    }

    pub fn configuration(&self) -> &Configuration {
        &self.inner.core.config
    }

    /// Completes once startup recovery has run.
    pub fn recovery(&self) -> Operation {
        self.inner.recovery.clone()
    }

    pub fn recovery_report(&self) -> Option<RecoveryReport> {
        self.inner.core.recovery.get().cloned()
    }

    fn submit<F>(&self, operation: &'static str, job: F) -> Operation
    where
        F: FnOnce(&EngineCore, &Processor) -> Result<(), EngineError> + Send + 'static,
    {
        if self.inner.core.is_shut_down() {
            return Operation::failed(EngineError::ShuttingDown.to_string());
        }
        let (completer, pending) = Operation::pending();
        let core = Arc::clone(&self.inner.core);
        let processor = Arc::clone(&self.inner.processor);
        let queued = self.inner.core.executor.execute(move || {
            let result = job(&core, &processor);
            if let Err(err) = &result {
                warn!(operation, error = %err, "operation failed");
            }
            completer.finish(result);
        });
        match queued {
            Ok(()) => pending,
            Err(err) => Operation::failed(err.to_string()),
        }
    }

    // ========================================
    // 投入
    // ========================================

    /// Enqueues independent requests. Periodic requests are allowed here.
    pub fn enqueue(&self, requests: Vec<WorkRequest>) -> Result<Operation, EngineError> {
        validate_requests("enqueue", &requests, true)?;
        let node = ContinuationNode::new(None, ExistingWorkPolicy::Keep, requests, Vec::new());
        Ok(self.enqueue_node(Arc::new(node)))
    }

    pub(crate) fn enqueue_node(&self, node: Arc<ContinuationNode>) -> Operation {
        self.submit("enqueue", move |core, processor| {
            continuation::enqueue_graph(core, processor, &node)
        })
    }

    /// Starts a chain. Nothing is stored until `enqueue` is called on the result.
    pub fn begin_with(&self, requests: Vec<WorkRequest>) -> Result<WorkContinuation, EngineError> {
        validate_requests("begin_with", &requests, false)?;
        let node = ContinuationNode::new(None, ExistingWorkPolicy::Keep, requests, Vec::new());
        Ok(WorkContinuation::new(self.clone(), node))
    }

    /// Starts a chain under `name`; `policy` decides what happens to existing work under it.
    pub fn begin_unique_work(
        &self,
        name: impl Into<String>,
        policy: ExistingWorkPolicy,
        requests: Vec<WorkRequest>,
    ) -> Result<WorkContinuation, EngineError> {
        validate_requests("begin_unique_work", &requests, false)?;
        let node = ContinuationNode::new(Some(name.into()), policy, requests, Vec::new());
        Ok(WorkContinuation::new(self.clone(), node))
    }

    pub fn enqueue_unique_work(
        &self,
        name: impl Into<String>,
        policy: ExistingWorkPolicy,
        requests: Vec<WorkRequest>,
    ) -> Result<Operation, EngineError> {
        Ok(self.begin_unique_work(name, policy, requests)?.enqueue())
    }

    pub fn enqueue_unique_periodic_work(
        &self,
        name: impl Into<String>,
        policy: ExistingPeriodicWorkPolicy,
        request: WorkRequest,
    ) -> Result<Operation, EngineError> {
        if !request.is_periodic() {
            return Err(EngineError::InvalidRequest(format!(
                "'{}' is not periodic work",
                request.handler()
            )));
        }
        let requests = vec![request];
        validate_requests("enqueue_unique_periodic_work", &requests, true)?;
        let node = ContinuationNode::new(Some(name.into()), policy.into(), requests, Vec::new());
        Ok(self.enqueue_node(Arc::new(node)))
    }

    // ========================================
    // キャンセル・整理
    // ========================================

    /// Cancels the selected records and everything that depends on them.
    fn cancel_where<F>(&self, operation: &'static str, select: F) -> Operation
    where
        F: FnOnce(&mut Transaction<'_>, DateTime<Utc>) -> Vec<WorkId> + Send + 'static,
    {
        self.submit(operation, move |core, processor| {
            let now = core.now();
            let cancelled = core.db.transaction(|tx| {
                let mut cancelled = Vec::new();
                for id in select(tx, now) {
                    cancelled.extend(transitions::cancel_with_dependents(tx, id));
                }
                Ok::<_, StoreError>(cancelled)
            })?;
            let schedulers = core.schedulers();
            for id in &cancelled {
                processor.stop_work(*id);
                schedulers.cancel(*id);
            }
            info!(operation, cancelled = cancelled.len(), "work cancelled");
            core.schedule_pass()?;
            Ok(())
        })
    }

    pub fn cancel_work_by_id(&self, id: WorkId) -> Operation {
        self.cancel_where("cancel_work_by_id", move |_, _| vec![id])
    }

    pub fn cancel_all_work_by_tag(&self, tag: impl Into<String>) -> Operation {
        let tag = tag.into();
        self.cancel_where("cancel_all_work_by_tag", move |tx, _| tx.ids_for_tag(&tag))
    }

    pub fn cancel_unique_work(&self, name: impl Into<String>) -> Operation {
        let name = name.into();
        self.cancel_where("cancel_unique_work", move |tx, _| tx.ids_for_name(&name))
    }

    /// Cancels every unfinished record and stamps the cancel-all time.
    pub fn cancel_all_work(&self) -> Operation {
        self.cancel_where("cancel_all_work", |tx, now| {
            tx.preferences_mut().last_cancel_all_at = Some(now);
            tx.unfinished_ids()
        })
    }

    /// Deletes finished records that nothing unfinished still depends on.
    pub fn prune_work(&self) -> Operation {
        self.submit("prune_work", |core, _| {
            let pruned = core.db.transaction(|tx| {
                let prunable: Vec<WorkId> = tx
                    .all_ids()
                    .into_iter()
                    .filter(|id| {
                        tx.state(*id).is_some_and(|state| state.is_finished())
                            && tx.dependents(*id).iter().all(|dependent| {
                                tx.state(*dependent).is_none_or(|state| state.is_finished())
                            })
                    })
                    .collect();
                for id in &prunable {
                    tx.delete(*id);
                }
                Ok::<_, StoreError>(prunable.len())
            })?;
            core.release_finished_progress();
            info!(pruned, "finished work pruned");
            Ok(())
        })
    }

    /// Clears every schedule sentinel and hands unfinished work to the backends again.
    pub fn reschedule_eligible_work(&self) -> Operation {
        self.submit("reschedule_eligible_work", |core, _| {
            let reset = core
                .db
                .transaction(|tx| Ok::<_, StoreError>(tx.reset_scheduled_state()))?;
            debug!(reset, "schedule sentinels cleared");
            core.schedule_pass()?;
            Ok(())
        })
    }

    // ========================================
    // 問い合わせ
    // ========================================

    pub fn status_by_id(&self, id: WorkId) -> Option<WorkStatus> {
        self.inner.core.db.read(|tx| tx.get(id).map(WorkRecord::status))
    }

    pub fn statuses_by_tag(&self, tag: &str) -> Vec<WorkStatus> {
        self.inner.core.db.read(|tx| tx.statuses(&tx.ids_for_tag(tag)))
    }

    pub fn statuses_for_unique_work(&self, name: &str) -> Vec<WorkStatus> {
        self.inner.core.db.read(|tx| tx.statuses(&tx.ids_for_name(name)))
    }

    /// Statuses of the ids that exist, in the order given.
    pub fn statuses_by_ids(&self, ids: &[WorkId]) -> Vec<WorkStatus> {
        self.inner.core.db.read(|tx| tx.statuses(ids))
    }

    pub fn last_cancel_all_time(&self) -> Option<DateTime<Utc>> {
        self.inner
            .core
            .db
            .read(|tx| tx.preferences().last_cancel_all_at)
    }

    pub fn observe_status_by_id(&self, id: WorkId) -> watch::Receiver<Option<WorkStatus>> {
        self.observe(move |tx| tx.get(id).map(WorkRecord::status))
    }

    pub fn observe_statuses_by_tag(&self, tag: impl Into<String>) -> watch::Receiver<Vec<WorkStatus>> {
        let tag = tag.into();
        self.observe(move |tx| tx.statuses(&tx.ids_for_tag(&tag)))
    }

    pub fn observe_statuses_for_unique_work(
        &self,
        name: impl Into<String>,
    ) -> watch::Receiver<Vec<WorkStatus>> {
        let name = name.into();
        self.observe(move |tx| tx.statuses(&tx.ids_for_name(&name)))
    }

    pub(crate) fn observe_statuses_by_ids(&self, ids: Vec<WorkId>) -> watch::Receiver<Vec<WorkStatus>> {
        self.observe(move |tx| tx.statuses(&ids))
    }

    pub fn observe_last_cancel_all_time(&self) -> watch::Receiver<Option<DateTime<Utc>>> {
        self.observe(|tx| tx.preferences().last_cancel_all_at)
    }

    /// Progress reported by the running attempt of `id`. The channel closes when the attempt ends.
    /// For unknown or finished work the channel is already closed.
    pub fn observe_progress(&self, id: WorkId) -> watch::Receiver<Data> {
        self.inner.core.subscribe_progress(id)
    }

    fn observe<T, F>(&self, query: F) -> watch::Receiver<T>
    where
        T: PartialEq + Send + Sync + 'static,
        F: Fn(&Transaction<'_>) -> T + Send + 'static,
    {
        let core = &self.inner.core;
        observe(Arc::clone(&core.db), &core.runtime, query)
    }

    // ========================================
    // 停止
    // ========================================

    /// Interrupts running work, stops the backends and marks the store as cleanly closed.
    /// Later calls do nothing.
    pub async fn shutdown(&self) {
        let core = &self.inner.core;
        if !core.mark_shut_down() {
            return;
        }
        info!("work engine shutting down");
        self.inner
            .processor
            .shutdown(core.config.stop_grace_period())
            .await;
        core.schedulers().shutdown();

        let closing = Arc::clone(core);
        let marked = core
            .executor
            .run(move || {
                closing.db.transaction(|tx| {
                    tx.preferences_mut().running = false;
                    Ok::<_, StoreError>(())
                })
            })
            .await
            .and_then(|result| result.map_err(EngineError::from));
        if let Err(err) = marked {
            warn!(error = %err, "could not mark the store as cleanly closed");
        }
        core.executor.close();
        info!("work engine stopped");
    }
}
