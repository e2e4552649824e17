//! EngineCore - エンジンの各部品が共有する状態

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use super::config::Configuration;
use super::executor::BackgroundExecutor;
use super::progress::ProgressTracker;
use super::recovery::RecoveryReport;
use super::schedulers::Schedulers;
use crate::domain::{Constraints, Data, StoreError, WorkId, WorkState};
use crate::handler::{HandlerRegistry, MergerRegistry};
use crate::ports::{Clock, ConstraintTracker};
use crate::store::WorkDatabase;

pub(crate) struct EngineCore {
    pub(crate) db: Arc<WorkDatabase>,
    pub(crate) executor: BackgroundExecutor,
    pub(crate) handlers: HandlerRegistry,
    pub(crate) mergers: MergerRegistry,
    pub(crate) config: Configuration,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) constraints: Arc<dyn ConstraintTracker>,
    pub(crate) progress: ProgressTracker,
    /// Set once the processor exists; backends need it as their launcher.
    pub(crate) schedulers: OnceLock<Schedulers>,
    pub(crate) runtime: Handle,
    pub(crate) recovery: OnceLock<RecoveryReport>,
    shut_down: AtomicBool,
}

impl EngineCore {
    pub(crate) fn new(
        db: Arc<WorkDatabase>,
        executor: BackgroundExecutor,
        handlers: HandlerRegistry,
        mergers: MergerRegistry,
        config: Configuration,
        clock: Arc<dyn Clock>,
        constraints: Arc<dyn ConstraintTracker>,
        runtime: Handle,
    ) -> Self {
        Self {
            db,
            executor,
            handlers,
            mergers,
            config,
            clock,
            constraints,
            progress: ProgressTracker::new(),
            schedulers: OnceLock::new(),
            runtime,
            recovery: OnceLock::new(),
            shut_down: AtomicBool::new(false),
        }
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) fn constraints_met(&self, constraints: &Constraints) -> bool {
        constraints.all_met(|name| self.constraints.is_met(name))
    }

    pub(crate) fn schedulers(&self) -> Schedulers {
        self.schedulers.get().cloned().unwrap_or_else(Schedulers::empty)
    }

    /// Runs a schedule pass in place. Call from the background executor.
    pub(crate) fn schedule_pass(&self) -> Result<usize, StoreError> {
        self.release_finished_progress();
        self.schedulers()
            .schedule_pass(&self.db, self.config.max_scheduler_limit, self.now())
    }

    /// Closes progress channels of work that is finished or gone.
    pub(crate) fn release_finished_progress(&self) {
        let released = self.db.read(|tx| {
            self.progress
                .release_where(|id| tx.state(id).is_none_or(WorkState::is_finished))
        });
        if released > 0 {
            debug!(released, "progress channels released");
        }
    }

    /// Progress channel for `id`, opened early while the work can still run.
    /// Finished or unknown work gets a receiver whose sender is already gone.
    pub(crate) fn subscribe_progress(&self, id: WorkId) -> watch::Receiver<Data> {
        self.db.read(|tx| match tx.state(id) {
            Some(state) if !state.is_finished() => self.progress.subscribe(id),
            _ => watch::channel(Data::empty()).1,
        })
    }

    pub(crate) fn schedule_pass_logged(&self) {
        if let Err(err) = self.schedule_pass() {
            error!(error = %err, "schedule pass failed");
        }
    }

    /// Queues a schedule pass behind the pending store writes.
    pub(crate) fn request_schedule_pass(self: &Arc<Self>) {
        let core = Arc::clone(self);
        if let Err(err) = self.executor.execute(move || core.schedule_pass_logged()) {
            warn!(error = %err, "schedule pass not queued");
        }
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    pub(crate) fn mark_shut_down(&self) -> bool {
        !self.shut_down.swap(true, Ordering::AcqRel)
    }
}
