//! Processor - 実行中ジョブの管理
//!
//! # 設計原則
//! - 同じ id の WorkRunner は同時に 1 つだけ（重複トリガーは無視し、必要なら終了後に再実行）
//! - 同時実行数は Semaphore で制限する
//! - 停止は協調的: watch チャネルで割り込みを通知するだけで、強制終了は WorkRunner に任せる

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{Notify, Semaphore, watch};
use tracing::{debug, info, warn};

use super::engine_core::EngineCore;
use super::runner::WorkRunner;
use crate::domain::WorkId;
use crate::ports::WorkLauncher;

/// Told about every finished execution.
pub trait ExecutionListener: Send + Sync {
    fn on_executed(&self, id: WorkId, needs_reschedule: bool);
}

struct RunningWork {
    interrupt: watch::Sender<bool>,
    /// A trigger arrived while this attempt was in flight.
    rerun_requested: bool,
}

pub struct Processor {
    core: Arc<EngineCore>,
    me: Weak<Processor>,
    running: Mutex<HashMap<WorkId, RunningWork>>,
    permits: Arc<Semaphore>,
    listeners: Mutex<Vec<Arc<dyn ExecutionListener>>>,
    shutting_down: AtomicBool,
    idle: Notify,
}

impl Processor {
    pub(crate) fn new(core: Arc<EngineCore>) -> Arc<Self> {
        let permits = Arc::new(Semaphore::new(core.config.max_concurrent_workers));
        Arc::new_cyclic(|me| Self {
            core,
            me: me.clone(),
            running: Mutex::new(HashMap::new()),
            permits,
            listeners: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
            idle: Notify::new(),
        })
    }

    fn running(&self) -> MutexGuard<'_, HashMap<WorkId, RunningWork>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_listener(&self, listener: Arc<dyn ExecutionListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn is_running(&self, id: WorkId) -> bool {
        self.running().contains_key(&id)
    }

    pub fn running_count(&self) -> usize {
        self.running().len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    fn on_finished(&self, id: WorkId, needs_reschedule: bool) {
        let rerun = {
            let mut running = self.running();
            let rerun = running
                .remove(&id)
                .is_some_and(|work| work.rerun_requested);
            if running.is_empty() {
                self.idle.notify_waiters();
            }
            rerun
        };
        debug!(%id, needs_reschedule, "execution finished");

        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener.on_executed(id, needs_reschedule);
        }

        if rerun && !self.is_shutting_down() {
            debug!(%id, "re-running for a trigger that arrived mid-attempt");
            self.start_work(id);
        }
    }

    /// Interrupts everything and waits up to `grace` (plus a little slack) for it to wind down.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutting_down.store(true, Ordering::Release);
        let interrupted = {
            let running = self.running();
            for work in running.values() {
                work.interrupt.send_replace(true);
            }
            running.len()
        };
        if interrupted > 0 {
            info!(interrupted, "interrupting running work for shutdown");
        }

        let deadline = tokio::time::Instant::now() + grace + Duration::from_millis(500);
        loop {
            let idle = self.idle.notified();
            if self.running_count() == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, idle).await.is_err() {
                warn!(still_running = self.running_count(), "shutdown grace period elapsed");
                break;
            }
        }
    }
}

impl WorkLauncher for Processor {
    fn start_work(&self, id: WorkId) -> bool {
        if self.is_shutting_down() {
            debug!(%id, "not starting work during shutdown");
            return false;
        }
        let Some(me) = self.me.upgrade() else {
            return false;
        };
        let interrupt = {
            let mut running = self.running();
            if let Some(work) = running.get_mut(&id) {
                work.rerun_requested = true;
                debug!(%id, "already running, trigger deferred");
                return false;
            }
            let (interrupt, rx) = watch::channel(false);
            running.insert(
                id,
                RunningWork {
                    interrupt,
                    rerun_requested: false,
                },
            );
            rx
        };

        let core = Arc::clone(&self.core);
        let permits = Arc::clone(&self.permits);
        self.core.runtime.spawn(async move {
            let needs_reschedule = match permits.acquire_owned().await {
                Ok(_permit) => WorkRunner::new(core, id, interrupt).run().await,
                Err(_) => false,
            };
            me.on_finished(id, needs_reschedule);
        });
        true
    }

    fn stop_work(&self, id: WorkId) -> bool {
        match self.running().get_mut(&id) {
            Some(work) => {
                work.rerun_requested = false;
                let already = work.interrupt.send_replace(true);
                if !already {
                    debug!(%id, "stop requested");
                }
                true
            }
            None => false,
        }
    }
}
