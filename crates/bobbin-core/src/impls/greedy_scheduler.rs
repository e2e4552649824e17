//! GreedyScheduler - 即時ディスパッチ（プロセス内の高速経路）と条件トリガー
//!
//! 今すぐ実行できる一回限りのジョブだけを拾い、Processor に直接渡します。
//! 遅延・バックオフ中・周期ジョブは他のバックエンドに任せます。
//!
//! 実行条件付きのジョブは種類を問わず手元に保持し、`ConstraintTracker` の変化を監視します。
//! - 条件が揃った時点で期限が来ていれば起動する
//! - 条件が崩れたら実行中の試行を止める（試行側で RETRY 扱いになる）

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::domain::{Constraints, WorkId, WorkRecord, WorkState};
use crate::ports::{Clock, ConstraintTracker, Scheduler, WorkLauncher};

struct Held {
    constraints: Constraints,
    due: DateTime<Utc>,
    met: bool,
}

struct Shared {
    launcher: Weak<dyn WorkLauncher>,
    clock: Arc<dyn Clock>,
    tracker: Arc<dyn ConstraintTracker>,
    held: Mutex<HashMap<WorkId, Held>>,
}

impl Shared {
    fn held(&self) -> MutexGuard<'_, HashMap<WorkId, Held>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn all_met(&self, constraints: &Constraints) -> bool {
        constraints.all_met(|name| self.tracker.is_met(name))
    }

    /// Starts held work whose conditions just came true, stops work whose conditions broke.
    fn on_constraints_changed(&self) {
        let Some(launcher) = self.launcher.upgrade() else {
            return;
        };
        let now = self.clock.now();
        let mut start = Vec::new();
        let mut stop = Vec::new();
        for (id, held) in self.held().iter_mut() {
            let met = self.all_met(&held.constraints);
            match (held.met, met) {
                (false, true) if held.due <= now => start.push(*id),
                (true, false) => stop.push(*id),
                _ => {}
            }
            held.met = met;
        }
        for id in stop {
            if launcher.stop_work(id) {
                info!(%id, "constraints no longer met, stopping work");
            }
        }
        for id in start {
            let started = launcher.start_work(id);
            debug!(%id, started, "constraints met");
        }
    }
}

pub struct GreedyScheduler {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
}

impl GreedyScheduler {
    /// Without a watcher task constrained work is only re-checked on the next `schedule`.
    pub fn new(
        launcher: Weak<dyn WorkLauncher>,
        clock: Arc<dyn Clock>,
        tracker: Arc<dyn ConstraintTracker>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                launcher,
                clock,
                tracker,
                held: Mutex::new(HashMap::new()),
            }),
            shutdown: watch::channel(false).0,
        }
    }

    /// Like `new`, plus a task on `runtime` that reacts to constraint changes.
    pub fn spawn(
        launcher: Weak<dyn WorkLauncher>,
        clock: Arc<dyn Clock>,
        tracker: Arc<dyn ConstraintTracker>,
        runtime: &Handle,
    ) -> Self {
        let scheduler = Self::new(launcher, clock, tracker);
        let changes = scheduler.shared.tracker.changes();
        runtime.spawn(watch_constraints(
            Arc::clone(&scheduler.shared),
            changes,
            scheduler.shutdown.subscribe(),
        ));
        scheduler
    }

    /// Constrained records currently held.
    pub fn held(&self) -> usize {
        self.shared.held().len()
    }
}

impl Scheduler for GreedyScheduler {
    fn name(&self) -> &'static str {
        "greedy"
    }

    fn schedule(&self, records: &[WorkRecord]) {
        let Some(launcher) = self.shared.launcher.upgrade() else {
            return;
        };
        let now = self.shared.clock.now();
        for record in records {
            if record.state != WorkState::Enqueued {
                continue;
            }
            if record.is_constrained() {
                let met = self.shared.all_met(&record.constraints);
                self.shared.held().insert(
                    record.id,
                    Held {
                        constraints: record.constraints.clone(),
                        due: record.next_run_time(),
                        met,
                    },
                );
                if !met {
                    debug!(id = %record.id, "held until its constraints are met");
                    continue;
                }
            }
            if !record.is_periodic() && record.next_run_time() <= now {
                let started = launcher.start_work(record.id);
                debug!(id = %record.id, started, "greedy dispatch");
            }
        }
    }

    fn cancel(&self, id: WorkId) {
        self.shared.held().remove(&id);
        if let Some(launcher) = self.shared.launcher.upgrade() {
            launcher.stop_work(id);
        }
    }

    fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

async fn watch_constraints(
    shared: Arc<Shared>,
    mut changes: watch::Receiver<u64>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                shared.on_constraints_changed();
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("greedy constraint watcher stopped");
}
