//! DelayedScheduler - 時刻ベースの遅延トリガー
//!
//! # 設計
//! - 期限順の min-heap（BinaryHeap + 逆順 Ord）
//! - キャンセルは遅延削除: id ごとに最新の seq だけを有効とし、古いエントリは pop 時に捨てる
//! - tokio タスクが「通知 OR 次の期限 OR 停止」を select! で待つ
//!
//! 初回遅延・バックオフ・周期ジョブを含め、すべての ENQUEUED レコードを受け付けます。

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::runtime::Handle;
use tokio::sync::{Notify, watch};
use tracing::{debug, trace, warn};

use crate::domain::{WorkId, WorkRecord, WorkState};
use crate::ports::{Clock, Scheduler, WorkLauncher};

/// Heap entry. Reverse ordering makes BinaryHeap a min-heap (earliest first).
#[derive(Debug, Clone, PartialEq, Eq)]
struct Timer {
    due: DateTime<Utc>,
    seq: u64,
    id: WorkId,
}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.due, other.seq).cmp(&(self.due, self.seq))
    }
}

#[derive(Debug, Default)]
struct TimerQueue {
    heap: BinaryHeap<Timer>,
    /// Live sequence number per id; anything else in the heap is a tombstone.
    pending: HashMap<WorkId, u64>,
    next_seq: u64,
}

impl TimerQueue {
    fn push(&mut self, id: WorkId, due: DateTime<Utc>) {
        self.next_seq += 1;
        self.pending.insert(id, self.next_seq);
        self.heap.push(Timer {
            due,
            seq: self.next_seq,
            id,
        });
    }

    fn cancel(&mut self, id: WorkId) -> bool {
        self.pending.remove(&id).is_some()
    }

    fn is_live(&self, timer: &Timer) -> bool {
        self.pending.get(&timer.id) == Some(&timer.seq)
    }

    fn next_due(&mut self) -> Option<DateTime<Utc>> {
        while let Some(top) = self.heap.peek() {
            if self.is_live(top) {
                return Some(top.due);
            }
            self.heap.pop();
        }
        None
    }

    fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<WorkId> {
        let mut due = Vec::new();
        while let Some(top) = self.heap.peek() {
            if self.is_live(top) && top.due > now {
                break;
            }
            if let Some(timer) = self.heap.pop()
                && self.pending.get(&timer.id) == Some(&timer.seq)
            {
                self.pending.remove(&timer.id);
                due.push(timer.id);
            }
        }
        due
    }

    fn len(&self) -> usize {
        self.pending.len()
    }
}

struct Shared {
    queue: Mutex<TimerQueue>,
    notify: Notify,
    launcher: Weak<dyn WorkLauncher>,
    clock: Arc<dyn Clock>,
    capacity: usize,
}

impl Shared {
    fn queue(&self) -> MutexGuard<'_, TimerQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct DelayedScheduler {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
}

impl DelayedScheduler {
    /// Spawns the timer task on `runtime`. At most `capacity` triggers are pending at once.
    pub fn spawn(
        launcher: Weak<dyn WorkLauncher>,
        clock: Arc<dyn Clock>,
        capacity: usize,
        runtime: &Handle,
    ) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(TimerQueue::default()),
            notify: Notify::new(),
            launcher,
            clock,
            capacity,
        });
        let (shutdown, shutdown_rx) = watch::channel(false);
        runtime.spawn(run_timer_loop(Arc::clone(&shared), shutdown_rx));
        Self { shared, shutdown }
    }

    /// Stops the timer task. Pending triggers are discarded.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn pending(&self) -> usize {
        self.shared.queue().len()
    }
}

impl Scheduler for DelayedScheduler {
    fn name(&self) -> &'static str {
        "delayed"
    }

    fn schedule(&self, records: &[WorkRecord]) {
        let mut batch: Vec<&WorkRecord> = records
            .iter()
            .filter(|record| record.state == WorkState::Enqueued)
            .collect();
        batch.sort_by_key(|record| record.next_run_time());

        let mut dropped = Vec::new();
        {
            let mut queue = self.shared.queue();
            for record in batch {
                if !queue.pending.contains_key(&record.id) && queue.len() >= self.shared.capacity {
                    dropped.push(record.id);
                    continue;
                }
                queue.push(record.id, record.next_run_time());
            }
        }
        if !dropped.is_empty() {
            warn!(
                dropped = dropped.len(),
                capacity = self.shared.capacity,
                "delayed scheduler is full, keeping the soonest-due work"
            );
        }
        self.shared.notify.notify_one();
    }

    fn cancel(&self, id: WorkId) {
        if self.shared.queue().cancel(id) {
            trace!(%id, "delayed trigger cancelled");
        }
    }

    fn shutdown(&self) {
        self.stop();
    }
}

async fn run_timer_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let now = shared.clock.now();
        let (due, next) = {
            let mut queue = shared.queue();
            (queue.pop_due(now), queue.next_due())
        };

        if !due.is_empty() {
            let Some(launcher) = shared.launcher.upgrade() else {
                break;
            };
            for id in due {
                let started = launcher.start_work(id);
                debug!(%id, started, "delayed trigger fired");
            }
            continue;
        }

        let wait = next.map(|due| (due - now).to_std().unwrap_or(Duration::ZERO));
        tokio::select! {
            _ = shared.notify.notified() => {}
            _ = sleep_or_forever(wait) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    debug!("delayed scheduler stopped");
}

async fn sleep_or_forever(wait: Option<Duration>) {
    match wait {
        Some(wait) => tokio::time::sleep(wait).await,
        None => std::future::pending().await,
    }
}
