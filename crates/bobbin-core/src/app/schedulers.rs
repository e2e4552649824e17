//! Schedulers - 登録済みバックエンドへの一斉配信と、全体の再スケジュールパス

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use crate::domain::{StoreError, WorkId};
use crate::ports::Scheduler;
use crate::store::WorkDatabase;

#[derive(Clone)]
pub struct Schedulers {
    backends: Arc<[Arc<dyn Scheduler>]>,
}

impl Schedulers {
    pub fn new(backends: Vec<Arc<dyn Scheduler>>) -> Self {
        Self {
            backends: backends.into(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.backends.iter().map(|backend| backend.name()).collect()
    }

    /// Marks the eligible batch as requested, then hands it to every backend.
    ///
    /// The marking commits before any backend sees the batch, so a record is handed out
    /// at most once per pass. Returns the batch size.
    pub fn schedule_pass(
        &self,
        db: &WorkDatabase,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let batch = db.transaction(|tx| {
            let mut batch = tx.eligible_for_scheduling(limit);
            for record in &mut batch {
                tx.update(record.id, |stored| stored.schedule_requested_at = Some(now));
                record.schedule_requested_at = Some(now);
            }
            Ok::<_, StoreError>(batch)
        })?;
        if batch.is_empty() {
            trace!("schedule pass found nothing eligible");
            return Ok(0);
        }
        debug!(records = batch.len(), "schedule pass");
        for backend in self.backends.iter() {
            backend.schedule(&batch);
        }
        Ok(batch.len())
    }

    pub fn cancel(&self, id: WorkId) {
        for backend in self.backends.iter() {
            backend.cancel(id);
        }
    }

    pub fn shutdown(&self) {
        for backend in self.backends.iter() {
            backend.shutdown();
        }
    }
}
