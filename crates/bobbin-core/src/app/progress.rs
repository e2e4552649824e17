//! ProgressTracker - 実行中ジョブの進捗チャネル
//!
//! `start_tracking` は冪等で、同じ id には同じチャネルを返します。
//! 終了済み・削除済みの id のチャネルは、再スケジュールパスごとに `release_where` で破棄されます。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use crate::domain::{Data, WorkId};

#[derive(Debug, Default)]
pub struct ProgressTracker {
    channels: Mutex<HashMap<WorkId, Arc<watch::Sender<Data>>>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<WorkId, Arc<watch::Sender<Data>>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn start_tracking(&self, id: WorkId) -> Arc<watch::Sender<Data>> {
        Arc::clone(
            self.channels()
                .entry(id)
                .or_insert_with(|| Arc::new(watch::channel(Data::empty()).0)),
        )
    }

    /// Closes the channel; subscribers keep the last value they saw.
    pub fn stop_tracking(&self, id: WorkId) {
        self.channels().remove(&id);
    }

    pub fn report(&self, id: WorkId, progress: Data) -> bool {
        match self.channels().get(&id) {
            Some(sender) => {
                sender.send_replace(progress);
                true
            }
            None => false,
        }
    }

    /// Subscribes to `id`, opening its channel ahead of the attempt if needed.
    /// Only call for work that can still run, or the channel waits for `release_where`.
    pub fn subscribe(&self, id: WorkId) -> watch::Receiver<Data> {
        self.start_tracking(id).subscribe()
    }

    /// Drops every channel whose id matches `finished`. Returns how many were dropped.
    pub fn release_where(&self, mut finished: impl FnMut(WorkId) -> bool) -> usize {
        let mut channels = self.channels();
        let before = channels.len();
        channels.retain(|id, _| !finished(*id));
        before - channels.len()
    }

    pub fn tracked_count(&self) -> usize {
        self.channels().len()
    }

    pub fn is_tracking(&self, id: WorkId) -> bool {
        self.channels().contains_key(&id)
    }
}
