//! WorkDatabase - WorkRecord と依存関係の正本
//!
//! # 設計原則
//! - すべての読み書きは `Transaction` を通す（ロック = トランザクション境界）
//! - クロージャが `Err` を返すかパニックした場合、undo ジャーナルで全変更を巻き戻す
//! - コミット時にスナップショットを `SnapshotStore` へ書き出す（失敗時は巻き戻し）
//! - コミットごとにバージョンを進め、購読者（ステータスストリーム）へ変更を通知する

pub mod dependency;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::domain::{Data, StoreError, WorkId, WorkRecord, WorkState, WorkStatus};
use crate::ports::{Preferences, Snapshot, SnapshotStore};

pub use self::dependency::DependencyIndex;

#[derive(Debug, Default)]
struct Tables {
    records: HashMap<WorkId, WorkRecord>,
    index: DependencyIndex,
    preferences: Preferences,
}

impl Tables {
    fn from_snapshot(snapshot: Snapshot) -> Self {
        let mut tables = Tables {
            preferences: snapshot.preferences,
            ..Tables::default()
        };
        for record in snapshot.records {
            if let Some(name) = &record.unique_name {
                tables.index.add_name(name, record.id);
            }
            tables.records.insert(record.id, record);
        }
        for edge in snapshot.dependencies {
            if tables.records.contains_key(&edge.dependent)
                && tables.records.contains_key(&edge.prerequisite)
            {
                tables.index.add_dependency(edge.dependent, edge.prerequisite);
            } else {
                warn!(
                    dependent = %edge.dependent,
                    prerequisite = %edge.prerequisite,
                    "dropping dangling dependency from snapshot"
                );
            }
        }
        tables
    }

    fn to_snapshot(&self) -> Snapshot {
        let mut records: Vec<WorkRecord> = self.records.values().cloned().collect();
        records.sort_by_key(|record| record.id);
        Snapshot {
            records,
            dependencies: self.index.edges(),
            preferences: self.preferences.clone(),
        }
    }
}

pub struct WorkDatabase {
    tables: Mutex<Tables>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    version: watch::Sender<u64>,
}

impl WorkDatabase {
    /// A store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self::from_parts(Tables::default(), None)
    }

    /// Loads the last snapshot (if any) and writes through to `snapshots` on every commit.
    pub fn open(snapshots: Arc<dyn SnapshotStore>) -> Result<Self, StoreError> {
        let tables = match snapshots.load()? {
            Some(snapshot) => {
                debug!(records = snapshot.records.len(), "loaded work snapshot");
                Tables::from_snapshot(snapshot)
            }
            None => Tables::default(),
        };
        Ok(Self::from_parts(tables, Some(snapshots)))
    }

    fn from_parts(tables: Tables, snapshots: Option<Arc<dyn SnapshotStore>>) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            tables: Mutex::new(tables),
            snapshots,
            version,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        // A panicking transaction has already rolled itself back.
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` atomically. `Ok` commits, `Err` (or a panic) rolls everything back.
    pub fn transaction<R, E, F>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<R, E>,
        E: From<StoreError>,
    {
        let mut tx = Transaction::new(self.lock());
        let value = f(&mut tx)?;
        let dirty = tx.commit(self.snapshots.as_deref())?;
        if dirty {
            self.version.send_modify(|version| *version = version.wrapping_add(1));
        }
        Ok(value)
    }

    /// Read-only access. Nothing is journaled or persisted.
    pub fn read<R>(&self, f: impl FnOnce(&Transaction<'_>) -> R) -> R {
        let tx = Transaction::new(self.lock());
        f(&tx)
    }

    /// Ticks once per committed change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.lock().to_snapshot()
    }
}

#[derive(Debug, Default)]
struct Journal {
    /// First-touch value of every record written in this transaction.
    records: HashMap<WorkId, Option<WorkRecord>>,
    index: Option<DependencyIndex>,
    preferences: Option<Preferences>,
}

impl Journal {
    fn is_empty(&self) -> bool {
        self.records.is_empty() && self.index.is_none() && self.preferences.is_none()
    }
}

/// A unit of work against the store, holding the store lock for its lifetime.
pub struct Transaction<'a> {
    tables: MutexGuard<'a, Tables>,
    journal: Journal,
    finished: bool,
}

impl<'a> Transaction<'a> {
    fn new(tables: MutexGuard<'a, Tables>) -> Self {
        Self {
            tables,
            journal: Journal::default(),
            finished: false,
        }
    }

    fn commit(mut self, snapshots: Option<&dyn SnapshotStore>) -> Result<bool, StoreError> {
        let dirty = !self.journal.is_empty();
        if dirty && let Some(store) = snapshots {
            let snapshot = self.tables.to_snapshot();
            if let Err(err) = store.save(&snapshot) {
                self.rollback();
                self.finished = true;
                return Err(err);
            }
        }
        self.journal = Journal::default();
        self.finished = true;
        Ok(dirty)
    }

    fn rollback(&mut self) {
        let journal = std::mem::take(&mut self.journal);
        for (id, previous) in journal.records {
            match previous {
                Some(record) => {
                    self.tables.records.insert(id, record);
                }
                None => {
                    self.tables.records.remove(&id);
                }
            }
        }
        if let Some(index) = journal.index {
            self.tables.index = index;
        }
        if let Some(preferences) = journal.preferences {
            self.tables.preferences = preferences;
        }
    }

    fn touch(&mut self, id: WorkId) {
        if !self.journal.records.contains_key(&id) {
            let previous = self.tables.records.get(&id).cloned();
            self.journal.records.insert(id, previous);
        }
    }

    fn touch_index(&mut self) {
        if self.journal.index.is_none() {
            self.journal.index = Some(self.tables.index.clone());
        }
    }

    // ========================================
    // Reads
    // ========================================

    pub fn get(&self, id: WorkId) -> Option<&WorkRecord> {
        self.tables.records.get(&id)
    }

    pub fn state(&self, id: WorkId) -> Option<WorkState> {
        self.get(id).map(|record| record.state)
    }

    pub fn len(&self) -> usize {
        self.tables.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.records.is_empty()
    }

    pub fn all_ids(&self) -> Vec<WorkId> {
        self.sorted_ids(|_| true)
    }

    pub fn ids_for_tag(&self, tag: &str) -> Vec<WorkId> {
        self.sorted_ids(|record| record.tags.contains(tag))
    }

    pub fn ids_for_name(&self, name: &str) -> Vec<WorkId> {
        self.tables.index.ids_for_name(name)
    }

    pub fn unfinished_ids(&self) -> Vec<WorkId> {
        self.sorted_ids(|record| !record.state.is_finished())
    }

    pub fn running_ids(&self) -> Vec<WorkId> {
        self.sorted_ids(|record| record.state == WorkState::Running)
    }

    fn sorted_ids(&self, filter: impl Fn(&WorkRecord) -> bool) -> Vec<WorkId> {
        let mut ids: Vec<WorkId> = self
            .tables
            .records
            .values()
            .filter(|record| filter(record))
            .map(|record| record.id)
            .collect();
        ids.sort();
        ids
    }

    /// Statuses for the ids that still exist, in the given order.
    pub fn statuses(&self, ids: &[WorkId]) -> Vec<WorkStatus> {
        ids.iter()
            .filter_map(|id| self.get(*id))
            .map(WorkRecord::status)
            .collect()
    }

    pub fn prerequisites(&self, id: WorkId) -> Vec<WorkId> {
        self.tables.index.prerequisites_of(id)
    }

    pub fn dependents(&self, id: WorkId) -> Vec<WorkId> {
        self.tables.index.dependents_of(id)
    }

    pub fn has_dependents(&self, id: WorkId) -> bool {
        self.tables.index.has_dependents(id)
    }

    pub fn transitive_dependents(&self, id: WorkId) -> Vec<WorkId> {
        self.tables.index.transitive_dependents(id)
    }

    /// Pruned prerequisites no longer hold anything back.
    pub fn has_completed_all_prerequisites(&self, id: WorkId) -> bool {
        self.prerequisites(id)
            .into_iter()
            .all(|prerequisite| match self.state(prerequisite) {
                Some(state) => state == WorkState::Succeeded,
                None => true,
            })
    }

    pub fn prerequisite_outputs(&self, id: WorkId) -> Vec<Data> {
        self.prerequisites(id)
            .into_iter()
            .filter_map(|prerequisite| self.get(prerequisite))
            .map(|record| record.output.clone())
            .collect()
    }

    /// ENQUEUED records not yet handed to the backends, oldest period first.
    ///
    /// At most `limit` records may be scheduled-but-unfinished at once, so the batch
    /// shrinks by however many are already out there.
    pub fn eligible_for_scheduling(&self, limit: usize) -> Vec<WorkRecord> {
        let outstanding = self
            .tables
            .records
            .values()
            .filter(|record| record.schedule_requested_at.is_some() && !record.state.is_finished())
            .count();
        let available = limit.saturating_sub(outstanding);
        if available == 0 {
            return Vec::new();
        }
        let mut eligible: Vec<&WorkRecord> = self
            .tables
            .records
            .values()
            .filter(|record| {
                record.state == WorkState::Enqueued && record.schedule_requested_at.is_none()
            })
            .collect();
        eligible.sort_by_key(|record| (record.period_start_time, record.id));
        eligible.into_iter().take(available).cloned().collect()
    }

    pub fn detect_cycle(&self) -> Option<Vec<WorkId>> {
        self.tables.index.detect_cycle()
    }

    pub fn preferences(&self) -> &Preferences {
        &self.tables.preferences
    }

    // ========================================
    // Writes
    // ========================================

    pub fn insert(&mut self, record: WorkRecord) -> Result<(), StoreError> {
        let id = record.id;
        if self.tables.records.contains_key(&id) {
            return Err(StoreError::DuplicateId(id));
        }
        self.touch(id);
        if let Some(name) = &record.unique_name {
            let name = name.clone();
            self.touch_index();
            self.tables.index.add_name(&name, id);
        }
        self.tables.records.insert(id, record);
        Ok(())
    }

    /// Applies `f` to the record. Returns false when it does not exist.
    pub fn update(&mut self, id: WorkId, f: impl FnOnce(&mut WorkRecord)) -> bool {
        if !self.tables.records.contains_key(&id) {
            return false;
        }
        self.touch(id);
        match self.tables.records.get_mut(&id) {
            Some(record) => {
                f(record);
                true
            }
            None => false,
        }
    }

    /// Removes the record with its edges and name memberships.
    pub fn delete(&mut self, id: WorkId) -> Option<WorkRecord> {
        if !self.tables.records.contains_key(&id) {
            return None;
        }
        self.touch(id);
        self.touch_index();
        self.tables.index.remove_work(id);
        self.tables.records.remove(&id)
    }

    pub fn add_dependency(&mut self, dependent: WorkId, prerequisite: WorkId) {
        self.touch_index();
        self.tables.index.add_dependency(dependent, prerequisite);
    }

    /// Clears the schedule sentinel on every unfinished record. Returns how many changed.
    pub fn reset_scheduled_state(&mut self) -> usize {
        let scheduled = self.sorted_ids(|record| {
            record.schedule_requested_at.is_some() && !record.state.is_finished()
        });
        for id in &scheduled {
            self.update(*id, |record| record.schedule_requested_at = None);
        }
        scheduled.len()
    }

    pub fn preferences_mut(&mut self) -> &mut Preferences {
        if self.journal.preferences.is_none() {
            self.journal.preferences = Some(self.tables.preferences.clone());
        }
        &mut self.tables.preferences
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished && !self.journal.is_empty() {
            self.rollback();
        }
    }
}
