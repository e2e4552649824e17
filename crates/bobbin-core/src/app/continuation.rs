//! WorkContinuation - enqueue 前のジョブ DAG
//!
//! `begin_with` / `then` / `combine` で組み立て、`enqueue` で 1 トランザクションに平坦化します。
//! 永続化した後は依存インデックスが唯一の正本で、このグラフは捨てられます。
//!
//! # 一意名ポリシー（名前付きで前提を持たない根ノードにだけ適用）
//! - KEEP: 未完了のレコードが 1 つでもあれば、このグラフ全体が何もしない
//! - REPLACE: 既存のレコードをキャンセルして削除してから挿入する
//! - APPEND: 既存の葉（依存先を持たないレコード）すべての後ろにつなぐ

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::engine::WorkEngine;
use super::engine_core::EngineCore;
use super::operation::Operation;
use super::processor::Processor;
use super::transitions;
use crate::domain::{
    EngineError, ExistingWorkPolicy, MAX_DATA_BYTES, StoreError, WorkId, WorkRecord, WorkRequest,
    WorkState, WorkStatus,
};
use crate::ports::WorkLauncher;
use crate::store::Transaction;

pub(crate) struct ContinuationNode {
    name: Option<String>,
    policy: ExistingWorkPolicy,
    requests: Vec<WorkRequest>,
    parents: Vec<Arc<ContinuationNode>>,
    enqueued: AtomicBool,
    skipped: AtomicBool,
}

impl ContinuationNode {
    pub(crate) fn new(
        name: Option<String>,
        policy: ExistingWorkPolicy,
        requests: Vec<WorkRequest>,
        parents: Vec<Arc<ContinuationNode>>,
    ) -> Self {
        Self {
            name,
            policy,
            requests,
            parents,
            enqueued: AtomicBool::new(false),
            skipped: AtomicBool::new(false),
        }
    }

    /// Requests are never empty, so the first id names the node.
    fn key(&self) -> Option<WorkId> {
        self.requests.first().map(WorkRequest::id)
    }

    fn own_ids(&self) -> Vec<WorkId> {
        self.requests.iter().map(WorkRequest::id).collect()
    }

    fn mark_enqueued(&self, skipped: bool) {
        self.skipped.store(skipped, Ordering::Release);
        self.enqueued.store(true, Ordering::Release);
    }
}

/// Rejects caller mistakes before anything is queued.
pub(crate) fn validate_requests(
    operation: &'static str,
    requests: &[WorkRequest],
    allow_periodic: bool,
) -> Result<(), EngineError> {
    if requests.is_empty() {
        return Err(EngineError::EmptyWork(operation));
    }
    for request in requests {
        if !allow_periodic && request.is_periodic() {
            return Err(EngineError::InvalidRequest(format!(
                "periodic work '{}' cannot be part of a chain",
                request.handler()
            )));
        }
        let size = request.input().size_in_bytes();
        if size > MAX_DATA_BYTES {
            return Err(EngineError::DataTooLarge {
                id: request.id(),
                size,
                limit: MAX_DATA_BYTES,
            });
        }
    }
    Ok(())
}

#[derive(Clone)]
pub struct WorkContinuation {
    engine: WorkEngine,
    node: Arc<ContinuationNode>,
}

impl WorkContinuation {
    pub(crate) fn new(engine: WorkEngine, node: ContinuationNode) -> Self {
        Self {
            engine,
            node: Arc::new(node),
        }
    }

    /// `requests` run after everything in this continuation succeeded.
    pub fn then(&self, requests: Vec<WorkRequest>) -> Result<WorkContinuation, EngineError> {
        validate_requests("then", &requests, false)?;
        let node = ContinuationNode::new(
            self.node.name.clone(),
            ExistingWorkPolicy::Keep,
            requests,
            vec![Arc::clone(&self.node)],
        );
        Ok(Self::new(self.engine.clone(), node))
    }

    /// Joins several continuations: `requests` wait for all of them.
    pub fn combine(
        continuations: &[WorkContinuation],
        requests: Vec<WorkRequest>,
    ) -> Result<WorkContinuation, EngineError> {
        let Some(first) = continuations.first() else {
            return Err(EngineError::EmptyWork("combine"));
        };
        validate_requests("combine", &requests, false)?;
        if continuations
            .iter()
            .any(|other| !first.engine.same_engine(&other.engine))
        {
            return Err(EngineError::InvalidRequest(
                "cannot combine continuations from different engines".into(),
            ));
        }
        let parents = continuations
            .iter()
            .map(|continuation| Arc::clone(&continuation.node))
            .collect();
        let node = ContinuationNode::new(None, ExistingWorkPolicy::Keep, requests, parents);
        Ok(Self::new(first.engine.clone(), node))
    }

    /// Every id in this continuation and its ancestors, ancestors first.
    pub fn ids(&self) -> Vec<WorkId> {
        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        collect_ids(&self.node, &mut seen, &mut ids);
        ids
    }

    pub fn is_enqueued(&self) -> bool {
        self.node.enqueued.load(Ordering::Acquire)
    }

    pub fn enqueue(&self) -> Operation {
        if self.is_enqueued() {
            warn!(ids = ?self.node.own_ids(), "continuation is already enqueued");
            return Operation::completed();
        }
        self.engine.enqueue_node(Arc::clone(&self.node))
    }

    pub fn statuses(&self) -> Vec<WorkStatus> {
        self.engine.statuses_by_ids(&self.ids())
    }

    pub fn observe_statuses(&self) -> watch::Receiver<Vec<WorkStatus>> {
        self.engine.observe_statuses_by_ids(self.ids())
    }
}

fn collect_ids(node: &ContinuationNode, seen: &mut HashSet<WorkId>, ids: &mut Vec<WorkId>) {
    for parent in &node.parents {
        collect_ids(parent, seen, ids);
    }
    for id in node.own_ids() {
        if seen.insert(id) {
            ids.push(id);
        }
    }
}

// ========================================
// 平坦化
// ========================================

struct Flatten {
    now: DateTime<Utc>,
    min_interval: Duration,
    /// `None` marks a node skipped by KEEP.
    outcomes: HashMap<WorkId, Option<Vec<WorkId>>>,
    visited: Vec<(Arc<ContinuationNode>, bool)>,
    inserted: usize,
    /// Existing records a REPLACE cancelled; their executions and triggers must go.
    cancelled: Vec<WorkId>,
}

impl Flatten {
    fn node(
        &mut self,
        tx: &mut Transaction<'_>,
        node: &Arc<ContinuationNode>,
    ) -> Result<Option<Vec<WorkId>>, EngineError> {
        let Some(key) = node.key() else {
            return Ok(Some(Vec::new()));
        };
        if let Some(outcome) = self.outcomes.get(&key) {
            return Ok(outcome.clone());
        }

        let outcome = if node.enqueued.load(Ordering::Acquire) {
            // Persisted by an earlier enqueue; only its ids matter here.
            (!node.skipped.load(Ordering::Acquire)).then(|| node.own_ids())
        } else {
            let mut prerequisites = BTreeSet::new();
            let mut parent_skipped = false;
            for parent in &node.parents {
                match self.node(tx, parent)? {
                    Some(ids) => prerequisites.extend(ids),
                    None => parent_skipped = true,
                }
            }
            let outcome = if parent_skipped {
                debug!(ids = ?node.own_ids(), "prerequisite was kept, skipping dependents");
                None
            } else {
                self.insert(tx, node, prerequisites.into_iter().collect())?
            };
            self.visited.push((Arc::clone(node), outcome.is_none()));
            outcome
        };
        self.outcomes.insert(key, outcome.clone());
        Ok(outcome)
    }

    fn insert(
        &mut self,
        tx: &mut Transaction<'_>,
        node: &ContinuationNode,
        mut prerequisites: Vec<WorkId>,
    ) -> Result<Option<Vec<WorkId>>, EngineError> {
        if let Some(name) = node.name.as_deref()
            && node.parents.is_empty()
        {
            let existing = tx.ids_for_name(name);
            if !existing.is_empty() {
                match node.policy {
                    ExistingWorkPolicy::Append => {
                        prerequisites = existing
                            .iter()
                            .copied()
                            .filter(|id| !tx.has_dependents(*id))
                            .collect();
                        debug!(name, leaves = prerequisites.len(), "appending to unique work");
                    }
                    ExistingWorkPolicy::Keep
                        if existing
                            .iter()
                            .any(|id| tx.state(*id).is_some_and(|state| !state.is_finished())) =>
                    {
                        info!(name, "unique work is still pending, keeping it");
                        return Ok(None);
                    }
                    ExistingWorkPolicy::Keep | ExistingWorkPolicy::Replace => {
                        for id in &existing {
                            self.cancelled
                                .extend(transitions::cancel_with_dependents(tx, *id));
                        }
                        for id in &existing {
                            tx.delete(*id);
                        }
                        info!(name, replaced = existing.len(), "replacing unique work");
                    }
                }
            }
        }

        let state = initial_state(tx, &prerequisites)?;
        let mut ids = Vec::with_capacity(node.requests.len());
        for request in &node.requests {
            let mut record = WorkRecord::from_request(request, state, node.name.clone(), self.now);
            if let Some(interval) = record.interval
                && interval < self.min_interval
            {
                warn!(
                    id = %record.id,
                    ?interval,
                    minimum = ?self.min_interval,
                    "periodic interval is below the minimum, clamping"
                );
                record.interval = Some(self.min_interval);
            }
            let id = record.id;
            tx.insert(record)?;
            for prerequisite in &prerequisites {
                tx.add_dependency(id, *prerequisite);
            }
            ids.push(id);
        }
        self.inserted += ids.len();
        Ok(Some(ids))
    }
}

/// ENQUEUED when every prerequisite succeeded, otherwise inherits failure, cancellation,
/// or waits as BLOCKED.
fn initial_state(tx: &Transaction<'_>, prerequisites: &[WorkId]) -> Result<WorkState, EngineError> {
    let mut completed_all = true;
    let mut failed = false;
    let mut cancelled = false;
    for prerequisite in prerequisites {
        match tx.state(*prerequisite) {
            None => return Err(EngineError::UnknownPrerequisite(*prerequisite)),
            Some(WorkState::Succeeded) => {}
            Some(state) => {
                completed_all = false;
                failed |= state == WorkState::Failed;
                cancelled |= state == WorkState::Cancelled;
            }
        }
    }
    Ok(if completed_all {
        WorkState::Enqueued
    } else if failed {
        WorkState::Failed
    } else if cancelled {
        WorkState::Cancelled
    } else {
        WorkState::Blocked
    })
}

/// Persists the graph rooted at `node` in one transaction, then schedules.
/// Runs on the background executor.
pub(crate) fn enqueue_graph(
    core: &EngineCore,
    processor: &Processor,
    node: &Arc<ContinuationNode>,
) -> Result<(), EngineError> {
    let mut flatten = Flatten {
        now: core.now(),
        min_interval: core.config.min_periodic_interval(),
        outcomes: HashMap::new(),
        visited: Vec::new(),
        inserted: 0,
        cancelled: Vec::new(),
    };
    core.db.transaction(|tx| {
        flatten.node(tx, node)?;
        if let Some(cycle) = tx.detect_cycle() {
            return Err(EngineError::from(StoreError::Cycle(cycle)));
        }
        Ok(())
    })?;

    for (node, skipped) in &flatten.visited {
        node.mark_enqueued(*skipped);
    }
    let schedulers = core.schedulers();
    for id in &flatten.cancelled {
        processor.stop_work(*id);
        schedulers.cancel(*id);
    }
    info!(
        inserted = flatten.inserted,
        replaced = flatten.cancelled.len(),
        "work enqueued"
    );
    core.schedule_pass()?;
    Ok(())
}
