//! WorkRecord: the persisted form of one job.
//!
//! Design:
//! - This is the single source of truth for a job's state.
//! - Schedulers and the processor hold WorkIds only.
//! - State changes go through the mutators below, called from the transition engine
//!   inside a store transaction.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

use super::constraints::Constraints;
use super::data::Data;
use super::ids::WorkId;
use super::policy::BackoffCriteria;
use super::request::WorkRequest;
use super::state::WorkState;
use super::status::WorkStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkRecord {
    pub id: WorkId,
    pub handler: String,
    pub input_merger: String,
    pub state: WorkState,
    pub input: Data,
    pub output: Data,

    /// Number of ENQUEUED -> RUNNING transitions in the current period. Reset only by
    /// the periodic cycle.
    pub run_attempt_count: u32,

    pub initial_delay: Duration,
    pub interval: Option<Duration>,
    pub period_start_time: DateTime<Utc>,

    /// Completed periods of a periodic job.
    pub period_count: u32,

    pub backoff: BackoffCriteria,

    /// Conditions that must hold before an attempt starts and while it runs.
    #[serde(default)]
    pub constraints: Constraints,

    /// `None` until a schedule pass hands the record to the backends.
    pub schedule_requested_at: Option<DateTime<Utc>>,

    pub unique_name: Option<String>,
    pub tags: BTreeSet<String>,
    pub enqueued_at: DateTime<Utc>,
}

impl WorkRecord {
    pub fn from_request(
        request: &WorkRequest,
        state: WorkState,
        unique_name: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: request.id(),
            handler: request.handler().to_string(),
            input_merger: request.input_merger().to_string(),
            state,
            input: request.input().clone(),
            output: Data::empty(),
            run_attempt_count: 0,
            initial_delay: request.initial_delay(),
            interval: request.interval(),
            period_start_time: now,
            period_count: 0,
            backoff: request.backoff(),
            constraints: request.constraints().clone(),
            schedule_requested_at: None,
            unique_name,
            tags: request.tags().clone(),
            enqueued_at: now,
        }
    }

    pub fn is_periodic(&self) -> bool {
        self.interval.is_some()
    }

    pub fn is_constrained(&self) -> bool {
        !self.constraints.is_empty()
    }

    /// ENQUEUED after at least one RETRY.
    pub fn is_backed_off(&self) -> bool {
        self.state == WorkState::Enqueued && self.run_attempt_count > 0
    }

    /// When the record becomes due.
    pub fn next_run_time(&self) -> DateTime<Utc> {
        if self.is_backed_off() {
            let delay = self.backoff.delay_for_attempt(self.run_attempt_count);
            return add_duration(self.period_start_time, delay);
        }
        if self.is_periodic() && self.period_count > 0 {
            return self.period_start_time;
        }
        add_duration(self.period_start_time, self.initial_delay)
    }

    pub fn status(&self) -> WorkStatus {
        WorkStatus {
            id: self.id,
            state: self.state,
            output: self.output.clone(),
            tags: self.tags.clone(),
            run_attempt_count: self.run_attempt_count,
            period_count: self.period_count,
        }
    }

    pub(crate) fn start_attempt(&mut self) {
        self.state = WorkState::Running;
        self.run_attempt_count += 1;
    }

    pub(crate) fn mark_succeeded(&mut self, output: Data) {
        self.state = WorkState::Succeeded;
        self.output = output;
    }

    pub(crate) fn mark_failed(&mut self, output: Option<Data>) {
        self.state = WorkState::Failed;
        if let Some(output) = output {
            self.output = output;
        }
    }

    pub(crate) fn mark_cancelled(&mut self) {
        self.state = WorkState::Cancelled;
    }

    /// RETRY: back to ENQUEUED with a fresh backoff origin and no pending trigger.
    pub(crate) fn requeue_for_retry(&mut self, now: DateTime<Utc>) {
        self.state = WorkState::Enqueued;
        self.period_start_time = now;
        self.schedule_requested_at = None;
    }

    /// End of a period: advance the period start and start counting attempts afresh.
    pub(crate) fn advance_period(&mut self) {
        let interval = self.interval.unwrap_or_default();
        self.period_start_time = add_duration(self.period_start_time, interval);
        self.period_count += 1;
        self.state = WorkState::Enqueued;
        self.run_attempt_count = 0;
        self.schedule_requested_at = None;
    }

    /// Back to ENQUEUED with no pending trigger, after an attempt was lost.
    pub(crate) fn reset_to_enqueued(&mut self) {
        self.state = WorkState::Enqueued;
        self.schedule_requested_at = None;
    }

    /// BLOCKED -> ENQUEUED once every prerequisite succeeded.
    pub(crate) fn unblock(&mut self, now: DateTime<Utc>) {
        self.state = WorkState::Enqueued;
        self.period_start_time = now;
    }
}

/// `time + duration`, saturating instead of panicking on overflow.
pub fn add_duration(time: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| time.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
