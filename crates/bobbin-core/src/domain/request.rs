//! WorkRequest - 投入前のジョブ記述
//!
//! ID は `build()` 時に採番され、呼び出し側はエンキュー前から
//! その ID でステータスを問い合わせられます。

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

use super::constraints::Constraints;
use super::data::Data;
use super::ids::WorkId;
use super::policy::{BackoffCriteria, BackoffPolicy};

/// Merger used when a request does not name one.
pub const DEFAULT_INPUT_MERGER: &str = "overwriting";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkRequest {
    id: WorkId,
    handler: String,
    input: Data,
    input_merger: String,
    tags: BTreeSet<String>,
    initial_delay: Duration,
    backoff: BackoffCriteria,
    interval: Option<Duration>,
    #[serde(default)]
    constraints: Constraints,
}

impl WorkRequest {
    /// Work that runs until it reaches a terminal state.
    pub fn one_time(handler: impl Into<String>) -> WorkRequestBuilder {
        WorkRequestBuilder::new(handler.into(), None)
    }

    /// Work that runs once per `interval` and never reaches a terminal state on its own.
    pub fn periodic(handler: impl Into<String>, interval: Duration) -> WorkRequestBuilder {
        WorkRequestBuilder::new(handler.into(), Some(interval))
    }

    pub fn id(&self) -> WorkId {
        self.id
    }

    pub fn handler(&self) -> &str {
        &self.handler
    }

    pub fn input(&self) -> &Data {
        &self.input
    }

    pub fn input_merger(&self) -> &str {
        &self.input_merger
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn backoff(&self) -> BackoffCriteria {
        self.backoff
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    pub fn constraints(&self) -> &Constraints {
        &self.constraints
    }

    pub fn is_periodic(&self) -> bool {
        self.interval.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct WorkRequestBuilder {
    handler: String,
    input: Data,
    input_merger: String,
    tags: BTreeSet<String>,
    initial_delay: Duration,
    backoff: BackoffCriteria,
    interval: Option<Duration>,
    constraints: Constraints,
}

impl WorkRequestBuilder {
    fn new(handler: String, interval: Option<Duration>) -> Self {
        let mut tags = BTreeSet::new();
        tags.insert(handler.clone());
        Self {
            handler,
            input: Data::empty(),
            input_merger: DEFAULT_INPUT_MERGER.to_string(),
            tags,
            initial_delay: Duration::ZERO,
            backoff: BackoffCriteria::default(),
            interval,
            constraints: Constraints::none(),
        }
    }

    pub fn input(mut self, input: Data) -> Self {
        self.input = input;
        self
    }

    pub fn input_merger(mut self, name: impl Into<String>) -> Self {
        self.input_merger = name.into();
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn backoff(mut self, policy: BackoffPolicy, delay: Duration) -> Self {
        self.backoff = BackoffCriteria::new(policy, delay);
        self
    }

    /// Holds the work back until the named condition is met.
    pub fn require(mut self, condition: impl Into<String>) -> Self {
        self.constraints = self.constraints.require(condition);
        self
    }

    pub fn build(self) -> WorkRequest {
        WorkRequest {
            id: WorkId::generate(),
            handler: self.handler,
            input: self.input,
            input_merger: self.input_merger,
            tags: self.tags,
            initial_delay: self.initial_delay,
            backoff: self.backoff,
            interval: self.interval,
            constraints: self.constraints,
        }
    }
}
