//! Outcome model: what a handler reports back for one attempt.
//!
//! The engine maps each variant onto a state transition:
//! - `SUCCESS`: SUCCEEDED with the given output (periodic work resets instead).
//! - `RETRY`: back to ENQUEUED with backoff; not a failure, no cascade.
//! - `FAILURE`: FAILED, cascading to dependents (periodic work resets instead).

use serde::{Deserialize, Serialize};

use super::data::Data;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeKind {
    Success,
    Retry,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "output", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkResult {
    Success(Data),
    Retry,
    Failure(Data),
}

impl WorkResult {
    pub fn success() -> Self {
        Self::Success(Data::empty())
    }

    pub fn success_with(output: Data) -> Self {
        Self::Success(output)
    }

    pub fn retry() -> Self {
        Self::Retry
    }

    pub fn failure() -> Self {
        Self::Failure(Data::empty())
    }

    pub fn failure_with(output: Data) -> Self {
        Self::Failure(output)
    }

    pub fn kind(&self) -> OutcomeKind {
        match self {
            WorkResult::Success(_) => OutcomeKind::Success,
            WorkResult::Retry => OutcomeKind::Retry,
            WorkResult::Failure(_) => OutcomeKind::Failure,
        }
    }

    pub fn output(&self) -> Option<&Data> {
        match self {
            WorkResult::Success(data) | WorkResult::Failure(data) => Some(data),
            WorkResult::Retry => None,
        }
    }
}
