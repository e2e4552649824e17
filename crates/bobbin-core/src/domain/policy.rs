//! Policies: unique-work conflict resolution and retry backoff.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What to do when work is enqueued under a unique name that already has records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExistingWorkPolicy {
    /// Leave the existing chain alone if any of it is unfinished; the new work is a no-op.
    Keep,
    /// Cancel and delete every existing record under the name, then insert the new work.
    Replace,
    /// Make the new work depend on every current leaf under the name.
    Append,
}

/// Conflict policy for unique periodic work. Periodic work cannot be appended to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExistingPeriodicWorkPolicy {
    Keep,
    Replace,
}

impl From<ExistingPeriodicWorkPolicy> for ExistingWorkPolicy {
    fn from(policy: ExistingPeriodicWorkPolicy) -> Self {
        match policy {
            ExistingPeriodicWorkPolicy::Keep => ExistingWorkPolicy::Keep,
            ExistingPeriodicWorkPolicy::Replace => ExistingWorkPolicy::Replace,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackoffPolicy {
    Exponential,
    Linear,
}

/// Backoff applied between attempts of a job that returned RETRY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffCriteria {
    pub policy: BackoffPolicy,
    pub delay: Duration,
}

impl BackoffCriteria {
    pub const DEFAULT_DELAY: Duration = Duration::from_secs(30);
    pub const MIN_DELAY: Duration = Duration::from_secs(10);
    pub const MAX_DELAY: Duration = Duration::from_secs(5 * 60 * 60);

    pub fn new(policy: BackoffPolicy, delay: Duration) -> Self {
        Self { policy, delay }
    }

    /// Delay before the next attempt, given how many attempts already ran.
    ///
    /// - exponential: `delay * 2^(attempts - 1)`
    /// - linear: `delay * attempts`
    ///
    /// The result is clamped to `[MIN_DELAY, MAX_DELAY]`. Zero attempts means no backoff.
    ///
    /// Example with delay=10s, exponential:
    /// - attempt 1: 10s
    /// - attempt 2: 20s
    /// - attempt 3: 40s
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }
        let base = self.delay.as_secs_f64();
        let secs = match self.policy {
            BackoffPolicy::Exponential => {
                let exponent = i32::try_from(attempts.saturating_sub(1)).unwrap_or(i32::MAX);
                base * 2f64.powi(exponent)
            }
            BackoffPolicy::Linear => base * f64::from(attempts),
        };
        let max = Self::MAX_DELAY.as_secs_f64();
        let min = Self::MIN_DELAY.as_secs_f64();
        Duration::from_secs_f64(secs.clamp(min, max))
    }
}

impl Default for BackoffCriteria {
    fn default() -> Self {
        Self {
            policy: BackoffPolicy::Exponential,
            delay: Self::DEFAULT_DELAY,
        }
    }
}
