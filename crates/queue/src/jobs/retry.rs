//! Backoff policy and the post-execution transition.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use cafetal_analysis::AnalysisResult;
use cafetal_core::WorkStatus;

use super::executor::Outcome;
use super::store::{StoreError, WorkItemStore};
use super::types::{JobFailure, Transition, WorkItem};

/// Exponential backoff: `base * 2^(attempt-1)`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(5 * 60),
        }
    }
}

impl RetryPolicy {
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Delay after the given (1-indexed) failed attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        2u32.checked_pow(attempt - 1)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// What happens to a job after an attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    Complete(AnalysisResult),
    Retry {
        delay: Duration,
        not_before: DateTime<Utc>,
    },
    Fail(JobFailure),
}

impl RetryDecision {
    pub fn into_transition(self, now: DateTime<Utc>) -> Transition {
        match self {
            RetryDecision::Complete(result) => Transition::Complete { result, at: now },
            RetryDecision::Retry { not_before, .. } => Transition::Retry { not_before, at: now },
            RetryDecision::Fail(failure) => Transition::Fail { failure, at: now },
        }
    }
}

/// A committed decision and the item as stored afterwards.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub item: WorkItem,
    pub decision: RetryDecision,
}

#[derive(Debug, Clone)]
pub struct RetryController {
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Decide the next transition for a `running` item given its outcome.
    ///
    /// `item.attempts` already counts the attempt that produced `outcome`.
    pub fn decide(&self, item: &WorkItem, outcome: &Outcome, now: DateTime<Utc>) -> RetryDecision {
        let err = match &outcome.result {
            Ok(result) => return RetryDecision::Complete(result.clone()),
            Err(err) => err,
        };

        if !err.kind.is_retryable() || item.attempts_exhausted() {
            return RetryDecision::Fail(JobFailure::new(err.kind, err.message.clone(), item.attempts));
        }

        let delay = self.policy.delay_for_attempt(item.attempts);
        let earliest = add_std(now, delay);
        // notBefore only moves forward, even if the clock stepped back.
        let floor = item
            .not_before
            .checked_add_signed(chrono::Duration::milliseconds(1))
            .unwrap_or(item.not_before);
        RetryDecision::Retry {
            delay,
            not_before: earliest.max(floor),
        }
    }

    /// Decide and commit via `CAS(running → ...)`.
    ///
    /// Returns `Ok(None)` when the item is no longer `running` (cancelled or
    /// reclaimed meanwhile); the outcome is then discarded.
    pub async fn settle(
        &self,
        store: &dyn WorkItemStore,
        item: &WorkItem,
        outcome: &Outcome,
        now: DateTime<Utc>,
    ) -> Result<Option<Settlement>, StoreError> {
        let decision = self.decide(item, outcome, now);

        if let Err(err) = &outcome.result {
            warn!(
                job_id = %item.id,
                category = %item.category,
                attempt = item.attempts,
                kind = %err.kind,
                error = %err.message,
                "analysis attempt failed"
            );
        }

        let transition = decision.clone().into_transition(now);
        match store
            .compare_and_set_status(item.id, WorkStatus::Running, transition)
            .await
        {
            Ok(updated) => Ok(Some(Settlement {
                item: updated,
                decision,
            })),
            Err(StoreError::Conflict { actual, .. }) => {
                debug!(job_id = %item.id, %actual, "outcome discarded, item no longer running");
                Ok(None)
            }
            Err(StoreError::NotFound(_)) => {
                debug!(job_id = %item.id, "outcome discarded, item purged");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

pub(crate) fn add_std(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
