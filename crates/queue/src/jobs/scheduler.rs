//! Priority scheduler: scoring, ranking and the CAS-based claim.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use cafetal_core::{Clock, WorkStatus};

use super::store::{StoreError, WorkItemStore};
use super::types::{Transition, WorkItem};
use crate::config::QueueConfig;

/// Score weights: priority plus a bonus that grows linearly with age.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringPolicy {
    /// Age at which the bonus stops growing
    pub age_cap: Duration,
    /// Bonus reached at `age_cap`
    pub age_bonus_cap: f64,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

impl ScoringPolicy {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            age_cap: config.age_cap,
            age_bonus_cap: config.age_bonus_cap,
        }
    }

    pub fn age_bonus(&self, item: &WorkItem, now: DateTime<Utc>) -> f64 {
        let age_ms = (now - item.created_at).num_milliseconds().max(0) as f64;
        let cap_ms = self.age_cap.as_millis() as f64;
        if cap_ms <= 0.0 {
            return self.age_bonus_cap;
        }
        (age_ms / cap_ms).min(1.0) * self.age_bonus_cap
    }

    /// Derived ordering key; never persisted.
    pub fn score(&self, item: &WorkItem, now: DateTime<Utc>) -> f64 {
        item.priority.weight() + self.age_bonus(item, now)
    }

    /// `Less` means `a` should run first: higher score, then earlier
    /// `created_at`, then lower id.
    pub fn compare(&self, a: &WorkItem, b: &WorkItem, now: DateTime<Utc>) -> Ordering {
        self.score(b, now)
            .total_cmp(&self.score(a, now))
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.as_uuid().cmp(b.id.as_uuid()))
    }

    /// Sort best-first.
    pub fn rank(&self, items: &mut [WorkItem], now: DateTime<Utc>) {
        items.sort_by(|a, b| self.compare(a, b, now));
    }

    pub fn select_next<'a>(&self, items: &'a [WorkItem], now: DateTime<Utc>) -> Option<&'a WorkItem> {
        items.iter().min_by(|a, b| self.compare(a, b, now))
    }
}

/// Picks the next item to run and claims it in the store.
#[derive(Debug, Clone)]
pub struct PriorityScheduler {
    store: Arc<dyn WorkItemStore>,
    clock: Arc<dyn Clock>,
    policy: ScoringPolicy,
}

impl PriorityScheduler {
    pub fn new(store: Arc<dyn WorkItemStore>, clock: Arc<dyn Clock>, policy: ScoringPolicy) -> Self {
        Self {
            store,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> &ScoringPolicy {
        &self.policy
    }

    /// Claim the highest-scoring eligible item via `CAS(pending → running)`.
    ///
    /// A lost race (another scheduler or a cancel got there first) re-lists
    /// and tries again. `None` when nothing is eligible.
    pub async fn claim_next(&self) -> Result<Option<WorkItem>, StoreError> {
        loop {
            let now = self.clock.now();
            let pending = self.store.list_pending(now).await?;
            let Some(best) = self.policy.select_next(&pending, now) else {
                return Ok(None);
            };

            match self
                .store
                .compare_and_set_status(best.id, WorkStatus::Pending, Transition::Dispatch { at: now })
                .await
            {
                Ok(claimed) => {
                    debug!(
                        job_id = %claimed.id,
                        category = %claimed.category,
                        priority = %claimed.priority,
                        attempt = claimed.attempts,
                        score = self.policy.score(&claimed, now),
                        "dispatched"
                    );
                    return Ok(Some(claimed));
                }
                Err(StoreError::Conflict { id, actual, .. }) => {
                    debug!(job_id = %id, %actual, "lost dispatch race");
                }
                Err(StoreError::NotFound(id)) => {
                    debug!(job_id = %id, "item vanished before dispatch");
                }
                Err(err) => return Err(err),
            }
        }
    }
}
