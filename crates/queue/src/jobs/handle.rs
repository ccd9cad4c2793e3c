//! Caller-facing API: submit, poll, cancel, await.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info};

use cafetal_analysis::{AnalysisInput, AnalysisResult, Category};
use cafetal_core::{DomainError, Priority, WorkItemId, WorkStatus};

use super::events::QueueEvent;
use super::metrics::CategoryMetrics;
use super::queue::QueueCore;
use super::store::StoreError;
use super::types::{FailureKind, JobFailure, JobRequest, JobStatusView, Transition, WorkItem};
use crate::config::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Rejected at submission; never stored.
    #[error("invalid submission: {0}")]
    Validation(String),

    #[error("job not found: {0}")]
    NotFound(WorkItemId),

    #[error("queue already started")]
    AlreadyStarted,

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<StoreError> for QueueError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => QueueError::NotFound(id),
            other => QueueError::Store(other),
        }
    }
}

impl From<DomainError> for QueueError {
    fn from(err: DomainError) -> Self {
        QueueError::Validation(err.to_string())
    }
}

/// Final state observed by [`JobHandle::await_result`].
#[derive(Debug, Clone, PartialEq)]
pub enum AwaitOutcome {
    Completed(AnalysisResult),
    Failed(JobFailure),
    Cancelled,
    /// Still pending or running when the wait ran out.
    TimedOut,
}

/// Cheap, cloneable handle to a [`JobQueue`](super::JobQueue).
///
/// Works before the queue is started: submissions simply wait in the store.
#[derive(Clone)]
pub struct JobHandle {
    core: Arc<QueueCore>,
}

impl core::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobHandle").finish_non_exhaustive()
    }
}

impl JobHandle {
    pub(crate) fn new(core: Arc<QueueCore>) -> Self {
        Self { core }
    }

    /// Submit a job. `category` must have a registered work function and the
    /// payload must not be empty.
    pub async fn submit(
        &self,
        category: &str,
        payload: AnalysisInput,
        priority: Priority,
    ) -> Result<WorkItemId, QueueError> {
        let category = Category::new(category)?;
        self.submit_request(JobRequest::new(category, payload).priority(priority))
            .await
    }

    pub async fn submit_request(&self, request: JobRequest) -> Result<WorkItemId, QueueError> {
        if !self.core.registry.contains(&request.category) {
            return Err(QueueError::Validation(format!(
                "no work function registered for category {}",
                request.category
            )));
        }
        if request.payload.is_empty() {
            return Err(QueueError::Validation("payload is empty".into()));
        }
        let max_attempts = request.max_attempts.unwrap_or(self.core.config.max_attempts);
        if max_attempts == 0 {
            return Err(QueueError::Validation("max_attempts must be at least 1".into()));
        }

        let item = WorkItem::new(
            request.category,
            request.payload,
            request.priority,
            max_attempts,
            self.core.clock.now(),
        );
        {
            // The dispatcher claims under the write side, so it cannot see
            // this item before `Submitted` is out.
            let _gate = self.core.submit_gate.read().await;
            self.core.store.insert(&item).await?;
            self.core.events.publish(QueueEvent::Submitted {
                id: item.id,
                category: item.category.clone(),
                priority: item.priority,
            });
        }

        info!(
            job_id = %item.id,
            category = %item.category,
            priority = %item.priority,
            max_attempts,
            "job submitted"
        );
        self.core.wake.notify_one();
        Ok(item.id)
    }

    pub async fn get_status(&self, id: WorkItemId) -> Result<JobStatusView, QueueError> {
        Ok(self.load(id).await?.into())
    }

    /// Cancel a job.
    ///
    /// Pending jobs are always cancelled. Running jobs are cancelled in the
    /// store and their work function is signalled, but it may still run to
    /// completion; its outcome is then discarded. Returns `false` when the
    /// job had already finished.
    pub async fn cancel(&self, id: WorkItemId) -> Result<bool, QueueError> {
        loop {
            let item = self.load(id).await?;
            if item.status.is_terminal() {
                debug!(job_id = %id, status = %item.status, "cancel ignored, job already finished");
                return Ok(false);
            }

            let was_running = item.status == WorkStatus::Running;
            let reason = if was_running {
                "cancelled by caller while running"
            } else {
                "cancelled by caller"
            };
            let transition = Transition::Cancel {
                failure: JobFailure::new(FailureKind::Cancelled, reason, item.attempts),
                at: self.core.clock.now(),
            };

            match self
                .core
                .store
                .compare_and_set_status(id, item.status, transition)
                .await
            {
                Ok(cancelled) => {
                    if was_running {
                        self.core.pool.cancel_in_flight(id);
                    }
                    info!(job_id = %id, category = %cancelled.category, was_running, "job cancelled");
                    self.core.metrics.record_cancelled(&cancelled.category);
                    self.core.events.publish(QueueEvent::Cancelled {
                        id,
                        category: cancelled.category,
                        was_running,
                    });
                    return Ok(true);
                }
                // Status moved underneath us; look again.
                Err(StoreError::Conflict { .. }) => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Poll until the job is terminal or `timeout` elapses.
    ///
    /// Polls at `await_poll_interval`, never faster than
    /// [`MIN_AWAIT_POLL_INTERVAL`](crate::config::MIN_AWAIT_POLL_INTERVAL).
    pub async fn await_result(
        &self,
        id: WorkItemId,
        timeout: Duration,
    ) -> Result<AwaitOutcome, QueueError> {
        // `None` when the timeout is too large to represent: wait until terminal.
        let deadline = tokio::time::Instant::now().checked_add(timeout);
        let interval = self.core.config.effective_poll_interval();

        loop {
            let item = self.load(id).await?;
            match item.status {
                WorkStatus::Completed => {
                    let result = item.result.ok_or_else(|| {
                        StoreError::Corrupt(format!("completed job {id} has no result"))
                    })?;
                    return Ok(AwaitOutcome::Completed(result));
                }
                WorkStatus::Failed => {
                    let failure = item.error.ok_or_else(|| {
                        StoreError::Corrupt(format!("failed job {id} has no error"))
                    })?;
                    return Ok(AwaitOutcome::Failed(failure));
                }
                WorkStatus::Cancelled => return Ok(AwaitOutcome::Cancelled),
                WorkStatus::Pending | WorkStatus::Running => {}
            }

            let pause = match deadline {
                Some(deadline) => {
                    let now = tokio::time::Instant::now();
                    if now >= deadline {
                        return Ok(AwaitOutcome::TimedOut);
                    }
                    interval.min(deadline - now)
                }
                None => interval,
            };
            tokio::time::sleep(pause).await;
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.core.events.subscribe()
    }

    pub fn metrics(&self) -> BTreeMap<Category, CategoryMetrics> {
        self.core.metrics.snapshot()
    }

    async fn load(&self, id: WorkItemId) -> Result<WorkItem, QueueError> {
        self.core
            .store
            .get(id)
            .await?
            .ok_or(QueueError::NotFound(id))
    }
}
