//! Core job types: the work item record, failures, status transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cafetal_analysis::{AnalysisInput, AnalysisResult, Category};
use cafetal_core::{Priority, WorkItemId, WorkStatus};

/// Why an attempt (or the whole job) failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The work function returned an error
    Execution,
    /// The per-category wall-clock budget elapsed
    Timeout,
    /// The work function panicked
    Panicked,
    /// No work function is registered for the category (never retried)
    UnknownCategory,
    /// The process died while the job was running and no attempts were left
    Interrupted,
    /// A caller cancelled the job
    Cancelled,
}

impl FailureKind {
    /// Whether the retry controller may re-queue after this failure.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FailureKind::Execution | FailureKind::Timeout | FailureKind::Panicked
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Execution => "execution",
            FailureKind::Timeout => "timeout",
            FailureKind::Panicked => "panicked",
            FailureKind::UnknownCategory => "unknown_category",
            FailureKind::Interrupted => "interrupted",
            FailureKind::Cancelled => "cancelled",
        }
    }
}

impl core::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error recorded on a job that reached `failed` (or `cancelled`).
///
/// Only the latest failure is kept; earlier attempts are visible in the logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Attempts made when the failure was recorded.
    pub attempts: u32,
}

impl JobFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>, attempts: u32) -> Self {
        Self {
            kind,
            message: message.into(),
            attempts,
        }
    }
}

impl core::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} after {} attempt(s): {}", self.kind, self.attempts, self.message)
    }
}

/// A schedulable unit of analysis work and its state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub category: Category,
    pub payload: AnalysisInput,
    pub priority: Priority,
    pub status: WorkStatus,
    /// Dispatches so far (starts at 0)
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Earliest eligible dispatch time; only ever moves forward
    pub not_before: DateTime<Utc>,
    /// Start of the latest attempt
    pub started_at: Option<DateTime<Utc>>,
    /// When a terminal status was reached
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<AnalysisResult>,
    pub error: Option<JobFailure>,
}

impl WorkItem {
    pub fn new(
        category: Category,
        payload: AnalysisInput,
        priority: Priority,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: WorkItemId::new(),
            category,
            payload,
            priority,
            status: WorkStatus::Pending,
            attempts: 0,
            max_attempts,
            created_at: now,
            updated_at: now,
            not_before: now,
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
        }
    }

    /// Pending and past its backoff.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == WorkStatus::Pending && self.not_before <= now
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Duration of the latest attempt, if it has finished.
    pub fn last_attempt_ms(&self) -> Option<u64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
            _ => None,
        }
    }
}

/// A status change plus the fields it mutates.
///
/// This is the `mutator` half of compare-and-set: stores apply it only when
/// the current status equals the expected one.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// pending → running; `attempts += 1`
    Dispatch { at: DateTime<Utc> },
    /// running → completed with a result
    Complete {
        result: AnalysisResult,
        at: DateTime<Utc>,
    },
    /// running → pending, not eligible again before `not_before`
    Retry {
        not_before: DateTime<Utc>,
        at: DateTime<Utc>,
    },
    /// running → failed with a terminal error
    Fail {
        failure: JobFailure,
        at: DateTime<Utc>,
    },
    /// pending | running → cancelled
    Cancel {
        failure: JobFailure,
        at: DateTime<Utc>,
    },
    /// running → pending after a crash; attempts unchanged
    Recover { at: DateTime<Utc> },
}

/// Column-level view of a [`Transition`], shared by the SQL backends.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionColumns {
    pub status: WorkStatus,
    pub attempts_delta: u32,
    pub not_before: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<AnalysisResult>,
    pub error: Option<JobFailure>,
    pub updated_at: DateTime<Utc>,
}

impl Transition {
    /// Status the item has after the transition.
    pub fn target(&self) -> WorkStatus {
        match self {
            Transition::Dispatch { .. } => WorkStatus::Running,
            Transition::Complete { .. } => WorkStatus::Completed,
            Transition::Retry { .. } | Transition::Recover { .. } => WorkStatus::Pending,
            Transition::Fail { .. } => WorkStatus::Failed,
            Transition::Cancel { .. } => WorkStatus::Cancelled,
        }
    }

    /// Whether this transition may start from `from`.
    pub fn permits(&self, from: WorkStatus) -> bool {
        from.can_transition_to(self.target())
    }

    pub fn columns(&self) -> TransitionColumns {
        let mut cols = TransitionColumns {
            status: self.target(),
            attempts_delta: 0,
            not_before: None,
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
            updated_at: self.at(),
        };
        match self {
            Transition::Dispatch { at } => {
                cols.attempts_delta = 1;
                cols.started_at = Some(*at);
            }
            Transition::Complete { result, at } => {
                cols.result = Some(result.clone());
                cols.finished_at = Some(*at);
            }
            Transition::Retry { not_before, .. } => {
                cols.not_before = Some(*not_before);
            }
            Transition::Fail { failure, at } | Transition::Cancel { failure, at } => {
                cols.error = Some(failure.clone());
                cols.finished_at = Some(*at);
            }
            Transition::Recover { .. } => {}
        }
        cols
    }

    /// Apply to an in-memory copy. Callers check [`permits`](Self::permits)
    /// against the current status first.
    pub fn apply(&self, item: &mut WorkItem) {
        let cols = self.columns();
        item.status = cols.status;
        item.attempts += cols.attempts_delta;
        item.updated_at = cols.updated_at;
        if let Some(nb) = cols.not_before {
            item.not_before = nb;
        }
        if let Some(started) = cols.started_at {
            item.started_at = Some(started);
        }
        if let Some(finished) = cols.finished_at {
            item.finished_at = Some(finished);
        }
        if let Some(result) = cols.result {
            item.result = Some(result);
        }
        if let Some(error) = cols.error {
            item.error = Some(error);
        }
    }

    fn at(&self) -> DateTime<Utc> {
        match self {
            Transition::Dispatch { at }
            | Transition::Complete { at, .. }
            | Transition::Retry { at, .. }
            | Transition::Fail { at, .. }
            | Transition::Cancel { at, .. }
            | Transition::Recover { at } => *at,
        }
    }
}

/// A submission request.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub category: Category,
    pub payload: AnalysisInput,
    pub priority: Priority,
    /// Overrides the queue's default attempt ceiling
    pub max_attempts: Option<u32>,
}

impl JobRequest {
    pub fn new(category: Category, payload: AnalysisInput) -> Self {
        Self {
            category,
            payload,
            priority: Priority::default(),
            max_attempts: None,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// Caller-facing status snapshot; the JSON shape UI code polls.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusView {
    pub id: WorkItemId,
    pub category: Category,
    pub priority: Priority,
    pub status: WorkStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<AnalysisResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
}

impl From<WorkItem> for JobStatusView {
    fn from(item: WorkItem) -> Self {
        Self {
            id: item.id,
            category: item.category,
            priority: item.priority,
            status: item.status,
            attempts: item.attempts,
            max_attempts: item.max_attempts,
            created_at: item.created_at,
            finished_at: item.finished_at,
            result: item.result,
            error: item.error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item() -> WorkItem {
        WorkItem::new(
            Category::new("pest_classification").unwrap(),
            AnalysisInput::new(b"leaf.jpg".to_vec()),
            Priority::High,
            3,
            Utc::now(),
        )
    }

    #[test]
    fn dispatch_counts_an_attempt() {
        let mut item = item();
        let at = Utc::now();

        Transition::Dispatch { at }.apply(&mut item);

        assert_eq!(item.status, WorkStatus::Running);
        assert_eq!(item.attempts, 1);
        assert_eq!(item.started_at, Some(at));
    }

    #[test]
    fn transitions_only_start_from_their_source_status() {
        let at = Utc::now();
        let complete = Transition::Complete {
            result: AnalysisResult::new(1.0, 0.9),
            at,
        };
        assert!(complete.permits(WorkStatus::Running));
        assert!(!complete.permits(WorkStatus::Pending));

        let cancel = Transition::Cancel {
            failure: JobFailure::new(FailureKind::Cancelled, "caller", 0),
            at,
        };
        assert!(cancel.permits(WorkStatus::Pending));
        assert!(cancel.permits(WorkStatus::Running));
        assert!(!cancel.permits(WorkStatus::Completed));

        assert!(Transition::Dispatch { at }.permits(WorkStatus::Pending));
        assert!(!Transition::Dispatch { at }.permits(WorkStatus::Running));
        assert!(Transition::Recover { at }.permits(WorkStatus::Running));
        assert!(!Transition::Recover { at }.permits(WorkStatus::Pending));
    }

    #[test]
    fn exactly_one_of_result_or_error_after_terminal() {
        let at = Utc::now();

        let mut done = item();
        Transition::Dispatch { at }.apply(&mut done);
        Transition::Complete {
            result: AnalysisResult::new(0.4, 0.8),
            at,
        }
        .apply(&mut done);
        assert!(done.result.is_some() && done.error.is_none());

        let mut failed = item();
        Transition::Dispatch { at }.apply(&mut failed);
        Transition::Fail {
            failure: JobFailure::new(FailureKind::Execution, "model crashed", 1),
            at,
        }
        .apply(&mut failed);
        assert!(failed.result.is_none() && failed.error.is_some());
        assert_eq!(failed.last_attempt_ms(), Some(0));
    }

    #[test]
    fn recover_keeps_attempts() {
        let mut item = item();
        let at = Utc::now();
        Transition::Dispatch { at }.apply(&mut item);
        Transition::Recover { at }.apply(&mut item);

        assert_eq!(item.status, WorkStatus::Pending);
        assert_eq!(item.attempts, 1);
    }

    #[test]
    fn status_view_serializes_camel_case_without_empty_fields() {
        let view = JobStatusView::from(item());
        let json = serde_json::to_value(&view).unwrap();

        assert_eq!(json["status"], "pending");
        assert_eq!(json["attempts"], 0);
        assert!(json.get("createdAt").is_some());
        assert!(json.get("result").is_none());
        assert!(json.get("error").is_none());
    }
}
