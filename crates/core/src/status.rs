//! Work item status and its state machine.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Execution status of a work item.
///
/// ```text
/// pending ──▶ running ──▶ completed
///    │           │ ├────▶ failed
///    │           │ └────▶ pending   (retry with backoff, or crash recovery)
///    └───────────┴──────▶ cancelled
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    /// Queued, waiting for a slot (and for `not_before`)
    Pending,
    /// Held by exactly one executor slot
    Running,
    /// Finished with a result
    Completed,
    /// Attempts exhausted (or not retryable)
    Failed,
    /// Cancelled by a caller
    Cancelled,
}

impl WorkStatus {
    pub const ALL: [WorkStatus; 5] = [
        WorkStatus::Pending,
        WorkStatus::Running,
        WorkStatus::Completed,
        WorkStatus::Failed,
        WorkStatus::Cancelled,
    ];

    pub const TERMINAL: [WorkStatus; 3] = [
        WorkStatus::Completed,
        WorkStatus::Failed,
        WorkStatus::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkStatus::Completed | WorkStatus::Failed | WorkStatus::Cancelled
        )
    }

    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(self, next: WorkStatus) -> bool {
        use WorkStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Pending)
                | (Running, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkStatus::Pending => "pending",
            WorkStatus::Running => "running",
            WorkStatus::Completed => "completed",
            WorkStatus::Failed => "failed",
            WorkStatus::Cancelled => "cancelled",
        }
    }
}

impl core::fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WorkStatus::Pending),
            "running" => Ok(WorkStatus::Running),
            "completed" => Ok(WorkStatus::Completed),
            "failed" => Ok(WorkStatus::Failed),
            "cancelled" => Ok(WorkStatus::Cancelled),
            other => Err(DomainError::validation(format!("unknown status: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for from in WorkStatus::TERMINAL {
            for to in WorkStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be illegal");
            }
        }
    }

    #[test]
    fn pending_cannot_skip_running() {
        assert!(!WorkStatus::Pending.can_transition_to(WorkStatus::Completed));
        assert!(!WorkStatus::Pending.can_transition_to(WorkStatus::Failed));
        assert!(WorkStatus::Pending.can_transition_to(WorkStatus::Cancelled));
    }

    #[test]
    fn parses_every_status() {
        for s in WorkStatus::ALL {
            assert_eq!(s.as_str().parse::<WorkStatus>().unwrap(), s);
        }
    }
}
