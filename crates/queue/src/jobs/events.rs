//! Queue lifecycle events, broadcast to subscribers in transition order.
//!
//! Per job, `Submitted` always comes first and is only sent once the item
//! is stored; a rejected insert publishes nothing.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use cafetal_analysis::Category;
use cafetal_core::{Priority, WorkItemId};

use super::types::JobFailure;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    Submitted {
        id: WorkItemId,
        category: Category,
        priority: Priority,
    },
    Dispatched {
        id: WorkItemId,
        category: Category,
        priority: Priority,
        attempt: u32,
    },
    Completed {
        id: WorkItemId,
        category: Category,
        attempts: u32,
        duration_ms: u64,
    },
    RetryScheduled {
        id: WorkItemId,
        category: Category,
        attempt: u32,
        not_before: DateTime<Utc>,
    },
    Failed {
        id: WorkItemId,
        category: Category,
        failure: JobFailure,
    },
    Cancelled {
        id: WorkItemId,
        category: Category,
        /// Whether the item was running when cancelled
        was_running: bool,
    },
    /// An orphaned `running` item was reset to `pending`. Orphans with no
    /// attempts left are reported as `Failed` instead.
    Recovered {
        id: WorkItemId,
        category: Category,
        attempts: u32,
    },
    Purged {
        count: u64,
    },
}

impl QueueEvent {
    pub fn job_id(&self) -> Option<WorkItemId> {
        match self {
            QueueEvent::Submitted { id, .. }
            | QueueEvent::Dispatched { id, .. }
            | QueueEvent::Completed { id, .. }
            | QueueEvent::RetryScheduled { id, .. }
            | QueueEvent::Failed { id, .. }
            | QueueEvent::Cancelled { id, .. }
            | QueueEvent::Recovered { id, .. } => Some(*id),
            QueueEvent::Purged { .. } => None,
        }
    }
}

/// Sending half shared by the queue's components.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<QueueEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to current subscribers; dropped when there are none.
    pub fn publish(&self, event: QueueEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.tx.subscribe()
    }
}
