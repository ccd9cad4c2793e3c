//! Analysis job queue.
//!
//! ```text
//! JobHandle::submit ──▶ WorkItemStore (pending)
//!                            │
//!        PriorityScheduler ◀─┘  highest score, CAS pending → running
//!                │
//!          ExecutorPool  (bounded slots, per-category timeout)
//!                │
//!        RetryController  CAS running → completed | pending (backoff) | failed
//!                │
//!  MetricsAggregator / QueueEvent subscribers
//! ```
//!
//! Every status change is a compare-and-set against the store, which is what
//! keeps an item from running twice when several schedulers share a store
//! and what lets a restart reclaim items left `running` by a crash.

use std::sync::Arc;

mod events;
mod executor;
mod handle;
mod metrics;
mod postgres;
mod queue;
pub(crate) mod retry;
mod scheduler;
mod sql;
mod sqlite;
mod store;
mod types;

pub use events::QueueEvent;
pub use executor::{AttemptError, ExecutorPool, InFlight, Outcome, Slot};
pub use handle::{AwaitOutcome, JobHandle, QueueError};
pub use metrics::{CategoryMetrics, MetricsAggregator};
pub use postgres::PostgresWorkItemStore;
pub use queue::{JobQueue, JobQueueBuilder, RecoveryReport, SweepReport};
pub use retry::{RetryController, RetryDecision, RetryPolicy, Settlement};
pub use scheduler::{PriorityScheduler, ScoringPolicy};
pub use sqlite::SqliteWorkItemStore;
pub use store::{InMemoryWorkItemStore, StoreError, WorkItemStore};
pub use types::{
    FailureKind, JobFailure, JobRequest, JobStatusView, Transition, TransitionColumns, WorkItem,
};

/// Open a store from a URL and migrate it.
///
/// `sqlite:` and `postgres://` (or `postgresql://`) URLs select the SQL
/// backends; `memory:` gives a non-durable in-memory store.
pub async fn connect_store(url: &str) -> Result<Arc<dyn WorkItemStore>, StoreError> {
    if url.starts_with("sqlite:") {
        Ok(Arc::new(SqliteWorkItemStore::connect(url).await?))
    } else if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        Ok(Arc::new(PostgresWorkItemStore::connect(url).await?))
    } else if url == "memory:" {
        Ok(Arc::new(InMemoryWorkItemStore::new()))
    } else {
        Err(StoreError::Storage(format!("unsupported store url: {url}")))
    }
}
