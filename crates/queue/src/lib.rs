//! Analysis job queue: durable work item store, priority scheduler, executor
//! pool, retry controller and the caller-facing job handle.

pub mod config;
pub mod jobs;

pub use config::{ConfigError, QueueConfig};
pub use jobs::{
    AwaitOutcome, CategoryMetrics, FailureKind, InMemoryWorkItemStore, JobFailure, JobHandle,
    JobQueue, JobQueueBuilder, JobRequest, JobStatusView, MetricsAggregator, PostgresWorkItemStore,
    QueueError, QueueEvent, RecoveryReport, RetryPolicy, SqliteWorkItemStore, StoreError,
    SweepReport, Transition, WorkItem, WorkItemStore, connect_store,
};
