//! The queue component: wiring, lifecycle, dispatch loop, recovery, sweeping.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, RwLock, broadcast};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use cafetal_analysis::{AnalysisWork, Category, WorkRegistry};
use cafetal_core::{Clock, SchedulerId, SystemClock, WorkStatus};

use super::events::{EventBus, QueueEvent};
use super::executor::{ExecutorPool, InFlight, Slot};
use super::handle::{JobHandle, QueueError};
use super::metrics::{CategoryMetrics, MetricsAggregator};
use super::retry::{RetryController, RetryDecision, Settlement, add_std};
use super::scheduler::{PriorityScheduler, ScoringPolicy};
use super::store::{InMemoryWorkItemStore, StoreError, WorkItemStore};
use super::types::{FailureKind, JobFailure, Transition, WorkItem};
use crate::config::QueueConfig;

/// Components shared by the queue's tasks and its handles.
pub(crate) struct QueueCore {
    pub(crate) store: Arc<dyn WorkItemStore>,
    pub(crate) registry: Arc<WorkRegistry>,
    pub(crate) config: Arc<QueueConfig>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) pool: ExecutorPool,
    pub(crate) metrics: MetricsAggregator,
    pub(crate) events: EventBus,
    /// Wakes the dispatch loop: new submission, freed slot, backoff elapsed.
    pub(crate) wake: Arc<Notify>,
    /// Held shared by submissions across insert and `Submitted`, exclusively
    /// by the dispatcher while it claims.
    pub(crate) submit_gate: RwLock<()>,
    scheduler: PriorityScheduler,
    retry: RetryController,
}

/// What [`JobQueue::recover_orphans`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Orphans reset to `pending`
    pub reset: usize,
    /// Orphans with no attempts left, failed as `interrupted`
    pub failed: usize,
}

/// What [`JobQueue::sweep_once`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub purged: u64,
    pub reclaimed: RecoveryReport,
}

pub struct JobQueueBuilder {
    store: Option<Arc<dyn WorkItemStore>>,
    registry: WorkRegistry,
    config: QueueConfig,
    clock: Option<Arc<dyn Clock>>,
}

impl JobQueueBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            registry: WorkRegistry::new(),
            config: QueueConfig::default(),
            clock: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn WorkItemStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn registry(mut self, registry: WorkRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn register<W: AnalysisWork>(mut self, category: Category, work: W) -> Self {
        self.registry.register(category, work);
        self
    }

    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<JobQueue, QueueError> {
        self.config.validate()?;

        let config = Arc::new(self.config);
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryWorkItemStore::new()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let registry = Arc::new(self.registry);

        let core = QueueCore {
            pool: ExecutorPool::new(registry.clone(), config.clone()),
            scheduler: PriorityScheduler::new(
                store.clone(),
                clock.clone(),
                ScoringPolicy::from_config(&config),
            ),
            retry: RetryController::new(config.retry_policy()),
            metrics: MetricsAggregator::new(),
            events: EventBus::new(config.event_capacity),
            wake: Arc::new(Notify::new()),
            submit_gate: RwLock::new(()),
            store,
            registry,
            config,
            clock,
        };

        Ok(JobQueue {
            id: SchedulerId::new(),
            core: Arc::new(core),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            started: AtomicBool::new(false),
        })
    }
}

impl Default for JobQueueBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// One logical analysis queue with an explicit start/stop lifecycle.
///
/// Several queues (in one or many processes) may share a store; all status
/// changes are compare-and-set, so each item still runs at most once at a
/// time.
pub struct JobQueue {
    id: SchedulerId,
    core: Arc<QueueCore>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    started: AtomicBool,
}

impl core::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobQueue")
            .field("id", &self.id)
            .field("store", &self.core.store)
            .field("registry", &self.core.registry)
            .field("max_concurrent", &self.core.config.max_concurrent)
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish()
    }
}

impl JobQueue {
    pub fn builder() -> JobQueueBuilder {
        JobQueueBuilder::new()
    }

    /// Identifies this queue instance in logs.
    pub fn scheduler_id(&self) -> SchedulerId {
        self.id
    }

    pub fn handle(&self) -> JobHandle {
        JobHandle::new(self.core.clone())
    }

    pub fn config(&self) -> &QueueConfig {
        &self.core.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.core.events.subscribe()
    }

    pub fn metrics(&self) -> BTreeMap<Category, CategoryMetrics> {
        self.core.metrics.snapshot()
    }

    /// Recover orphans, rebuild metrics, then spawn the dispatch loop and
    /// the retention sweeper.
    pub async fn start(&self) -> Result<RecoveryReport, QueueError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(QueueError::AlreadyStarted);
        }

        let recovered = match self.prepare().await {
            Ok(report) => report,
            Err(err) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };

        let core = self.core.clone();
        let shutdown = self.shutdown.clone();
        let tracker = self.tracker.clone();
        self.tracker
            .spawn(async move { core.dispatch_loop(shutdown, tracker).await });

        let core = self.core.clone();
        let shutdown = self.shutdown.clone();
        self.tracker
            .spawn(async move { core.sweep_loop(shutdown).await });

        info!(
            scheduler_id = %self.id,
            max_concurrent = self.core.config.max_concurrent,
            categories = ?self.core.registry.categories(),
            recovered = recovered.reset,
            "job queue started"
        );
        Ok(recovered)
    }

    /// Stop dispatching and wait for in-flight attempts to settle.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.core.pool.close();
        self.tracker.close();
        self.tracker.wait().await;
        info!(scheduler_id = %self.id, "job queue stopped");
    }

    /// Like [`shutdown`](Self::shutdown), but signals in-flight work
    /// functions to stop first. Attempts that stop because of it go back to
    /// `pending` with the attempt counted, or fail as `interrupted` when it
    /// was their last one.
    pub async fn shutdown_now(&self) {
        self.shutdown.cancel();
        self.core.pool.cancel_all();
        self.shutdown().await;
    }

    /// Reset `running` items that no live executor owns.
    ///
    /// With `grace == None` every `running` item counts as orphaned; only
    /// call it that way when this process is the store's sole owner.
    pub async fn recover_orphans(&self, grace: Option<Duration>) -> Result<RecoveryReport, QueueError> {
        self.core.recover_orphans(grace).await
    }

    /// One retention pass (and stale-running reclaim when configured).
    pub async fn sweep_once(&self) -> Result<SweepReport, QueueError> {
        self.core.sweep_once().await
    }

    async fn prepare(&self) -> Result<RecoveryReport, QueueError> {
        let recovered = self.core.recover_orphans(self.core.config.recovery_grace).await?;

        let mut terminal = Vec::new();
        for status in WorkStatus::TERMINAL {
            terminal.extend(self.core.store.list_by_status(status).await?);
        }
        self.core.metrics.rebuild(&terminal);
        debug!(terminal = terminal.len(), "metrics rebuilt from store");

        Ok(recovered)
    }
}

impl QueueCore {
    async fn dispatch_loop(self: Arc<Self>, shutdown: CancellationToken, tracker: TaskTracker) {
        debug!("dispatch loop running");
        loop {
            let slot = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                slot = self.pool.acquire() => match slot {
                    Some(slot) => slot,
                    None => break,
                },
            };

            let Some(item) = self.next_item(&shutdown).await else {
                break;
            };
            let in_flight = self.pool.register(item.id);

            self.events.publish(QueueEvent::Dispatched {
                id: item.id,
                category: item.category.clone(),
                priority: item.priority,
                attempt: item.attempts,
            });

            let core = self.clone();
            let attempt_tracker = tracker.clone();
            let attempt_shutdown = shutdown.clone();
            tracker.spawn(async move {
                core.run_attempt(item, slot, in_flight, attempt_tracker, attempt_shutdown)
                    .await
            });
        }
        debug!("dispatch loop stopped");
    }

    /// Wait until an item can be claimed; `None` on shutdown.
    async fn next_item(&self, shutdown: &CancellationToken) -> Option<WorkItem> {
        loop {
            let claimed = {
                let _gate = self.submit_gate.write().await;
                self.scheduler.claim_next().await
            };
            match claimed {
                Ok(Some(item)) => return Some(item),
                Ok(None) => {}
                Err(err) => error!(error = %err, "failed to claim next work item"),
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return None,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.config.safety_tick) => {}
            }
        }
    }

    async fn run_attempt(
        self: Arc<Self>,
        item: WorkItem,
        slot: Slot,
        in_flight: InFlight,
        tracker: TaskTracker,
        shutdown: CancellationToken,
    ) {
        let outcome = self.pool.execute_registered(&item, in_flight).await;
        let now = self.clock.now();

        let interrupted =
            matches!(&outcome.result, Err(err) if err.kind == FailureKind::Cancelled);
        if interrupted && shutdown.is_cancelled() {
            self.requeue_interrupted(&item, now).await;
            drop(slot);
            return;
        }

        match self
            .retry
            .settle(self.store.as_ref(), &item, &outcome, now)
            .await
        {
            Ok(Some(settlement)) => self.record(settlement, outcome.duration_ms, &tracker, &shutdown),
            Ok(None) => {}
            Err(err) => error!(
                job_id = %item.id,
                category = %item.category,
                error = %err,
                "failed to record attempt outcome; item stays running until reclaimed"
            ),
        }

        // The slot is held until the outcome is committed so the number of
        // `running` items never exceeds capacity.
        drop(slot);
        self.wake.notify_one();
    }

    /// Settle an attempt stopped by [`JobQueue::shutdown_now`] the way crash
    /// recovery would: back to `pending`, or `failed` when no attempts are left.
    async fn requeue_interrupted(&self, item: &WorkItem, now: DateTime<Utc>) {
        match self
            .store
            .compare_and_set_status(item.id, WorkStatus::Running, interrupted_transition(item, now))
            .await
        {
            Ok(updated) => {
                self.record_interrupted(updated);
            }
            Err(StoreError::Conflict { .. } | StoreError::NotFound(_)) => {}
            Err(err) => error!(
                job_id = %item.id,
                error = %err,
                "failed to settle interrupted job; item stays running until reclaimed"
            ),
        }
    }

    /// Log, count and publish a committed [`interrupted_transition`].
    /// Returns whether the item went back to `pending`.
    fn record_interrupted(&self, updated: WorkItem) -> bool {
        match updated.error {
            Some(failure) if updated.status == WorkStatus::Failed => {
                warn!(job_id = %updated.id, category = %updated.category, attempts = updated.attempts, "interrupted job failed, attempts exhausted");
                self.metrics.record_failed(&updated.category);
                self.events.publish(QueueEvent::Failed {
                    id: updated.id,
                    category: updated.category,
                    failure,
                });
                false
            }
            _ => {
                info!(job_id = %updated.id, category = %updated.category, attempts = updated.attempts, "interrupted job reset to pending");
                self.events.publish(QueueEvent::Recovered {
                    id: updated.id,
                    category: updated.category,
                    attempts: updated.attempts,
                });
                true
            }
        }
    }

    fn record(
        &self,
        settlement: Settlement,
        duration_ms: u64,
        tracker: &TaskTracker,
        shutdown: &CancellationToken,
    ) {
        let Settlement { item, decision } = settlement;
        match decision {
            RetryDecision::Complete(_) => {
                info!(job_id = %item.id, category = %item.category, attempts = item.attempts, duration_ms, "job completed");
                self.metrics.record_completed(&item.category, duration_ms);
                self.events.publish(QueueEvent::Completed {
                    id: item.id,
                    category: item.category,
                    attempts: item.attempts,
                    duration_ms,
                });
            }
            RetryDecision::Retry { delay, not_before } => {
                debug!(job_id = %item.id, attempt = item.attempts, ?delay, %not_before, "retry scheduled");
                self.metrics.record_retry(&item.category);
                self.events.publish(QueueEvent::RetryScheduled {
                    id: item.id,
                    category: item.category,
                    attempt: item.attempts,
                    not_before,
                });
                self.wake_after(delay, tracker, shutdown);
            }
            RetryDecision::Fail(failure) => {
                warn!(job_id = %item.id, category = %item.category, %failure, "job failed");
                self.metrics.record_failed(&item.category);
                self.events.publish(QueueEvent::Failed {
                    id: item.id,
                    category: item.category,
                    failure,
                });
            }
        }
    }

    fn wake_after(&self, delay: Duration, tracker: &TaskTracker, shutdown: &CancellationToken) {
        let shutdown = shutdown.clone();
        let wake = self.wake.clone();
        tracker.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => wake.notify_one(),
            }
        });
    }

    async fn recover_orphans(&self, grace: Option<Duration>) -> Result<RecoveryReport, QueueError> {
        let now = self.clock.now();
        let mut report = RecoveryReport::default();

        for item in self.store.list_by_status(WorkStatus::Running).await? {
            if self.pool.is_in_flight(item.id) {
                continue;
            }
            if let Some(grace) = grace {
                let started = item.started_at.unwrap_or(item.updated_at);
                if add_std(started, grace) > now {
                    continue;
                }
            }

            match self
                .store
                .compare_and_set_status(item.id, WorkStatus::Running, interrupted_transition(&item, now))
                .await
            {
                Ok(updated) => {
                    if self.record_interrupted(updated) {
                        report.reset += 1;
                    } else {
                        report.failed += 1;
                    }
                }
                Err(StoreError::Conflict { .. } | StoreError::NotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }

        if report.reset > 0 {
            self.wake.notify_one();
        }
        Ok(report)
    }

    async fn sweep_once(&self) -> Result<SweepReport, QueueError> {
        let now = self.clock.now();
        let cutoff = chrono::Duration::from_std(self.config.retention)
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let purged = self.store.purge(cutoff, &WorkStatus::TERMINAL).await?;
        if purged > 0 {
            info!(purged, %cutoff, "purged finished jobs past retention");
            self.events.publish(QueueEvent::Purged { count: purged });
        }

        let reclaimed = match self.config.recovery_grace {
            Some(grace) => self.recover_orphans(Some(grace)).await?,
            None => RecoveryReport::default(),
        };

        Ok(SweepReport { purged, reclaimed })
    }

    async fn sweep_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(err) = self.sweep_once().await {
                        error!(error = %err, "retention sweep failed");
                    }
                }
            }
        }
    }
}

/// `Recover` while attempts remain, otherwise a terminal `interrupted` failure.
fn interrupted_transition(item: &WorkItem, now: DateTime<Utc>) -> Transition {
    if item.attempts_exhausted() {
        Transition::Fail {
            failure: JobFailure::new(
                FailureKind::Interrupted,
                "interrupted while running and no attempts left",
                item.attempts,
            ),
            at: now,
        }
    } else {
        Transition::Recover { at: now }
    }
}
