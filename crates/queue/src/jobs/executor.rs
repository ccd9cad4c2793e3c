//! Executor pool: bounded slots, per-category timeouts, panic isolation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use cafetal_analysis::{AnalysisError, AnalysisResult, WorkContext, WorkRegistry};
use cafetal_core::WorkItemId;

use super::types::{FailureKind, WorkItem};
use crate::config::QueueConfig;

/// Why a single attempt did not produce a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptError {
    pub kind: FailureKind,
    pub message: String,
}

impl AttemptError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Result of one execution attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub result: Result<AnalysisResult, AttemptError>,
    pub duration_ms: u64,
}

impl Outcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// An occupied executor slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct Slot {
    _permit: OwnedSemaphorePermit,
}

/// Runs registered work functions, at most `capacity` at a time.
///
/// Capacity is enforced by slots the dispatcher acquires before claiming an
/// item; the slot travels with the execution task and is released on every
/// exit path, panics included.
#[derive(Debug, Clone)]
pub struct ExecutorPool {
    registry: Arc<WorkRegistry>,
    config: Arc<QueueConfig>,
    slots: Arc<Semaphore>,
    capacity: usize,
    in_flight: Arc<Mutex<HashMap<WorkItemId, CancellationToken>>>,
}

impl ExecutorPool {
    pub fn new(registry: Arc<WorkRegistry>, config: Arc<QueueConfig>) -> Self {
        let capacity = config.max_concurrent;
        Self {
            registry,
            config,
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Wait for a free slot. `None` once the pool is closed.
    pub async fn acquire(&self) -> Option<Slot> {
        self.slots
            .clone()
            .acquire_owned()
            .await
            .ok()
            .map(|permit| Slot { _permit: permit })
    }

    pub fn try_acquire(&self) -> Option<Slot> {
        self.slots
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| Slot { _permit: permit })
    }

    /// Stop handing out slots; executions already running are unaffected.
    pub fn close(&self) {
        self.slots.close();
    }

    /// Signal the running attempt of `id` to stop. Returns whether one was
    /// in flight in this process.
    pub fn cancel_in_flight(&self, id: WorkItemId) -> bool {
        match self.lock_in_flight().get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every in-flight attempt (shutdown).
    pub fn cancel_all(&self) {
        for token in self.lock_in_flight().values() {
            token.cancel();
        }
    }

    pub fn in_flight(&self) -> usize {
        self.lock_in_flight().len()
    }

    pub fn is_in_flight(&self, id: WorkItemId) -> bool {
        self.lock_in_flight().contains_key(&id)
    }

    /// Register `id` as in flight so [`cancel_in_flight`](Self::cancel_in_flight)
    /// can reach it. The registration ends when the returned value drops.
    pub fn register(&self, id: WorkItemId) -> InFlight {
        let token = CancellationToken::new();
        self.lock_in_flight().insert(id, token.clone());
        InFlight {
            token,
            _guard: InFlightGuard {
                id,
                in_flight: self.in_flight.clone(),
            },
        }
    }

    /// Run the work function for a `running` item under its timeout.
    pub async fn execute(&self, item: &WorkItem) -> Outcome {
        let in_flight = self.register(item.id);
        self.execute_registered(item, in_flight).await
    }

    /// [`execute`](Self::execute) with a registration taken out earlier.
    pub async fn execute_registered(&self, item: &WorkItem, in_flight: InFlight) -> Outcome {
        let started = Instant::now();

        let Some(work) = self.registry.get(&item.category) else {
            return Outcome {
                result: Err(AttemptError::new(
                    FailureKind::UnknownCategory,
                    format!("no work function registered for category {}", item.category),
                )),
                duration_ms: 0,
            };
        };

        let token = in_flight.token.clone();
        let ctx = WorkContext::new(item.id, item.attempts, token.clone());
        let input = item.payload.clone();
        let budget = self.config.timeout_for(&item.category);

        debug!(job_id = %item.id, category = %item.category, attempt = item.attempts, ?budget, "executing");

        let mut task = tokio::spawn(async move { work.execute(&input, &ctx).await });
        let result = match tokio::time::timeout(budget, &mut task).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(err))) => Err(classify(err, &token)),
            Ok(Err(join_err)) if join_err.is_panic() => {
                let message = panic_message(join_err.into_panic());
                warn!(job_id = %item.id, category = %item.category, %message, "work function panicked");
                Err(AttemptError::new(FailureKind::Panicked, message))
            }
            Ok(Err(join_err)) => Err(AttemptError::new(
                FailureKind::Execution,
                format!("work task aborted: {join_err}"),
            )),
            Err(_) => {
                // The work function may ignore the token; abort makes sure the
                // task is dropped at its next await point.
                token.cancel();
                task.abort();
                Err(AttemptError::new(
                    FailureKind::Timeout,
                    format!("exceeded {}", humantime::format_duration(budget)),
                ))
            }
        };
        drop(in_flight);

        Outcome {
            result,
            duration_ms: elapsed_ms(started.elapsed()),
        }
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<WorkItemId, CancellationToken>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Cancellation handle of one in-flight attempt.
#[derive(Debug)]
pub struct InFlight {
    token: CancellationToken,
    _guard: InFlightGuard,
}

#[derive(Debug)]
struct InFlightGuard {
    id: WorkItemId,
    in_flight: Arc<Mutex<HashMap<WorkItemId, CancellationToken>>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

fn classify(err: AnalysisError, token: &CancellationToken) -> AttemptError {
    let kind = if matches!(err, AnalysisError::Cancelled) && token.is_cancelled() {
        FailureKind::Cancelled
    } else {
        FailureKind::Execution
    };
    AttemptError::new(kind, err.to_string())
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "work function panicked".to_string()
    }
}

fn elapsed_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cafetal_analysis::{AnalysisInput, Category, work_fn};
    use cafetal_core::{Priority, WorkStatus};
    use chrono::Utc;

    fn category(name: &str) -> Category {
        Category::new(name).unwrap()
    }

    fn running(category_name: &str) -> WorkItem {
        let mut item = WorkItem::new(
            category(category_name),
            AnalysisInput::new(b"frame".to_vec()),
            Priority::Medium,
            3,
            Utc::now(),
        );
        item.status = WorkStatus::Running;
        item.attempts = 1;
        item
    }

    fn pool(registry: WorkRegistry, config: QueueConfig) -> ExecutorPool {
        ExecutorPool::new(Arc::new(registry), Arc::new(config))
    }

    #[tokio::test]
    async fn successful_work_returns_result() {
        let registry = WorkRegistry::new().with(
            category("pest_classification"),
            work_fn(|input: AnalysisInput, _ctx: WorkContext| async move {
                Ok::<_, AnalysisError>(AnalysisResult::new(input.data.len() as f64, 0.9))
            }),
        );
        let pool = pool(registry, QueueConfig::default());

        let outcome = pool.execute(&running("pest_classification")).await;

        assert!(outcome.is_ok());
        assert_eq!(outcome.result.unwrap().score, 5.0);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn missing_work_function_is_unknown_category() {
        let pool = pool(WorkRegistry::new(), QueueConfig::default());

        let outcome = pool.execute(&running("soil_moisture")).await;

        assert_eq!(outcome.result.unwrap_err().kind, FailureKind::UnknownCategory);
    }

    #[tokio::test]
    async fn slow_work_times_out_and_is_signalled() {
        let observed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = observed.clone();
        let registry = WorkRegistry::new().with(
            category("yield_prediction"),
            work_fn(move |_input: AnalysisInput, ctx: WorkContext| {
                let flag = flag.clone();
                async move {
                    ctx.cancelled().await;
                    flag.store(true, std::sync::atomic::Ordering::SeqCst);
                    Err::<AnalysisResult, _>(AnalysisError::Cancelled)
                }
            }),
        );
        let config = QueueConfig::default()
            .with_category_timeout(&category("yield_prediction"), Duration::from_millis(50));
        let pool = pool(registry, config);

        let outcome = pool.execute(&running("yield_prediction")).await;

        assert_eq!(outcome.result.unwrap_err().kind, FailureKind::Timeout);
        assert!(outcome.duration_ms >= 50);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn panics_become_failures() {
        let registry = WorkRegistry::new().with(
            category("pest_classification"),
            work_fn(|_input: AnalysisInput, _ctx: WorkContext| async move {
                if true {
                    panic!("tensor shape mismatch");
                }
                Ok::<_, AnalysisError>(AnalysisResult::new(0.0, 0.0))
            }),
        );
        let pool = pool(registry, QueueConfig::default());

        let err = pool
            .execute(&running("pest_classification"))
            .await
            .result
            .unwrap_err();

        assert_eq!(err.kind, FailureKind::Panicked);
        assert!(err.message.contains("tensor shape mismatch"));
    }

    #[tokio::test]
    async fn slots_are_bounded_and_released_on_drop() {
        let pool = pool(WorkRegistry::new(), QueueConfig::default().with_max_concurrent(2));

        let a = pool.try_acquire().unwrap();
        let _b = pool.try_acquire().unwrap();
        assert!(pool.try_acquire().is_none());
        assert_eq!(pool.available_slots(), 0);

        drop(a);
        assert_eq!(pool.available_slots(), 1);
        assert!(pool.try_acquire().is_some());
    }

    #[tokio::test]
    async fn closed_pool_hands_out_no_slots() {
        let pool = pool(WorkRegistry::new(), QueueConfig::default());
        pool.close();
        assert!(pool.acquire().await.is_none());
    }

    #[tokio::test]
    async fn in_flight_work_can_be_cancelled() {
        let registry = WorkRegistry::new().with(
            category("pest_classification"),
            work_fn(|_input: AnalysisInput, ctx: WorkContext| async move {
                ctx.cancelled().await;
                Err::<AnalysisResult, _>(AnalysisError::Cancelled)
            }),
        );
        let pool = pool(registry, QueueConfig::default());
        let item = running("pest_classification");
        let id = item.id;

        let runner = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.execute(&item).await })
        };
        while pool.in_flight() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(pool.cancel_in_flight(id));

        let outcome = runner.await.unwrap();
        assert_eq!(outcome.result.unwrap_err().kind, FailureKind::Cancelled);
        assert!(!pool.cancel_in_flight(id));
    }
}
