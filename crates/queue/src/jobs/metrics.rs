//! Per-category counters and timings. Derived state only.

use std::collections::BTreeMap;
use std::sync::RwLock;

use serde::Serialize;

use cafetal_analysis::Category;
use cafetal_core::WorkStatus;

use super::types::WorkItem;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryMetrics {
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Attempts that ended in a retry
    pub retried: u64,
    /// Running mean of successful attempt durations
    pub avg_duration_ms: f64,
    pub max_duration_ms: u64,
}

impl CategoryMetrics {
    fn record_duration(&mut self, duration_ms: u64) {
        // `completed` was already incremented for this sample.
        let n = self.completed as f64;
        self.avg_duration_ms += (duration_ms as f64 - self.avg_duration_ms) / n;
        self.max_duration_ms = self.max_duration_ms.max(duration_ms);
    }

    pub fn terminal(&self) -> u64 {
        self.completed + self.failed + self.cancelled
    }
}

/// Accumulates [`CategoryMetrics`] on every terminal transition.
///
/// Safe to lose: [`rebuild`](Self::rebuild) reconstructs counts from the
/// store's terminal items.
#[derive(Debug, Default)]
pub struct MetricsAggregator {
    by_category: RwLock<BTreeMap<Category, CategoryMetrics>>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_completed(&self, category: &Category, duration_ms: u64) {
        self.update(category, |m| {
            m.completed += 1;
            m.record_duration(duration_ms);
        });
    }

    pub fn record_failed(&self, category: &Category) {
        self.update(category, |m| m.failed += 1);
    }

    pub fn record_cancelled(&self, category: &Category) {
        self.update(category, |m| m.cancelled += 1);
    }

    pub fn record_retry(&self, category: &Category) {
        self.update(category, |m| m.retried += 1);
    }

    pub fn category(&self, category: &Category) -> Option<CategoryMetrics> {
        self.read().get(category).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<Category, CategoryMetrics> {
        self.read().clone()
    }

    /// Replace the counters with what `items` imply.
    ///
    /// Durations come from `started_at`/`finished_at` of the final attempt;
    /// retry counts from attempts beyond the first.
    pub fn rebuild<'a>(&self, items: impl IntoIterator<Item = &'a WorkItem>) {
        let mut fresh: BTreeMap<Category, CategoryMetrics> = BTreeMap::new();
        for item in items {
            let m = fresh.entry(item.category.clone()).or_default();
            match item.status {
                WorkStatus::Completed => {
                    m.completed += 1;
                    m.record_duration(item.last_attempt_ms().unwrap_or(0));
                }
                WorkStatus::Failed => m.failed += 1,
                WorkStatus::Cancelled => m.cancelled += 1,
                WorkStatus::Pending | WorkStatus::Running => {}
            }
            m.retried += u64::from(item.attempts.saturating_sub(1));
        }
        *self.write() = fresh;
    }

    fn update(&self, category: &Category, f: impl FnOnce(&mut CategoryMetrics)) {
        let mut guard = self.write();
        f(guard.entry(category.clone()).or_default());
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<Category, CategoryMetrics>> {
        self.by_category.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<Category, CategoryMetrics>> {
        self.by_category.write().unwrap_or_else(|e| e.into_inner())
    }
}
