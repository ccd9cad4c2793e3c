//! Work item storage: the contract and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use cafetal_core::{WorkItemId, WorkStatus};

use super::types::{Transition, WorkItem};

/// Durable home of every work item.
///
/// All status changes go through [`compare_and_set_status`], which is atomic
/// with respect to concurrent callers: of two racing updates expecting the
/// same status, exactly one succeeds.
///
/// [`compare_and_set_status`]: WorkItemStore::compare_and_set_status
#[async_trait]
pub trait WorkItemStore: Send + Sync + core::fmt::Debug {
    /// Persist a new item. Fails with `AlreadyExists` on id collision.
    async fn insert(&self, item: &WorkItem) -> Result<(), StoreError>;

    async fn get(&self, id: WorkItemId) -> Result<Option<WorkItem>, StoreError>;

    /// Apply `transition` if the current status equals `expected`, returning
    /// the updated item.
    async fn compare_and_set_status(
        &self,
        id: WorkItemId,
        expected: WorkStatus,
        transition: Transition,
    ) -> Result<WorkItem, StoreError>;

    /// Pending items with `not_before <= now`, in no particular order.
    async fn list_pending(&self, now: DateTime<Utc>) -> Result<Vec<WorkItem>, StoreError>;

    /// Every item with the given status, oldest first.
    async fn list_by_status(&self, status: WorkStatus) -> Result<Vec<WorkItem>, StoreError>;

    /// Delete items in one of the terminal `statuses` last updated before
    /// `older_than`. Returns the number removed.
    async fn purge(
        &self,
        older_than: DateTime<Utc>,
        statuses: &[WorkStatus],
    ) -> Result<u64, StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("work item not found: {0}")]
    NotFound(WorkItemId),

    #[error("work item already exists: {0}")]
    AlreadyExists(WorkItemId),

    /// The expected-status check failed; `actual` is the status that blocked
    /// the update, read atomically with the check.
    #[error("status conflict on {id}: expected {expected}, found {actual}")]
    Conflict {
        id: WorkItemId,
        expected: WorkStatus,
        actual: WorkStatus,
    },

    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: WorkStatus, to: WorkStatus },

    #[error("refusing to purge non-terminal status {0}")]
    NonTerminalPurge(WorkStatus),

    #[error("storage error: {0}")]
    Storage(String),

    /// A persisted row could not be decoded.
    #[error("corrupt work item row: {0}")]
    Corrupt(String),
}

pub(crate) fn ensure_purgeable(statuses: &[WorkStatus]) -> Result<(), StoreError> {
    match statuses.iter().find(|s| !s.is_terminal()) {
        Some(s) => Err(StoreError::NonTerminalPurge(*s)),
        None => Ok(()),
    }
}

pub(crate) fn ensure_permitted(expected: WorkStatus, transition: &Transition) -> Result<(), StoreError> {
    if transition.permits(expected) {
        Ok(())
    } else {
        Err(StoreError::IllegalTransition {
            from: expected,
            to: transition.target(),
        })
    }
}

/// In-memory store for tests and single-process development.
#[derive(Debug, Default)]
pub struct InMemoryWorkItemStore {
    items: RwLock<HashMap<WorkItemId, WorkItem>>,
}

impl InMemoryWorkItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.read().map(|items| items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<WorkItemId, WorkItem>>, StoreError> {
        self.items
            .read()
            .map_err(|_| StoreError::Storage("work item lock poisoned".into()))
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<WorkItemId, WorkItem>>, StoreError> {
        self.items
            .write()
            .map_err(|_| StoreError::Storage("work item lock poisoned".into()))
    }
}

#[async_trait]
impl WorkItemStore for InMemoryWorkItemStore {
    async fn insert(&self, item: &WorkItem) -> Result<(), StoreError> {
        let mut items = self.write()?;
        if items.contains_key(&item.id) {
            return Err(StoreError::AlreadyExists(item.id));
        }
        items.insert(item.id, item.clone());
        Ok(())
    }

    async fn get(&self, id: WorkItemId) -> Result<Option<WorkItem>, StoreError> {
        Ok(self.read()?.get(&id).cloned())
    }

    async fn compare_and_set_status(
        &self,
        id: WorkItemId,
        expected: WorkStatus,
        transition: Transition,
    ) -> Result<WorkItem, StoreError> {
        ensure_permitted(expected, &transition)?;

        let mut items = self.write()?;
        let item = items.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if item.status != expected {
            return Err(StoreError::Conflict {
                id,
                expected,
                actual: item.status,
            });
        }
        transition.apply(item);
        Ok(item.clone())
    }

    async fn list_pending(&self, now: DateTime<Utc>) -> Result<Vec<WorkItem>, StoreError> {
        Ok(self
            .read()?
            .values()
            .filter(|item| item.is_eligible(now))
            .cloned()
            .collect())
    }

    async fn list_by_status(&self, status: WorkStatus) -> Result<Vec<WorkItem>, StoreError> {
        let mut result: Vec<WorkItem> = self
            .read()?
            .values()
            .filter(|item| item.status == status)
            .cloned()
            .collect();
        result.sort_by_key(|item| (item.created_at, item.id));
        Ok(result)
    }

    async fn purge(
        &self,
        older_than: DateTime<Utc>,
        statuses: &[WorkStatus],
    ) -> Result<u64, StoreError> {
        ensure_purgeable(statuses)?;

        let mut items = self.write()?;
        let before = items.len();
        items.retain(|_, item| !(statuses.contains(&item.status) && item.updated_at < older_than));
        Ok((before - items.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{FailureKind, JobFailure};
    use cafetal_analysis::{AnalysisInput, AnalysisResult, Category};
    use cafetal_core::Priority;
    use chrono::Duration;

    fn item(now: DateTime<Utc>) -> WorkItem {
        WorkItem::new(
            Category::new("yield_prediction").unwrap(),
            AnalysisInput::new(b"plot-7".to_vec()),
            Priority::Medium,
            3,
            now,
        )
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_ids() {
        let store = InMemoryWorkItemStore::new();
        let item = item(Utc::now());

        store.insert(&item).await.unwrap();
        let err = store.insert(&item).await.unwrap_err();

        assert!(matches!(err, StoreError::AlreadyExists(id) if id == item.id));
    }

    #[tokio::test]
    async fn cas_reports_conflict_with_actual_status() {
        let store = InMemoryWorkItemStore::new();
        let now = Utc::now();
        let item = item(now);
        store.insert(&item).await.unwrap();

        let running = store
            .compare_and_set_status(item.id, WorkStatus::Pending, Transition::Dispatch { at: now })
            .await
            .unwrap();
        assert_eq!(running.attempts, 1);

        let err = store
            .compare_and_set_status(item.id, WorkStatus::Pending, Transition::Dispatch { at: now })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Conflict { actual: WorkStatus::Running, .. }
        ));
    }

    #[tokio::test]
    async fn cas_on_missing_item_is_not_found() {
        let store = InMemoryWorkItemStore::new();
        let err = store
            .compare_and_set_status(
                WorkItemId::new(),
                WorkStatus::Pending,
                Transition::Dispatch { at: Utc::now() },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn cas_rejects_transitions_outside_the_state_machine() {
        let store = InMemoryWorkItemStore::new();
        let now = Utc::now();
        let item = item(now);
        store.insert(&item).await.unwrap();

        let err = store
            .compare_and_set_status(
                item.id,
                WorkStatus::Pending,
                Transition::Complete {
                    result: AnalysisResult::new(1.0, 1.0),
                    at: now,
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::IllegalTransition { .. }));
        assert_eq!(store.get(item.id).await.unwrap().unwrap().status, WorkStatus::Pending);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_dispatch_has_one_winner() {
        let store = InMemoryWorkItemStore::arc();
        let now = Utc::now();
        let item = item(now);
        store.insert(&item).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            let id = item.id;
            tasks.push(tokio::spawn(async move {
                store
                    .compare_and_set_status(id, WorkStatus::Pending, Transition::Dispatch { at: now })
                    .await
                    .is_ok()
            }));
        }

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(store.get(item.id).await.unwrap().unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn list_pending_honours_not_before() {
        let store = InMemoryWorkItemStore::new();
        let now = Utc::now();
        let ready = item(now);
        let mut later = item(now);
        later.not_before = now + Duration::seconds(30);
        store.insert(&ready).await.unwrap();
        store.insert(&later).await.unwrap();

        let pending = store.list_pending(now).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, ready.id);

        assert_eq!(store.list_pending(now + Duration::seconds(31)).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn purge_removes_only_old_terminal_items() {
        let store = InMemoryWorkItemStore::new();
        let old = Utc::now() - Duration::days(10);
        let now = Utc::now();

        let stale = item(old);
        store.insert(&stale).await.unwrap();
        store
            .compare_and_set_status(stale.id, WorkStatus::Pending, Transition::Dispatch { at: old })
            .await
            .unwrap();
        store
            .compare_and_set_status(
                stale.id,
                WorkStatus::Running,
                Transition::Fail {
                    failure: JobFailure::new(FailureKind::Execution, "boom", 1),
                    at: old,
                },
            )
            .await
            .unwrap();

        let old_pending = item(old);
        store.insert(&old_pending).await.unwrap();

        let removed = store
            .purge(now - Duration::days(7), &WorkStatus::TERMINAL)
            .await
            .unwrap();

        assert_eq!(removed, 1);
        assert!(store.get(stale.id).await.unwrap().is_none());
        assert!(store.get(old_pending.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn purge_refuses_live_statuses() {
        let store = InMemoryWorkItemStore::new();
        let err = store
            .purge(Utc::now(), &[WorkStatus::Completed, WorkStatus::Running])
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::NonTerminalPurge(WorkStatus::Running)));
    }
}
