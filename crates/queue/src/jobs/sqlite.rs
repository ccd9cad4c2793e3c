//! SQLite-backed work item store.
//!
//! Timestamps are stored as epoch milliseconds, ids as text, results and
//! errors as JSON text. The database runs in WAL mode with
//! `synchronous = FULL`, so a committed transition survives power loss.
//!
//! Compare-and-set is a single `UPDATE ... WHERE id = ? AND status = ?
//! RETURNING ...`; SQLite serialises writers, so racing updates cannot both
//! match. A miss is followed by a status read in the same transaction, so a
//! `Conflict` reports the status that actually blocked the update.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::instrument;

use cafetal_analysis::{AnalysisInput, Category};
use cafetal_core::{WorkItemId, WorkStatus};

use super::sql::{
    TABLE_COLUMNS, count_to_u32, decode_json, encode_json, is_unique_violation, map_sqlx_error,
    parse_id, parse_priority, parse_status,
};
use super::store::{StoreError, WorkItemStore, ensure_permitted, ensure_purgeable};
use super::types::{Transition, WorkItem};

#[derive(Debug, Clone)]
pub struct SqliteWorkItemStore {
    pool: Arc<SqlitePool>,
}

impl SqliteWorkItemStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Open (creating if missing) the database at `url` and migrate it.
    ///
    /// `sqlite::memory:` gets a single pinned connection so the database
    /// lives as long as the store.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| map_sqlx_error("parse_url", e))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);

        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Create the table and index if they do not exist.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS work_items (
                id               TEXT PRIMARY KEY,
                category         TEXT NOT NULL,
                payload          BLOB NOT NULL,
                payload_metadata TEXT NOT NULL,
                priority         TEXT NOT NULL,
                status           TEXT NOT NULL,
                attempts         INTEGER NOT NULL,
                max_attempts     INTEGER NOT NULL,
                created_at       INTEGER NOT NULL,
                updated_at       INTEGER NOT NULL,
                not_before       INTEGER NOT NULL,
                started_at       INTEGER,
                finished_at      INTEGER,
                result           TEXT,
                error            TEXT
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_table", e))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS work_items_status_not_before ON work_items (status, not_before)",
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_index", e))?;

        Ok(())
    }

    async fn current_status(
        conn: &mut SqliteConnection,
        id: WorkItemId,
    ) -> Result<Option<WorkStatus>, StoreError> {
        let row = sqlx::query("SELECT status FROM work_items WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("current_status", e))?;

        row.map(|row| {
            let raw: String = row
                .try_get("status")
                .map_err(|e| map_sqlx_error("current_status", e))?;
            parse_status(&raw)
        })
        .transpose()
    }
}

#[async_trait]
impl WorkItemStore for SqliteWorkItemStore {
    #[instrument(skip(self, item), fields(job_id = %item.id), err)]
    async fn insert(&self, item: &WorkItem) -> Result<(), StoreError> {
        let metadata = serde_json::to_string(&item.payload.metadata)
            .map_err(|e| StoreError::Storage(format!("encoding payload metadata: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO work_items (
                id, category, payload, payload_metadata, priority, status,
                attempts, max_attempts, created_at, updated_at, not_before,
                started_at, finished_at, result, error
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
        )
        .bind(item.id.to_string())
        .bind(item.category.as_str())
        .bind(&item.payload.data)
        .bind(metadata)
        .bind(item.priority.as_str())
        .bind(item.status.as_str())
        .bind(i64::from(item.attempts))
        .bind(i64::from(item.max_attempts))
        .bind(item.created_at.timestamp_millis())
        .bind(item.updated_at.timestamp_millis())
        .bind(item.not_before.timestamp_millis())
        .bind(item.started_at.map(|t| t.timestamp_millis()))
        .bind(item.finished_at.map(|t| t.timestamp_millis()))
        .bind(json_text("result", item.result.as_ref())?)
        .bind(json_text("error", item.error.as_ref())?)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::AlreadyExists(item.id)
            } else {
                map_sqlx_error("insert", e)
            }
        })?;

        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: WorkItemId) -> Result<Option<WorkItem>, StoreError> {
        let row = sqlx::query(&format!("SELECT {TABLE_COLUMNS} FROM work_items WHERE id = ?1"))
            .bind(id.to_string())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(decode_row).transpose()
    }

    #[instrument(skip(self, transition), fields(job_id = %id, %expected, target = %transition.target()), err)]
    async fn compare_and_set_status(
        &self,
        id: WorkItemId,
        expected: WorkStatus,
        transition: Transition,
    ) -> Result<WorkItem, StoreError> {
        ensure_permitted(expected, &transition)?;
        let cols = transition.columns();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE work_items SET
                status      = ?1,
                attempts    = attempts + ?2,
                not_before  = COALESCE(?3, not_before),
                started_at  = COALESCE(?4, started_at),
                finished_at = COALESCE(?5, finished_at),
                result      = COALESCE(?6, result),
                error       = COALESCE(?7, error),
                updated_at  = ?8
            WHERE id = ?9 AND status = ?10
            RETURNING {TABLE_COLUMNS}
            "#
        ))
        .bind(cols.status.as_str())
        .bind(i64::from(cols.attempts_delta))
        .bind(cols.not_before.map(|t| t.timestamp_millis()))
        .bind(cols.started_at.map(|t| t.timestamp_millis()))
        .bind(cols.finished_at.map(|t| t.timestamp_millis()))
        .bind(json_text("result", cols.result.as_ref())?)
        .bind(json_text("error", cols.error.as_ref())?)
        .bind(cols.updated_at.timestamp_millis())
        .bind(id.to_string())
        .bind(expected.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("compare_and_set_status", e))?;

        // The UPDATE took the write lock, so this read sees the status that
        // defeated it.
        let outcome = match row {
            Some(row) => decode_row(&row),
            None => match Self::current_status(&mut *tx, id).await? {
                Some(actual) => Err(StoreError::Conflict {
                    id,
                    expected,
                    actual,
                }),
                None => Err(StoreError::NotFound(id)),
            },
        };
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        outcome
    }

    #[instrument(skip(self), err)]
    async fn list_pending(&self, now: DateTime<Utc>) -> Result<Vec<WorkItem>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TABLE_COLUMNS} FROM work_items WHERE status = ?1 AND not_before <= ?2"
        ))
        .bind(WorkStatus::Pending.as_str())
        .bind(now.timestamp_millis())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_pending", e))?;

        rows.iter().map(decode_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn list_by_status(&self, status: WorkStatus) -> Result<Vec<WorkItem>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TABLE_COLUMNS} FROM work_items WHERE status = ?1 ORDER BY created_at ASC, id ASC"
        ))
        .bind(status.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_by_status", e))?;

        rows.iter().map(decode_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn purge(
        &self,
        older_than: DateTime<Utc>,
        statuses: &[WorkStatus],
    ) -> Result<u64, StoreError> {
        ensure_purgeable(statuses)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut removed = 0;
        for status in statuses {
            let result = sqlx::query("DELETE FROM work_items WHERE status = ?1 AND updated_at < ?2")
                .bind(status.as_str())
                .bind(older_than.timestamp_millis())
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("purge", e))?;
            removed += result.rows_affected();
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(removed)
    }
}

fn json_text<T: serde::Serialize>(column: &str, value: Option<&T>) -> Result<Option<String>, StoreError> {
    Ok(encode_json(column, value)?.map(|v| v.to_string()))
}

fn millis(column: &str, raw: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(raw)
        .ok_or_else(|| StoreError::Corrupt(format!("{column} out of range: {raw}")))
}

fn decode_row(row: &SqliteRow) -> Result<WorkItem, StoreError> {
    let get_err = |e| map_sqlx_error("decode_row", e);

    let id: String = row.try_get("id").map_err(get_err)?;
    let category: String = row.try_get("category").map_err(get_err)?;
    let payload: Vec<u8> = row.try_get("payload").map_err(get_err)?;
    let metadata: String = row.try_get("payload_metadata").map_err(get_err)?;
    let priority: String = row.try_get("priority").map_err(get_err)?;
    let status: String = row.try_get("status").map_err(get_err)?;
    let attempts: i64 = row.try_get("attempts").map_err(get_err)?;
    let max_attempts: i64 = row.try_get("max_attempts").map_err(get_err)?;
    let created_at: i64 = row.try_get("created_at").map_err(get_err)?;
    let updated_at: i64 = row.try_get("updated_at").map_err(get_err)?;
    let not_before: i64 = row.try_get("not_before").map_err(get_err)?;
    let started_at: Option<i64> = row.try_get("started_at").map_err(get_err)?;
    let finished_at: Option<i64> = row.try_get("finished_at").map_err(get_err)?;
    let result: Option<String> = row.try_get("result").map_err(get_err)?;
    let error: Option<String> = row.try_get("error").map_err(get_err)?;

    let metadata = serde_json::from_str(&metadata)
        .map_err(|e| StoreError::Corrupt(format!("payload_metadata: {e}")))?;

    Ok(WorkItem {
        id: parse_id(&id)?,
        category: Category::new(category).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        payload: AnalysisInput::new(payload).with_metadata(metadata),
        priority: parse_priority(&priority)?,
        status: parse_status(&status)?,
        attempts: count_to_u32("attempts", attempts)?,
        max_attempts: count_to_u32("max_attempts", max_attempts)?,
        created_at: millis("created_at", created_at)?,
        updated_at: millis("updated_at", updated_at)?,
        not_before: millis("not_before", not_before)?,
        started_at: started_at.map(|t| millis("started_at", t)).transpose()?,
        finished_at: finished_at.map(|t| millis("finished_at", t)).transpose()?,
        result: decode_json("result", parse_json_text("result", result)?)?,
        error: decode_json("error", parse_json_text("error", error)?)?,
    })
}

fn parse_json_text(column: &str, raw: Option<String>) -> Result<Option<serde_json::Value>, StoreError> {
    raw.map(|text| serde_json::from_str(&text))
        .transpose()
        .map_err(|e| StoreError::Corrupt(format!("{column}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{FailureKind, JobFailure};
    use cafetal_analysis::AnalysisResult;
    use cafetal_core::Priority;
    use chrono::Duration;

    async fn memory_store() -> SqliteWorkItemStore {
        SqliteWorkItemStore::connect("sqlite::memory:").await.unwrap()
    }

    fn item(priority: Priority, now: DateTime<Utc>) -> WorkItem {
        WorkItem::new(
            Category::new("pest_classification").unwrap(),
            AnalysisInput::new(b"\x89PNG leaf".to_vec())
                .with_metadata(serde_json::json!({ "farm": "la-esperanza", "lot": 4 })),
            priority,
            3,
            now,
        )
    }

    fn millis_now() -> DateTime<Utc> {
        // Stored at millisecond precision.
        DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap()
    }

    #[tokio::test]
    async fn insert_then_get_preserves_the_item() {
        let store = memory_store().await;
        let item = item(Priority::Critical, millis_now());

        store.insert(&item).await.unwrap();
        let loaded = store.get(item.id).await.unwrap().unwrap();

        assert_eq!(loaded, item);
        assert!(matches!(
            store.insert(&item).await.unwrap_err(),
            StoreError::AlreadyExists(_)
        ));
    }

    #[tokio::test]
    async fn cas_walks_the_state_machine() {
        let store = memory_store().await;
        let now = millis_now();
        let item = item(Priority::High, now);
        store.insert(&item).await.unwrap();

        let running = store
            .compare_and_set_status(item.id, WorkStatus::Pending, Transition::Dispatch { at: now })
            .await
            .unwrap();
        assert_eq!(running.status, WorkStatus::Running);
        assert_eq!(running.attempts, 1);
        assert_eq!(running.started_at, Some(now));

        let conflict = store
            .compare_and_set_status(item.id, WorkStatus::Pending, Transition::Dispatch { at: now })
            .await
            .unwrap_err();
        assert!(matches!(
            conflict,
            StoreError::Conflict { expected: WorkStatus::Pending, actual: WorkStatus::Running, .. }
        ));

        let done = store
            .compare_and_set_status(
                item.id,
                WorkStatus::Running,
                Transition::Complete {
                    result: AnalysisResult::new(0.87, 0.93).with_explanation("roya detected"),
                    at: now + Duration::milliseconds(40),
                },
            )
            .await
            .unwrap();
        assert_eq!(done.status, WorkStatus::Completed);
        assert_eq!(done.result.unwrap().explanation.as_deref(), Some("roya detected"));
        assert!(done.error.is_none());
        assert_eq!(done.finished_at, Some(now + Duration::milliseconds(40)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn conflicts_under_contention_name_the_blocking_status() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("queue.db").display());
        let store = Arc::new(SqliteWorkItemStore::connect(&url).await.unwrap());
        let item = WorkItem::new(
            Category::new("pest_classification").unwrap(),
            AnalysisInput::new(b"leaf".to_vec()),
            Priority::Low,
            10_000,
            millis_now(),
        );
        store.insert(&item).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            let id = item.id;
            tasks.push(tokio::spawn(async move {
                let mut conflicts = Vec::new();
                for _ in 0..50 {
                    let now = Utc::now();
                    let steps = [
                        (WorkStatus::Pending, Transition::Dispatch { at: now }),
                        (WorkStatus::Running, Transition::Recover { at: now }),
                    ];
                    for (expected, transition) in steps {
                        match store.compare_and_set_status(id, expected, transition).await {
                            Ok(_) => {}
                            Err(StoreError::Conflict { expected, actual, .. }) => {
                                conflicts.push((expected, actual))
                            }
                            Err(other) => panic!("unexpected store error: {other}"),
                        }
                    }
                }
                conflicts
            }));
        }

        for task in tasks {
            for (expected, actual) in task.await.unwrap() {
                assert_ne!(expected, actual);
            }
        }
    }

    #[tokio::test]
    async fn cas_on_unknown_id_is_not_found() {
        let store = memory_store().await;
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
    async fn pending_listing_and_purge() {
        let store = memory_store().await;
        let now = millis_now();
        let ready = item(Priority::Low, now);
        let mut delayed = item(Priority::Low, now);
        delayed.not_before = now + Duration::minutes(5);
        store.insert(&ready).await.unwrap();
        store.insert(&delayed).await.unwrap();

        let pending = store.list_pending(now).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, ready.id);

        let old = now - Duration::days(30);
        store
            .compare_and_set_status(ready.id, WorkStatus::Pending, Transition::Cancel {
                failure: JobFailure::new(FailureKind::Cancelled, "cancelled by caller", 0),
                at: old,
            })
            .await
            .unwrap();

        let removed = store.purge(now - Duration::days(7), &WorkStatus::TERMINAL).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get(ready.id).await.unwrap().is_none());
        assert_eq!(store.list_by_status(WorkStatus::Pending).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn committed_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("queue.db").display());
        let now = millis_now();
        let item = item(Priority::Medium, now);

        {
            let store = SqliteWorkItemStore::connect(&url).await.unwrap();
            store.insert(&item).await.unwrap();
            store
                .compare_and_set_status(item.id, WorkStatus::Pending, Transition::Dispatch { at: now })
                .await
                .unwrap();
            store.pool.close().await;
        }

        let reopened = SqliteWorkItemStore::connect(&url).await.unwrap();
        let running = reopened.list_by_status(WorkStatus::Running).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, item.id);
        assert_eq!(running[0].attempts, 1);
    }
}
