//! Postgres-backed work item store.
//!
//! Native column types (`UUID`, `TIMESTAMPTZ`, `BYTEA`, `JSONB`). The
//! compare-and-set locks the row (`SELECT ... FOR UPDATE`), checks the
//! expected status and runs a conditional `UPDATE ... RETURNING` in one
//! transaction, so several queue processes can share the table and a
//! `Conflict` carries the status that was actually held.
//!
//! ## Error Mapping
//!
//! | sqlx error | StoreError |
//! |------------|------------|
//! | unique violation on insert | `AlreadyExists` |
//! | column decode | `Corrupt` |
//! | anything else | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Row};
use tracing::instrument;

use cafetal_analysis::{AnalysisInput, Category};
use cafetal_core::{WorkItemId, WorkStatus};

use super::sql::{
    TABLE_COLUMNS, count_to_u32, decode_json, encode_json, is_unique_violation, map_sqlx_error,
    parse_priority, parse_status,
};
use super::store::{StoreError, WorkItemStore, ensure_permitted, ensure_purgeable};
use super::types::{Transition, WorkItem};

#[derive(Debug, Clone)]
pub struct PostgresWorkItemStore {
    pool: Arc<PgPool>,
}

impl PostgresWorkItemStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect to `url` and migrate.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
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
                id               UUID PRIMARY KEY,
                category         TEXT NOT NULL,
                payload          BYTEA NOT NULL,
                payload_metadata JSONB NOT NULL,
                priority         TEXT NOT NULL,
                status           TEXT NOT NULL,
                attempts         INTEGER NOT NULL,
                max_attempts     INTEGER NOT NULL,
                created_at       TIMESTAMPTZ NOT NULL,
                updated_at       TIMESTAMPTZ NOT NULL,
                not_before       TIMESTAMPTZ NOT NULL,
                started_at       TIMESTAMPTZ,
                finished_at      TIMESTAMPTZ,
                result           JSONB,
                error            JSONB
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

    /// Lock the row and read its status.
    async fn lock_status(
        conn: &mut PgConnection,
        id: WorkItemId,
    ) -> Result<Option<WorkStatus>, StoreError> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT status FROM work_items WHERE id = $1 FOR UPDATE")
                .bind(id.as_uuid())
                .fetch_optional(&mut *conn)
                .await
                .map_err(|e| map_sqlx_error("lock_status", e))?;

        raw.as_deref().map(parse_status).transpose()
    }
}

#[async_trait]
impl WorkItemStore for PostgresWorkItemStore {
    #[instrument(skip(self, item), fields(job_id = %item.id), err)]
    async fn insert(&self, item: &WorkItem) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO work_items (
                id, category, payload, payload_metadata, priority, status,
                attempts, max_attempts, created_at, updated_at, not_before,
                started_at, finished_at, result, error
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(item.id.as_uuid())
        .bind(item.category.as_str())
        .bind(&item.payload.data)
        .bind(&item.payload.metadata)
        .bind(item.priority.as_str())
        .bind(item.status.as_str())
        .bind(to_i32("attempts", item.attempts)?)
        .bind(to_i32("max_attempts", item.max_attempts)?)
        .bind(item.created_at)
        .bind(item.updated_at)
        .bind(item.not_before)
        .bind(item.started_at)
        .bind(item.finished_at)
        .bind(encode_json("result", item.result.as_ref())?)
        .bind(encode_json("error", item.error.as_ref())?)
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
        let row = sqlx::query(&format!("SELECT {TABLE_COLUMNS} FROM work_items WHERE id = $1"))
            .bind(id.as_uuid())
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

        match Self::lock_status(&mut *tx, id).await? {
            None => return Err(StoreError::NotFound(id)),
            Some(actual) if actual != expected => {
                return Err(StoreError::Conflict {
                    id,
                    expected,
                    actual,
                });
            }
            Some(_) => {}
        }

        let row = sqlx::query(&format!(
            r#"
            UPDATE work_items SET
                status      = $1,
                attempts    = attempts + $2,
                not_before  = COALESCE($3, not_before),
                started_at  = COALESCE($4, started_at),
                finished_at = COALESCE($5, finished_at),
                result      = COALESCE($6, result),
                error       = COALESCE($7, error),
                updated_at  = $8
            WHERE id = $9 AND status = $10
            RETURNING {TABLE_COLUMNS}
            "#
        ))
        .bind(cols.status.as_str())
        .bind(to_i32("attempts", cols.attempts_delta)?)
        .bind(cols.not_before)
        .bind(cols.started_at)
        .bind(cols.finished_at)
        .bind(encode_json("result", cols.result.as_ref())?)
        .bind(encode_json("error", cols.error.as_ref())?)
        .bind(cols.updated_at)
        .bind(id.as_uuid())
        .bind(expected.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("compare_and_set_status", e))?;

        let updated = decode_row(&row)?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(updated)
    }

    #[instrument(skip(self), err)]
    async fn list_pending(&self, now: DateTime<Utc>) -> Result<Vec<WorkItem>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TABLE_COLUMNS} FROM work_items WHERE status = $1 AND not_before <= $2"
        ))
        .bind(WorkStatus::Pending.as_str())
        .bind(now)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_pending", e))?;

        rows.iter().map(decode_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn list_by_status(&self, status: WorkStatus) -> Result<Vec<WorkItem>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TABLE_COLUMNS} FROM work_items WHERE status = $1 ORDER BY created_at ASC, id ASC"
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
        let statuses: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();

        let result = sqlx::query("DELETE FROM work_items WHERE status = ANY($1) AND updated_at < $2")
            .bind(&statuses)
            .bind(older_than)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("purge", e))?;

        Ok(result.rows_affected())
    }
}

fn to_i32(column: &str, value: u32) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|_| StoreError::Storage(format!("{column} out of range: {value}")))
}

fn decode_row(row: &PgRow) -> Result<WorkItem, StoreError> {
    let get_err = |e| map_sqlx_error("decode_row", e);

    let id: uuid::Uuid = row.try_get("id").map_err(get_err)?;
    let category: String = row.try_get("category").map_err(get_err)?;
    let payload: Vec<u8> = row.try_get("payload").map_err(get_err)?;
    let metadata: serde_json::Value = row.try_get("payload_metadata").map_err(get_err)?;
    let priority: String = row.try_get("priority").map_err(get_err)?;
    let status: String = row.try_get("status").map_err(get_err)?;
    let attempts: i32 = row.try_get("attempts").map_err(get_err)?;
    let max_attempts: i32 = row.try_get("max_attempts").map_err(get_err)?;
    let result: Option<serde_json::Value> = row.try_get("result").map_err(get_err)?;
    let error: Option<serde_json::Value> = row.try_get("error").map_err(get_err)?;

    Ok(WorkItem {
        id: WorkItemId::from_uuid(id),
        category: Category::new(category).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        payload: AnalysisInput::new(payload).with_metadata(metadata),
        priority: parse_priority(&priority)?,
        status: parse_status(&status)?,
        attempts: count_to_u32("attempts", i64::from(attempts))?,
        max_attempts: count_to_u32("max_attempts", i64::from(max_attempts))?,
        created_at: row.try_get("created_at").map_err(get_err)?,
        updated_at: row.try_get("updated_at").map_err(get_err)?,
        not_before: row.try_get("not_before").map_err(get_err)?,
        started_at: row.try_get("started_at").map_err(get_err)?,
        finished_at: row.try_get("finished_at").map_err(get_err)?,
        result: decode_json("result", result)?,
        error: decode_json("error", error)?,
    })
}
