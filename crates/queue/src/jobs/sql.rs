//! Helpers shared by the SQL-backed stores.

use serde::de::DeserializeOwned;

use cafetal_core::{Priority, WorkItemId, WorkStatus};

use super::store::StoreError;

pub(crate) const TABLE_COLUMNS: &str = "id, category, payload, payload_metadata, priority, status, \
     attempts, max_attempts, created_at, updated_at, not_before, started_at, finished_at, \
     result, error";

/// Map a sqlx error to a [`StoreError`], naming the failed operation.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            StoreError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::ColumnDecode { index, source } => {
            StoreError::Corrupt(format!("column {index} in {operation}: {source}"))
        }
        _ => StoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

pub(crate) fn parse_status(raw: &str) -> Result<WorkStatus, StoreError> {
    raw.parse()
        .map_err(|e| StoreError::Corrupt(format!("status {raw:?}: {e}")))
}

pub(crate) fn parse_priority(raw: &str) -> Result<Priority, StoreError> {
    raw.parse()
        .map_err(|e| StoreError::Corrupt(format!("priority {raw:?}: {e}")))
}

pub(crate) fn parse_id(raw: &str) -> Result<WorkItemId, StoreError> {
    raw.parse()
        .map_err(|e| StoreError::Corrupt(format!("id {raw:?}: {e}")))
}

pub(crate) fn decode_json<T: DeserializeOwned>(
    column: &str,
    raw: Option<serde_json::Value>,
) -> Result<Option<T>, StoreError> {
    raw.map(serde_json::from_value)
        .transpose()
        .map_err(|e| StoreError::Corrupt(format!("{column}: {e}")))
}

pub(crate) fn encode_json<T: serde::Serialize>(
    column: &str,
    value: Option<&T>,
) -> Result<Option<serde_json::Value>, StoreError> {
    value
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| StoreError::Storage(format!("encoding {column}: {e}")))
}

pub(crate) fn count_to_u32(column: &str, raw: i64) -> Result<u32, StoreError> {
    u32::try_from(raw).map_err(|_| StoreError::Corrupt(format!("{column} out of range: {raw}")))
}
