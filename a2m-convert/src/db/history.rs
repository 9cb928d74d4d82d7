//! Append-only operation audit log

use a2m_common::{time, Error, OperationRecord, Result};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::retry::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};

/// Append an audit record; returns the new row id
pub async fn record_operation(pool: &SqlitePool, record: &OperationRecord) -> Result<i64> {
    // Prepare all data before touching the pool
    let task_id = record.task_id.to_string();
    let timestamp = time::to_db(record.timestamp);
    let metadata = record
        .metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| Error::Internal(format!("Failed to serialize metadata: {}", e)))?;

    retry_on_lock("record_operation", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        let result = sqlx::query(
            r#"
            INSERT INTO operation_history (
                task_id, operation, status, details, duration_ms, timestamp, metadata
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task_id)
        .bind(record.operation.as_str())
        .bind(record.status.as_str())
        .bind(&record.details)
        .bind(record.duration_ms)
        .bind(&timestamp)
        .bind(&metadata)
        .execute(pool)
        .await?;
        Ok(result.last_insert_rowid())
    })
    .await
}

/// All audit records for a task in chronological order
pub async fn load_history(pool: &SqlitePool, task_id: Uuid) -> Result<Vec<OperationRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT id, task_id, operation, status, details, duration_ms, timestamp, metadata
        FROM operation_history
        WHERE task_id = ?
        ORDER BY timestamp, id
        "#,
    )
    .bind(task_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| -> Result<OperationRecord> {
            let operation: String = row.try_get("operation")?;
            let status: String = row.try_get("status")?;
            let timestamp: String = row.try_get("timestamp")?;
            let metadata: Option<String> = row.try_get("metadata")?;
            let metadata: Option<serde_json::Value> = metadata
                .map(|m| serde_json::from_str(&m))
                .transpose()
                .map_err(|e| Error::Internal(format!("Failed to deserialize metadata: {}", e)))?;

            Ok(OperationRecord {
                id: Some(row.try_get("id")?),
                task_id,
                operation: operation.parse()?,
                status: status.parse()?,
                details: row.try_get("details")?,
                duration_ms: row.try_get("duration_ms")?,
                timestamp: time::from_db(&timestamp)?,
                metadata,
            })
        })
        .collect()
}
