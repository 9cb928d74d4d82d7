//! Task row persistence
//!
//! Every status change is a single conditional `UPDATE` guarded on the status
//! the caller expects to replace. A return value of `false` means the row had
//! already moved on (typically: cancelled while a stage was running) and
//! nothing was written.

use a2m_common::{time, Error, ProcessingStage, Result, Task, TaskStatus};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::retry::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};

const TASK_COLUMNS: &str = r#"
    task_id, original_filename, input_file_path, output_file_path,
    status, progress, processing_stage, error_message,
    file_size, output_size, created_at, started_at, completed_at, processing_time
"#;

/// Insert a newly submitted task
pub async fn insert_task(pool: &SqlitePool, task: &Task) -> Result<()> {
    let task_id = task.task_id.to_string();
    let created_at = time::to_db(task.created_at);
    let started_at = task.started_at.map(time::to_db);
    let completed_at = task.completed_at.map(time::to_db);
    let stage = task.processing_stage.map(|s| s.as_str());
    let file_size = task.file_size.map(|s| s as i64);
    let output_size = task.output_size.map(|s| s as i64);

    retry_on_lock("insert_task", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        sqlx::query(
            r#"
            INSERT INTO tasks (
                task_id, original_filename, input_file_path, output_file_path,
                status, progress, processing_stage, error_message,
                file_size, output_size, created_at, started_at, completed_at, processing_time
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task_id)
        .bind(&task.original_filename)
        .bind(&task.input_file_path)
        .bind(&task.output_file_path)
        .bind(task.status.as_str())
        .bind(task.progress as i64)
        .bind(stage)
        .bind(&task.error_message)
        .bind(file_size)
        .bind(output_size)
        .bind(&created_at)
        .bind(&started_at)
        .bind(&completed_at)
        .bind(task.processing_time)
        .execute(pool)
        .await?;
        Ok(())
    })
    .await
}

/// Load a task by id
pub async fn load_task(pool: &SqlitePool, task_id: Uuid) -> Result<Option<Task>> {
    let row = sqlx::query(&format!("SELECT {} FROM tasks WHERE task_id = ?", TASK_COLUMNS))
        .bind(task_id.to_string())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(task_from_row).transpose()
}

/// Persist the lifecycle fields of `task` if the stored status is one of `expected`
///
/// Returns whether the row was updated.
pub async fn save_transition(
    pool: &SqlitePool,
    task: &Task,
    expected: &[TaskStatus],
) -> Result<bool> {
    if expected.is_empty() {
        return Err(Error::InvalidInput(
            "save_transition needs at least one expected status".to_string(),
        ));
    }

    let placeholders = vec!["?"; expected.len()].join(", ");
    let sql = format!(
        r#"
        UPDATE tasks SET
            status = ?,
            progress = ?,
            processing_stage = ?,
            error_message = ?,
            output_file_path = ?,
            output_size = ?,
            started_at = ?,
            completed_at = ?,
            processing_time = ?
        WHERE task_id = ? AND status IN ({})
        "#,
        placeholders
    );

    let task_id = task.task_id.to_string();
    let stage = task.processing_stage.map(|s| s.as_str());
    let output_size = task.output_size.map(|s| s as i64);
    let started_at = task.started_at.map(time::to_db);
    let completed_at = task.completed_at.map(time::to_db);

    retry_on_lock("save_transition", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        let mut query = sqlx::query(&sql)
            .bind(task.status.as_str())
            .bind(task.progress as i64)
            .bind(stage)
            .bind(&task.error_message)
            .bind(&task.output_file_path)
            .bind(output_size)
            .bind(&started_at)
            .bind(&completed_at)
            .bind(task.processing_time)
            .bind(&task_id);
        for status in expected {
            query = query.bind(status.as_str());
        }
        let result = query.execute(pool).await?;
        Ok(result.rows_affected() == 1)
    })
    .await
}

/// Persist a stage checkpoint for a PROCESSING task
///
/// Progress is written as `MAX(progress, new)`. Returns `false` when the task
/// is no longer PROCESSING.
pub async fn save_checkpoint(
    pool: &SqlitePool,
    task_id: Uuid,
    stage: ProcessingStage,
    progress: u8,
) -> Result<bool> {
    let task_id = task_id.to_string();

    retry_on_lock("save_checkpoint", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET progress = MAX(progress, ?), processing_stage = ?
            WHERE task_id = ? AND status = 'processing'
            "#,
        )
        .bind(progress as i64)
        .bind(stage.as_str())
        .bind(&task_id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() == 1)
    })
    .await
}

/// PENDING/PROCESSING → CANCELLED without touching progress or run timestamps
///
/// Returns `false` when the task had already left both states.
pub async fn save_cancellation(
    pool: &SqlitePool,
    task_id: Uuid,
    cancelled_at: DateTime<Utc>,
) -> Result<bool> {
    let task_id = task_id.to_string();
    let cancelled_at = time::to_db(cancelled_at);

    retry_on_lock("save_cancellation", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'cancelled', processing_stage = NULL, completed_at = ?
            WHERE task_id = ? AND status IN ('pending', 'processing')
            "#,
        )
        .bind(&cancelled_at)
        .bind(&task_id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() == 1)
    })
    .await
}

/// Task count per status; every status is present, zero when absent
pub async fn status_counts(pool: &SqlitePool) -> Result<BTreeMap<TaskStatus, i64>> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM tasks GROUP BY status")
            .fetch_all(pool)
            .await?;

    let mut counts: BTreeMap<TaskStatus, i64> =
        TaskStatus::ALL.into_iter().map(|status| (status, 0)).collect();
    for (status, count) in rows {
        let status: TaskStatus = status.parse()?;
        counts.insert(status, count);
    }
    Ok(counts)
}

/// COMPLETED or FAILED tasks created before `cutoff`
pub async fn list_cleanup_candidates(
    pool: &SqlitePool,
    cutoff: DateTime<Utc>,
) -> Result<Vec<Task>> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT {} FROM tasks
        WHERE status IN ('completed', 'failed') AND created_at < ?
        ORDER BY created_at
        "#,
        TASK_COLUMNS
    ))
    .bind(time::to_db(cutoff))
    .fetch_all(pool)
    .await?;

    rows.iter().map(task_from_row).collect()
}

/// Delete a COMPLETED or FAILED task row; returns whether a row was removed
///
/// A row that has moved back to PROCESSING (retry) is left alone.
pub async fn delete_finished_task(pool: &SqlitePool, task_id: Uuid) -> Result<bool> {
    let task_id = task_id.to_string();

    retry_on_lock("delete_finished_task", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        let result = sqlx::query(
            "DELETE FROM tasks WHERE task_id = ? AND status IN ('completed', 'failed')",
        )
        .bind(&task_id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() == 1)
    })
    .await
}

fn task_from_row(row: &SqliteRow) -> Result<Task> {
    let task_id: String = row.try_get("task_id")?;
    let task_id = Uuid::parse_str(&task_id)
        .map_err(|e| Error::InvalidInput(format!("Invalid task id {}: {}", task_id, e)))?;

    let status: String = row.try_get("status")?;
    let processing_stage: Option<String> = row.try_get("processing_stage")?;
    let progress: i64 = row.try_get("progress")?;
    let file_size: Option<i64> = row.try_get("file_size")?;
    let output_size: Option<i64> = row.try_get("output_size")?;
    let created_at: String = row.try_get("created_at")?;
    let started_at: Option<String> = row.try_get("started_at")?;
    let completed_at: Option<String> = row.try_get("completed_at")?;

    Ok(Task {
        task_id,
        original_filename: row.try_get("original_filename")?,
        input_file_path: row.try_get("input_file_path")?,
        output_file_path: row.try_get("output_file_path")?,
        status: status.parse()?,
        progress: progress.clamp(0, 100) as u8,
        processing_stage: processing_stage.map(|s| s.parse()).transpose()?,
        error_message: row.try_get("error_message")?,
        file_size: file_size.map(|s| s.max(0) as u64),
        output_size: output_size.map(|s| s.max(0) as u64),
        created_at: time::from_db(&created_at)?,
        started_at: started_at.as_deref().map(time::from_db).transpose()?,
        completed_at: completed_at.as_deref().map(time::from_db).transpose()?,
        processing_time: row.try_get("processing_time")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::db::init_tables(&pool).await.unwrap();
        pool
    }

    fn new_task() -> Task {
        Task::new("take.mp3".to_string(), "/tmp/take.mp3".to_string(), Some(2048))
    }

    #[tokio::test]
    async fn test_insert_and_load_round_trip() {
        let pool = setup_pool().await;
        let task = new_task();
        insert_task(&pool, &task).await.unwrap();

        let loaded = load_task(&pool, task.task_id).await.unwrap().unwrap();
        assert_eq!(loaded.task_id, task.task_id);
        assert_eq!(loaded.status, TaskStatus::Pending);
        assert_eq!(loaded.file_size, Some(2048));
        assert_eq!(loaded.created_at, task.created_at);
        assert!(load_task(&pool, Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transition_guarded_by_expected_status() {
        let pool = setup_pool().await;
        let mut task = new_task();
        insert_task(&pool, &task).await.unwrap();

        task.mark_started().unwrap();
        assert!(save_transition(&pool, &task, &[TaskStatus::Pending, TaskStatus::Failed])
            .await
            .unwrap());

        // A second start against the now-PROCESSING row must not apply
        assert!(!save_transition(&pool, &task, &[TaskStatus::Pending, TaskStatus::Failed])
            .await
            .unwrap());

        let loaded = load_task(&pool, task.task_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Processing);
        assert_eq!(loaded.processing_stage, Some(ProcessingStage::Queued));
    }

    #[tokio::test]
    async fn test_checkpoint_is_monotonic_and_stops_after_cancel() {
        let pool = setup_pool().await;
        let mut task = new_task();
        insert_task(&pool, &task).await.unwrap();
        task.mark_started().unwrap();
        save_transition(&pool, &task, &[TaskStatus::Pending]).await.unwrap();

        assert!(save_checkpoint(&pool, task.task_id, ProcessingStage::PitchDetection, 50)
            .await
            .unwrap());
        assert!(save_checkpoint(&pool, task.task_id, ProcessingStage::AudioLoading, 10)
            .await
            .unwrap());
        let loaded = load_task(&pool, task.task_id).await.unwrap().unwrap();
        assert_eq!(loaded.progress, 50);

        task.mark_cancelled().unwrap();
        assert!(save_transition(&pool, &task, &[TaskStatus::Processing]).await.unwrap());
        assert!(!save_checkpoint(&pool, task.task_id, ProcessingStage::MidiGeneration, 75)
            .await
            .unwrap());

        let loaded = load_task(&pool, task.task_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Cancelled);
        assert!(loaded.processing_stage.is_none());
    }

    #[tokio::test]
    async fn test_cancellation_keeps_progress_and_ignores_terminal_rows() {
        let pool = setup_pool().await;
        let mut task = new_task();
        insert_task(&pool, &task).await.unwrap();
        task.mark_started().unwrap();
        save_transition(&pool, &task, &[TaskStatus::Pending]).await.unwrap();
        save_checkpoint(&pool, task.task_id, ProcessingStage::FeatureExtraction, 25)
            .await
            .unwrap();

        assert!(save_cancellation(&pool, task.task_id, time::now()).await.unwrap());
        let loaded = load_task(&pool, task.task_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Cancelled);
        assert_eq!(loaded.progress, 25);
        assert!(loaded.processing_stage.is_none());
        assert!(loaded.completed_at.is_some());
        assert!(loaded.started_at.is_some());

        assert!(!save_cancellation(&pool, task.task_id, time::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_status_counts_include_every_status() {
        let pool = setup_pool().await;
        insert_task(&pool, &new_task()).await.unwrap();
        insert_task(&pool, &new_task()).await.unwrap();

        let counts = status_counts(&pool).await.unwrap();
        assert_eq!(counts.len(), 5);
        assert_eq!(counts[&TaskStatus::Pending], 2);
        assert_eq!(counts[&TaskStatus::Completed], 0);
    }

    #[tokio::test]
    async fn test_cleanup_candidates_filter_status_and_age() {
        let pool = setup_pool().await;
        let now = time::now();

        let mut old_done = new_task();
        old_done.created_at = now - chrono::Duration::hours(30);
        old_done.mark_started().unwrap();
        old_done.mark_completed("x.mid".to_string(), 10).unwrap();
        insert_task(&pool, &old_done).await.unwrap();

        let mut old_pending = new_task();
        old_pending.created_at = now - chrono::Duration::hours(30);
        insert_task(&pool, &old_pending).await.unwrap();

        let mut fresh_done = new_task();
        fresh_done.mark_started().unwrap();
        fresh_done.mark_completed("y.mid".to_string(), 10).unwrap();
        insert_task(&pool, &fresh_done).await.unwrap();

        let candidates = list_cleanup_candidates(&pool, now - chrono::Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].task_id, old_done.task_id);

        assert!(delete_finished_task(&pool, old_done.task_id).await.unwrap());
        assert!(!delete_finished_task(&pool, old_done.task_id).await.unwrap());
        // Unfinished rows are never deleted
        assert!(!delete_finished_task(&pool, old_pending.task_id).await.unwrap());
        assert!(load_task(&pool, old_pending.task_id).await.unwrap().is_some());
    }
}
