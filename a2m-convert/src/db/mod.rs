//! SQLite persistence for conversion tasks and their audit history
//!
//! Tables are created idempotently at startup; there are no migrations.

pub mod history;
pub mod retry;
pub mod tasks;

pub use retry::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};

use a2m_common::Result;
use sqlx::SqlitePool;
use std::path::Path;

/// Open (creating if needed) the database file and initialize tables
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // mode=rwc: read, write, create
    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    tracing::debug!("Connecting to database: {}", db_url);

    let pool = SqlitePool::connect(&db_url).await?;
    init_tables(&pool).await?;

    Ok(pool)
}

/// Create the `tasks` and `operation_history` tables if they don't exist
///
/// Audit entries outlive the task rows removed by cleanup, so
/// `operation_history` has no foreign key to `tasks`.
pub async fn init_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            task_id TEXT PRIMARY KEY,
            original_filename TEXT NOT NULL,
            input_file_path TEXT NOT NULL,
            output_file_path TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            progress INTEGER NOT NULL DEFAULT 0,
            processing_stage TEXT,
            error_message TEXT,
            file_size INTEGER,
            output_size INTEGER,
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            processing_time INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_created_at ON tasks(created_at)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS operation_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL,
            operation TEXT NOT NULL,
            status TEXT NOT NULL,
            details TEXT,
            duration_ms INTEGER,
            timestamp TEXT NOT NULL,
            metadata TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_history_task ON operation_history(task_id, timestamp)",
    )
    .execute(pool)
    .await?;

    tracing::info!("Database tables initialized (tasks, operation_history)");

    Ok(())
}
