//! Database Test Utilities
//!
//! Temporary database + storage directories for orchestrator tests

use a2m_common::config::ProcessingConfig;
use a2m_common::{Task, TaskStatus};
use a2m_convert::{FileStore, TaskOrchestrator};
use anyhow::Result;
use sqlx::SqlitePool;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

/// Temporary database and artifact directories
///
/// `dir` must be kept alive for the duration of the test.
pub struct TestEnv {
    pub dir: TempDir,
    pub pool: SqlitePool,
    pub store: FileStore,
}

/// Create a database file with tables and empty upload/output directories
pub async fn create_test_env() -> Result<TestEnv> {
    let dir = TempDir::new()?;
    let pool = a2m_convert::db::init_database_pool(&dir.path().join("test_a2m.db")).await?;
    let store = FileStore::new(dir.path().join("uploads"), dir.path().join("outputs"));
    store.ensure_dirs().await?;

    Ok(TestEnv { dir, pool, store })
}

/// Defaults with the given ceiling; quality pre-check on but advisory
pub fn test_config(max_concurrent_tasks: usize) -> ProcessingConfig {
    ProcessingConfig {
        max_concurrent_tasks,
        ..ProcessingConfig::default()
    }
}

/// Poll until the task reaches `status`, failing after `timeout`
pub async fn wait_for_status(
    orchestrator: &TaskOrchestrator,
    task_id: Uuid,
    status: TaskStatus,
    timeout: Duration,
) -> Task {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let task = orchestrator
            .task(task_id)
            .await
            .expect("Failed to load task")
            .expect("Task not found");
        if task.status == status {
            return task;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "Task {} still {} after {:?}, expected {}",
            task_id,
            task.status,
            timeout,
            status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until no task is active or queued
pub async fn wait_until_idle(orchestrator: &TaskOrchestrator, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let stats = orchestrator.statistics().await.expect("Failed to read statistics");
        if stats.active_processing == 0 && stats.queued == 0 {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "Orchestrator still busy after {:?}: {:?}",
            timeout,
            stats
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
