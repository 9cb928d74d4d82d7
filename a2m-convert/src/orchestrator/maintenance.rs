//! Read-only statistics and the retention sweep

use a2m_common::events::ConversionEvent;
use a2m_common::{time, OperationKind, OperationRecord, Task, TaskStatus};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::TaskOrchestrator;
use crate::db;
use crate::error::Result;

/// Tasks whose files are deleted concurrently during a sweep
const CLEANUP_CONCURRENCY: usize = 4;

/// Snapshot of task counts and in-memory scheduling state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskStatistics {
    /// Every status is present
    pub counts: BTreeMap<TaskStatus, i64>,
    pub active_processing: usize,
    pub queued: usize,
    pub max_concurrent_tasks: usize,
}

impl TaskStatistics {
    pub fn count(&self, status: TaskStatus) -> i64 {
        self.counts.get(&status).copied().unwrap_or(0)
    }

    pub fn total(&self) -> i64 {
        self.counts.values().sum()
    }
}

impl TaskOrchestrator {
    pub async fn statistics(&self) -> Result<TaskStatistics> {
        let counts = db::tasks::status_counts(&self.inner.db).await?;
        let (active_processing, queued) = {
            let admission = self.admission();
            (admission.active.len(), admission.queue.len())
        };

        Ok(TaskStatistics {
            counts,
            active_processing,
            queued,
            max_concurrent_tasks: self.inner.config.max_concurrent_tasks,
        })
    }

    /// Delete COMPLETED/FAILED tasks created more than `older_than_hours` ago
    ///
    /// Tasks that are locked, active or queued for a retry are skipped. The
    /// row is removed before the input and output files. A task that cannot
    /// be cleaned is logged and left for the next sweep. Returns the number
    /// of rows removed; their audit history is kept.
    pub async fn cleanup(&self, older_than_hours: u64) -> Result<usize> {
        let cutoff = time::now() - chrono::Duration::hours(older_than_hours as i64);
        let candidates = db::tasks::list_cleanup_candidates(&self.inner.db, cutoff).await?;

        let removed = stream::iter(&candidates)
            .map(|task| async move {
                match self.cleanup_task(task).await {
                    Ok(removed) => removed,
                    Err(e) => {
                        warn!(task_id = %task.task_id, error = %e, "Failed to clean up task");
                        false
                    }
                }
            })
            .buffer_unordered(CLEANUP_CONCURRENCY)
            .filter(|removed| futures::future::ready(*removed))
            .count()
            .await;
        self.prune_locks();

        self.inner.event_bus.emit_lossy(ConversionEvent::TasksCleanedUp {
            removed,
            timestamp: time::now(),
        });
        info!(
            removed,
            candidates = candidates.len(),
            older_than_hours,
            "Cleanup finished"
        );
        Ok(removed)
    }

    async fn cleanup_task(&self, task: &Task) -> Result<bool> {
        // Holding the task's lock keeps `process` from admitting it meanwhile
        let Ok(_guard) = self.task_lock(task.task_id).try_lock_owned() else {
            debug!(task_id = %task.task_id, "Skipping cleanup of a task being processed");
            return Ok(false);
        };
        if self.is_admitted(task.task_id) {
            debug!(task_id = %task.task_id, "Skipping cleanup of an admitted task");
            return Ok(false);
        }

        // Row first: a task re-admitted since listing is no longer finished and stays
        if !db::tasks::delete_finished_task(&self.inner.db, task.task_id).await? {
            debug!(task_id = %task.task_id, "Task no longer finished, kept");
            return Ok(false);
        }

        let mut files_removed = 0;
        for path in std::iter::once(&task.input_file_path).chain(task.output_file_path.as_ref()) {
            match self.inner.store.delete(Path::new(path)).await {
                Ok(true) => files_removed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(task_id = %task.task_id, error = %e, "Failed to delete task file");
                }
            }
        }

        self.audit(
            OperationRecord::success(task.task_id, OperationKind::FileCleanup, "Task files cleaned up")
                .with_metadata(serde_json::json!({
                    "status": task.status.as_str(),
                    "files_removed": files_removed,
                })),
        )
        .await;
        Ok(true)
    }

    fn is_admitted(&self, task_id: Uuid) -> bool {
        let admission = self.admission();
        admission.active.contains(&task_id) || admission.queue.contains(&task_id)
    }
}
