//! Conversion task orchestrator
//!
//! Drives tasks through their lifecycle:
//!
//! ```text
//! PENDING → PROCESSING → COMPLETED | FAILED
//! PENDING | PROCESSING → CANCELLED
//! FAILED → PROCESSING (retry)
//! ```
//!
//! At most `max_concurrent_tasks` tasks run at once; further admissions wait
//! in a FIFO queue and start as slots free. Each task id has its own lock, so
//! a second `process` call for a task that is already being handled returns
//! immediately. Stages run on blocking worker threads; between stages a
//! checkpoint is written conditionally on the task still being PROCESSING,
//! which is how cooperative cancellation is observed.
//!
//! The persisted task row is the source of truth. In-memory state (active
//! set, queue, locks, cancellation tokens) only coordinates the runs of this
//! process.

mod maintenance;
mod run;

pub use maintenance::TaskStatistics;

use a2m_common::config::ProcessingConfig;
use a2m_common::events::{ConversionEvent, EventBus};
use a2m_common::{time, OperationKind, OperationRecord, Task, TaskStatus};
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db;
use crate::error::Result;
use crate::pipeline::{AudioToMidiPipeline, ConversionPipeline, QualityReport};
use crate::storage::FileStore;

/// Why `process` declined to run a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RejectReason {
    /// Another call holds the task's lock
    AlreadyRunning,
    /// Task is already active or waiting in the admission queue
    AlreadyAdmitted,
    NotFound,
    /// Status is neither PENDING nor FAILED
    InvalidState(TaskStatus),
    /// The task row could not be read or written
    Persistence(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::AlreadyRunning => write!(f, "task is already being processed"),
            RejectReason::AlreadyAdmitted => write!(f, "task is already active or queued"),
            RejectReason::NotFound => write!(f, "task not found"),
            RejectReason::InvalidState(status) => write!(f, "task is {}", status),
            RejectReason::Persistence(msg) => write!(f, "database error: {}", msg),
        }
    }
}

/// Result of a `process` call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ProcessOutcome {
    Completed,
    Failed,
    /// Capacity reached; the task will start when a slot frees
    Queued,
    Rejected(RejectReason),
    Cancelled,
}

impl ProcessOutcome {
    /// Completed, or accepted for later processing
    pub fn is_success(&self) -> bool {
        matches!(self, ProcessOutcome::Completed | ProcessOutcome::Queued)
    }
}

#[derive(Debug, Default)]
struct AdmissionState {
    active: HashSet<Uuid>,
    queue: VecDeque<Uuid>,
}

enum Admission {
    Start,
    Queued(usize),
    Duplicate,
}

struct Inner {
    db: SqlitePool,
    store: FileStore,
    pipeline: Arc<dyn ConversionPipeline>,
    event_bus: EventBus,
    config: ProcessingConfig,
    admission: Mutex<AdmissionState>,
    task_locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
    cancel_tokens: Mutex<HashMap<Uuid, CancellationToken>>,
}

/// Shared handle to the orchestrator; clones drive the same state
#[derive(Clone)]
pub struct TaskOrchestrator {
    inner: Arc<Inner>,
}

impl TaskOrchestrator {
    pub fn new(
        db: SqlitePool,
        store: FileStore,
        pipeline: Arc<dyn ConversionPipeline>,
        event_bus: EventBus,
        config: ProcessingConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                db,
                store,
                pipeline,
                event_bus,
                config,
                admission: Mutex::new(AdmissionState::default()),
                task_locks: Mutex::new(HashMap::new()),
                cancel_tokens: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Orchestrator running the default [`AudioToMidiPipeline`]
    pub fn with_default_pipeline(db: SqlitePool, store: FileStore, config: ProcessingConfig) -> Self {
        let pipeline = Arc::new(AudioToMidiPipeline::from_config(&config));
        Self::new(db, store, pipeline, EventBus::default(), config)
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.inner.event_bus
    }

    pub fn store(&self) -> &FileStore {
        &self.inner.store
    }

    pub fn config(&self) -> &ProcessingConfig {
        &self.inner.config
    }

    /// Register an already stored input file as a PENDING task
    pub async fn submit(&self, input_path: &Path, original_filename: &str) -> Result<Task> {
        let file_size = self.inner.store.size(input_path).await?;
        let task = Task::new(
            original_filename.to_string(),
            input_path.to_string_lossy().into_owned(),
            Some(file_size),
        );
        db::tasks::insert_task(&self.inner.db, &task).await?;

        self.audit(
            OperationRecord::success(task.task_id, OperationKind::FileUpload, "File uploaded successfully")
                .with_metadata(serde_json::json!({
                    "filename": original_filename,
                    "file_size": file_size,
                })),
        )
        .await;

        info!(
            task_id = %task.task_id,
            filename = %original_filename,
            file_size,
            "Task submitted"
        );
        Ok(task)
    }

    /// Store uploaded bytes and submit them
    pub async fn submit_bytes(&self, content: &[u8], original_filename: &str) -> Result<Task> {
        let path = self.inner.store.save_upload(content, original_filename).await?;
        self.submit(&path, original_filename).await
    }

    /// Copy a local file into the upload directory and submit it
    pub async fn import_file(&self, source: &Path) -> Result<Task> {
        let original_filename = source
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let path = self.inner.store.import_upload(source, &original_filename).await?;
        self.submit(&path, &original_filename).await
    }

    /// Admit and run a task
    ///
    /// Returns once the run ends, or immediately when the task is queued or
    /// rejected. Stage errors end the task as FAILED and are reported as
    /// [`ProcessOutcome::Failed`], never as an error.
    pub async fn process(&self, task_id: Uuid) -> ProcessOutcome {
        let Ok(guard) = self.task_lock(task_id).try_lock_owned() else {
            debug!(task_id = %task_id, "Task already being processed");
            return ProcessOutcome::Rejected(RejectReason::AlreadyRunning);
        };

        let task = match db::tasks::load_task(&self.inner.db, task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                warn!(task_id = %task_id, "Task not found");
                return self.reject(guard, RejectReason::NotFound);
            }
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Failed to load task");
                return self.reject(guard, RejectReason::Persistence(e.to_string()));
            }
        };

        if !task.status.is_admissible() {
            warn!(task_id = %task_id, status = %task.status, "Task not in a processable state");
            return self.reject(guard, RejectReason::InvalidState(task.status));
        }

        match self.admit(task_id) {
            Admission::Duplicate => {
                debug!(task_id = %task_id, "Task already active or queued");
                ProcessOutcome::Rejected(RejectReason::AlreadyAdmitted)
            }
            Admission::Queued(position) => {
                info!(task_id = %task_id, position, "Capacity reached, task queued");
                self.audit(
                    OperationRecord::info(task_id, OperationKind::TaskQueued, "Task queued for processing")
                        .with_metadata(serde_json::json!({ "position": position })),
                )
                .await;
                self.inner.event_bus.emit_lossy(ConversionEvent::TaskQueued {
                    task_id,
                    position,
                    timestamp: time::now(),
                });
                ProcessOutcome::Queued
            }
            Admission::Start => self.run_admitted(task, guard).await,
        }
    }

    /// `process` bounded by `limit`; on expiry the task is cancelled and the
    /// run is still awaited so its cleanup completes
    pub async fn process_with_timeout(&self, task_id: Uuid, limit: Duration) -> ProcessOutcome {
        let this = self.clone();
        let mut handle = tokio::spawn(async move { this.process(task_id).await });

        let joined = match tokio::time::timeout(limit, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!(
                    task_id = %task_id,
                    limit_secs = limit.as_secs_f64(),
                    "Processing timed out, cancelling"
                );
                if let Err(e) = self.cancel(task_id).await {
                    error!(task_id = %task_id, error = %e, "Failed to cancel timed out task");
                }
                handle.await
            }
        };

        joined.unwrap_or_else(|e| {
            error!(task_id = %task_id, error = %e, "Processing worker aborted");
            ProcessOutcome::Failed
        })
    }

    /// Cancel a PENDING or PROCESSING task
    ///
    /// A running stage is not interrupted; the run stops at its next
    /// checkpoint. Returns `false` when the task is unknown or not cancellable.
    pub async fn cancel(&self, task_id: Uuid) -> Result<bool> {
        let Some(mut task) = db::tasks::load_task(&self.inner.db, task_id).await? else {
            return Ok(false);
        };
        if !task.can_be_cancelled() {
            debug!(task_id = %task_id, status = %task.status, "Task not cancellable");
            return Ok(false);
        }

        let previous = task.status;
        let transition = task.mark_cancelled()?;
        if !db::tasks::save_cancellation(&self.inner.db, task_id, transition.transitioned_at).await? {
            debug!(task_id = %task_id, "Task finished before it could be cancelled");
            return Ok(false);
        }

        {
            let mut admission = self.admission();
            admission.active.remove(&task_id);
            admission.queue.retain(|queued| *queued != task_id);
        }
        if let Some(token) = self.tokens().get(&task_id) {
            token.cancel();
        }

        self.audit(OperationRecord::info(
            task_id,
            OperationKind::TaskCancelled,
            format!("Task cancelled while {}", previous),
        ))
        .await;
        self.inner.event_bus.emit_lossy(ConversionEvent::TaskCancelled {
            task_id,
            timestamp: transition.transitioned_at,
        });
        info!(task_id = %task_id, previous = %previous, "Task cancelled");

        self.drain_queue();
        Ok(true)
    }

    pub async fn task(&self, task_id: Uuid) -> Result<Option<Task>> {
        Ok(db::tasks::load_task(&self.inner.db, task_id).await?)
    }

    /// Audit trail for a task, oldest first
    pub async fn history(&self, task_id: Uuid) -> Result<Vec<OperationRecord>> {
        Ok(db::history::load_history(&self.inner.db, task_id).await?)
    }

    /// Score an audio file without creating a task
    pub async fn assess_quality(&self, path: &Path) -> Result<QualityReport> {
        let pipeline = Arc::clone(&self.inner.pipeline);
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || pipeline.assess_quality(&path)).await?
    }

    fn admit(&self, task_id: Uuid) -> Admission {
        let mut admission = self.admission();
        if admission.active.contains(&task_id) || admission.queue.contains(&task_id) {
            return Admission::Duplicate;
        }
        if admission.active.len() >= self.inner.config.max_concurrent_tasks {
            admission.queue.push_back(task_id);
            return Admission::Queued(admission.queue.len());
        }
        admission.active.insert(task_id);
        Admission::Start
    }

    /// Free the task's slot and start queued tasks while capacity allows
    fn release_slot(&self, task_id: Uuid) {
        self.admission().active.remove(&task_id);
        self.tokens().remove(&task_id);
        self.drain_queue();
        self.prune_locks();
    }

    fn drain_queue(&self) {
        let ready: Vec<Uuid> = {
            let mut admission = self.admission();
            let mut ready = Vec::new();
            while admission.active.len() < self.inner.config.max_concurrent_tasks {
                let Some(task_id) = admission.queue.pop_front() else {
                    break;
                };
                admission.active.insert(task_id);
                ready.push(task_id);
            }
            ready
        };

        for task_id in ready {
            debug!(task_id = %task_id, "Admitting queued task");
            self.spawn_queued(task_id);
        }
    }

    fn spawn_queued(&self, task_id: Uuid) {
        let this = self.clone();
        tokio::spawn(async move { this.run_queued(task_id).await });
    }

    /// Slot already reserved by `drain_queue`
    async fn run_queued(&self, task_id: Uuid) {
        let guard = self.task_lock(task_id).lock_owned().await;

        let task = match db::tasks::load_task(&self.inner.db, task_id).await {
            Ok(Some(task)) if task.status.is_admissible() => task,
            Ok(Some(task)) => {
                debug!(task_id = %task_id, status = %task.status, "Queued task no longer processable");
                self.release_slot(task_id);
                return;
            }
            Ok(None) => {
                warn!(task_id = %task_id, "Queued task disappeared");
                self.release_slot(task_id);
                return;
            }
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Failed to load queued task");
                self.release_slot(task_id);
                return;
            }
        };

        let outcome = self.run_admitted(task, guard).await;
        debug!(task_id = %task_id, outcome = ?outcome, "Queued task finished");
    }

    fn task_lock(&self, task_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .inner
            .task_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(task_id).or_default())
    }

    /// Release the task lock of a rejected call and forget its entry
    fn reject(&self, guard: OwnedMutexGuard<()>, reason: RejectReason) -> ProcessOutcome {
        drop(guard);
        self.prune_locks();
        ProcessOutcome::Rejected(reason)
    }

    /// Drop lock entries nobody holds
    fn prune_locks(&self) {
        self.inner
            .task_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    fn admission(&self) -> MutexGuard<'_, AdmissionState> {
        self.inner
            .admission
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn tokens(&self) -> MutexGuard<'_, HashMap<Uuid, CancellationToken>> {
        self.inner
            .cancel_tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an audit record; failures are logged, never returned
    async fn audit(&self, record: OperationRecord) {
        if let Err(e) = db::history::record_operation(&self.inner.db, &record).await {
            warn!(
                task_id = %record.task_id,
                operation = record.operation.as_str(),
                error = %e,
                "Failed to record operation"
            );
        }
    }
}

impl fmt::Debug for TaskOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let admission = self.admission();
        f.debug_struct("TaskOrchestrator")
            .field("active", &admission.active.len())
            .field("queued", &admission.queue.len())
            .field("max_concurrent_tasks", &self.inner.config.max_concurrent_tasks)
            .finish()
    }
}
