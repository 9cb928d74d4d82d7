//! Conversion task lifecycle and audit-history model
//!
//! A [`Task`] progresses through:
//! PENDING → PROCESSING → COMPLETED | FAILED, with CANCELLED reachable from
//! PENDING or PROCESSING and FAILED → PROCESSING allowed for retries.
//!
//! While PROCESSING the task walks through [`ProcessingStage`]s, each with a
//! fixed progress checkpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::{Error, Result};

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Submitted, waiting for admission
    Pending,
    /// Admitted and running through the pipeline
    Processing,
    /// MIDI artifact written
    Completed,
    /// A stage failed; `error_message` says why
    Failed,
    /// Cancelled by the user
    Cancelled,
}

impl TaskStatus {
    /// Every status, in lifecycle order
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Processing,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Whether a task in this status may be admitted for processing
    pub fn is_admissible(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Failed)
    }

    /// Whether a task in this status may be cancelled
    pub fn is_cancellable(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Processing)
    }

    /// Permitted lifecycle edges
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Failed, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Pending, Cancelled)
                | (Processing, Cancelled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("Unknown task status: {}", s)))
    }
}

/// Pipeline stage of a PROCESSING task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStage {
    /// Admitted, no stage started yet
    Queued,
    /// Decoding and resampling
    AudioLoading,
    /// Tempo, chroma, MFCC, centroid, onsets, key
    FeatureExtraction,
    /// Onset-aligned pitch estimation
    PitchDetection,
    /// MIDI serialization
    MidiGeneration,
    /// Writing the output artifact
    Finalization,
}

impl ProcessingStage {
    pub const ALL: [ProcessingStage; 6] = [
        ProcessingStage::Queued,
        ProcessingStage::AudioLoading,
        ProcessingStage::FeatureExtraction,
        ProcessingStage::PitchDetection,
        ProcessingStage::MidiGeneration,
        ProcessingStage::Finalization,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProcessingStage::Queued => "queued",
            ProcessingStage::AudioLoading => "audio_loading",
            ProcessingStage::FeatureExtraction => "feature_extraction",
            ProcessingStage::PitchDetection => "pitch_detection",
            ProcessingStage::MidiGeneration => "midi_generation",
            ProcessingStage::Finalization => "finalization",
        }
    }

    /// Progress percentage persisted when the task enters this stage
    pub fn checkpoint_progress(self) -> u8 {
        match self {
            ProcessingStage::Queued => 0,
            ProcessingStage::AudioLoading => 10,
            ProcessingStage::FeatureExtraction => 25,
            ProcessingStage::PitchDetection => 50,
            ProcessingStage::MidiGeneration => 75,
            ProcessingStage::Finalization => 90,
        }
    }
}

impl fmt::Display for ProcessingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingStage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ProcessingStage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("Unknown processing stage: {}", s)))
    }
}

/// Status change produced by a lifecycle method
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusTransition {
    pub task_id: Uuid,
    pub old_status: TaskStatus,
    pub new_status: TaskStatus,
    pub transitioned_at: DateTime<Utc>,
}

/// A conversion job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: Uuid,
    pub original_filename: String,
    pub input_file_path: String,
    pub output_file_path: Option<String>,
    pub status: TaskStatus,
    /// 0-100
    pub progress: u8,
    pub processing_stage: Option<ProcessingStage>,
    pub error_message: Option<String>,
    pub file_size: Option<u64>,
    pub output_size: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Whole seconds between start and completion of the last run
    pub processing_time: Option<i64>,
}

impl Task {
    /// Create a new PENDING task
    pub fn new(original_filename: String, input_file_path: String, file_size: Option<u64>) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            original_filename,
            input_file_path,
            output_file_path: None,
            status: TaskStatus::Pending,
            progress: 0,
            processing_stage: None,
            error_message: None,
            file_size,
            output_size: None,
            created_at: crate::time::now(),
            started_at: None,
            completed_at: None,
            processing_time: None,
        }
    }

    fn transition_to(&mut self, new_status: TaskStatus) -> Result<StatusTransition> {
        if !self.status.can_transition_to(new_status) {
            return Err(Error::InvalidInput(format!(
                "Task {} cannot move from {} to {}",
                self.task_id, self.status, new_status
            )));
        }

        let transition = StatusTransition {
            task_id: self.task_id,
            old_status: self.status,
            new_status,
            transitioned_at: crate::time::now(),
        };
        self.status = new_status;
        Ok(transition)
    }

    /// PENDING/FAILED → PROCESSING; resets the per-run fields
    pub fn mark_started(&mut self) -> Result<StatusTransition> {
        let transition = self.transition_to(TaskStatus::Processing)?;
        self.started_at = Some(transition.transitioned_at);
        self.completed_at = None;
        self.processing_time = None;
        self.processing_stage = Some(ProcessingStage::Queued);
        self.progress = 0;
        self.error_message = None;
        Ok(transition)
    }

    /// Record entry into a stage; progress never moves backwards
    pub fn update_progress(&mut self, stage: ProcessingStage) {
        self.progress = self.progress.max(stage.checkpoint_progress()).min(100);
        self.processing_stage = Some(stage);
    }

    pub fn mark_completed(&mut self, output_path: String, output_size: u64) -> Result<StatusTransition> {
        let transition = self.transition_to(TaskStatus::Completed)?;
        self.output_file_path = Some(output_path);
        self.output_size = Some(output_size);
        self.progress = 100;
        self.processing_stage = None;
        self.finish_run(transition.transitioned_at);
        Ok(transition)
    }

    pub fn mark_failed(&mut self, error_message: String) -> Result<StatusTransition> {
        let transition = self.transition_to(TaskStatus::Failed)?;
        self.error_message = Some(error_message);
        self.processing_stage = None;
        self.finish_run(transition.transitioned_at);
        Ok(transition)
    }

    pub fn mark_cancelled(&mut self) -> Result<StatusTransition> {
        let transition = self.transition_to(TaskStatus::Cancelled)?;
        self.processing_stage = None;
        self.completed_at = Some(transition.transitioned_at);
        Ok(transition)
    }

    fn finish_run(&mut self, at: DateTime<Utc>) {
        self.completed_at = Some(at);
        self.processing_time = self.started_at.map(|start| (at - start).num_seconds());
    }

    pub fn can_be_cancelled(&self) -> bool {
        self.status.is_cancellable()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Check the stored-state invariants:
    /// progress == 100 with no stage iff COMPLETED, error message iff FAILED,
    /// a stage only while PROCESSING.
    pub fn is_consistent(&self) -> bool {
        let completed = self.status == TaskStatus::Completed;
        let done_shape = self.progress == 100 && self.processing_stage.is_none();
        let stage_ok = self.processing_stage.is_none() || self.status == TaskStatus::Processing;

        completed == done_shape
            && (self.status == TaskStatus::Failed) == self.error_message.is_some()
            && stage_ok
            && self.progress <= 100
    }
}

/// Audited operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    FileUpload,
    AudioLoading,
    FeatureExtraction,
    PitchDetection,
    MidiGeneration,
    FileCleanup,
    ErrorOccurred,
    TaskQueued,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskCancelled,
    QualityCheck,
}

impl OperationKind {
    pub const ALL: [OperationKind; 13] = [
        OperationKind::FileUpload,
        OperationKind::AudioLoading,
        OperationKind::FeatureExtraction,
        OperationKind::PitchDetection,
        OperationKind::MidiGeneration,
        OperationKind::FileCleanup,
        OperationKind::ErrorOccurred,
        OperationKind::TaskQueued,
        OperationKind::TaskStarted,
        OperationKind::TaskCompleted,
        OperationKind::TaskFailed,
        OperationKind::TaskCancelled,
        OperationKind::QualityCheck,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::FileUpload => "file_upload",
            OperationKind::AudioLoading => "audio_loading",
            OperationKind::FeatureExtraction => "feature_extraction",
            OperationKind::PitchDetection => "pitch_detection",
            OperationKind::MidiGeneration => "midi_generation",
            OperationKind::FileCleanup => "file_cleanup",
            OperationKind::ErrorOccurred => "error_occurred",
            OperationKind::TaskQueued => "task_queued",
            OperationKind::TaskStarted => "task_started",
            OperationKind::TaskCompleted => "task_completed",
            OperationKind::TaskFailed => "task_failed",
            OperationKind::TaskCancelled => "task_cancelled",
            OperationKind::QualityCheck => "quality_check",
        }
    }
}

impl FromStr for OperationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        OperationKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("Unknown operation kind: {}", s)))
    }
}

/// Outcome of an audited operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationOutcome {
    Success,
    Failed,
    Warning,
    Info,
}

impl OperationOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationOutcome::Success => "success",
            OperationOutcome::Failed => "failed",
            OperationOutcome::Warning => "warning",
            OperationOutcome::Info => "info",
        }
    }
}

impl FromStr for OperationOutcome {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "success" => Ok(OperationOutcome::Success),
            "failed" => Ok(OperationOutcome::Failed),
            "warning" => Ok(OperationOutcome::Warning),
            "info" => Ok(OperationOutcome::Info),
            other => Err(Error::InvalidInput(format!("Unknown operation outcome: {}", other))),
        }
    }
}

/// Append-only audit entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRecord {
    /// Row id, assigned on insert
    pub id: Option<i64>,
    pub task_id: Uuid,
    pub operation: OperationKind,
    pub status: OperationOutcome,
    pub details: Option<String>,
    pub duration_ms: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub metadata: Option<serde_json::Value>,
}

impl OperationRecord {
    pub fn new(
        task_id: Uuid,
        operation: OperationKind,
        status: OperationOutcome,
        details: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            task_id,
            operation,
            status,
            details: Some(details.into()),
            duration_ms: None,
            timestamp: crate::time::now(),
            metadata: None,
        }
    }

    pub fn success(task_id: Uuid, operation: OperationKind, details: impl Into<String>) -> Self {
        Self::new(task_id, operation, OperationOutcome::Success, details)
    }

    pub fn failed(task_id: Uuid, operation: OperationKind, details: impl Into<String>) -> Self {
        Self::new(task_id, operation, OperationOutcome::Failed, details)
    }

    pub fn warning(task_id: Uuid, operation: OperationKind, details: impl Into<String>) -> Self {
        Self::new(task_id, operation, OperationOutcome::Warning, details)
    }

    pub fn info(task_id: Uuid, operation: OperationKind, details: impl Into<String>) -> Self {
        Self::new(task_id, operation, OperationOutcome::Info, details)
    }

    pub fn with_duration_ms(mut self, duration_ms: i64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}
