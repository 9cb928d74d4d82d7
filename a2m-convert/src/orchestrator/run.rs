//! Execution of an admitted task: stage sequence, checkpoints, outcome

use a2m_common::events::ConversionEvent;
use a2m_common::{time, OperationKind, OperationRecord, ProcessingStage, Task, TaskStatus};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{ProcessOutcome, RejectReason, TaskOrchestrator};
use crate::db;
use crate::error::{ConversionError, Result};

/// How the stage sequence ended
enum StagesEnd {
    Rendered { midi: Vec<u8>, note_count: usize },
    Cancelled,
}

impl TaskOrchestrator {
    /// Run a task whose slot is already reserved, then release the slot
    ///
    /// `_guard` keeps the task's lock held for the whole run.
    pub(super) async fn run_admitted(&self, task: Task, _guard: OwnedMutexGuard<()>) -> ProcessOutcome {
        let task_id = task.task_id;
        let token = CancellationToken::new();
        self.tokens().insert(task_id, token.clone());

        let outcome = self.execute(task, &token).await;

        self.release_slot(task_id);
        outcome
    }

    async fn execute(&self, mut task: Task, token: &CancellationToken) -> ProcessOutcome {
        let task_id = task.task_id;
        let previous = task.status;

        if let Err(e) = task.mark_started() {
            warn!(task_id = %task_id, error = %e, "Task cannot start");
            return ProcessOutcome::Rejected(RejectReason::InvalidState(previous));
        }
        match db::tasks::save_transition(
            &self.inner.db,
            &task,
            &[TaskStatus::Pending, TaskStatus::Failed],
        )
        .await
        {
            Ok(true) => {}
            Ok(false) => {
                let current = match db::tasks::load_task(&self.inner.db, task_id).await {
                    Ok(Some(current)) => current.status,
                    _ => previous,
                };
                debug!(task_id = %task_id, status = %current, "Task changed state before it could start");
                return if current == TaskStatus::Cancelled {
                    ProcessOutcome::Cancelled
                } else {
                    ProcessOutcome::Rejected(RejectReason::InvalidState(current))
                };
            }
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Failed to mark task as processing");
                return ProcessOutcome::Rejected(RejectReason::Persistence(e.to_string()));
            }
        }

        let retry = previous == TaskStatus::Failed;
        self.audit(OperationRecord::info(
            task_id,
            OperationKind::TaskStarted,
            if retry { "Task processing restarted" } else { "Task processing started" },
        ))
        .await;
        self.inner.event_bus.emit_lossy(ConversionEvent::TaskStarted {
            task_id,
            timestamp: time::now(),
        });
        info!(task_id = %task_id, filename = %task.original_filename, retry, "Starting conversion");

        let started = Instant::now();
        let result = match self.run_stages(&mut task, token).await {
            Ok(StagesEnd::Rendered { midi, note_count }) => self.finalize(&mut task, midi, note_count).await,
            Ok(StagesEnd::Cancelled) => Ok(ProcessOutcome::Cancelled),
            Err(e) => Err(e),
        };

        match result {
            Ok(ProcessOutcome::Cancelled) => {
                info!(
                    task_id = %task_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Conversion stopped after cancellation"
                );
                ProcessOutcome::Cancelled
            }
            Ok(outcome) => outcome,
            Err(err) => self.fail(&mut task, err).await,
        }
    }

    async fn run_stages(&self, task: &mut Task, token: &CancellationToken) -> Result<StagesEnd> {
        let task_id = task.task_id;
        let input = PathBuf::from(&task.input_file_path);

        if self.inner.config.quality_precheck {
            self.quality_precheck(task_id, &input).await?;
        }

        if !self.checkpoint(task, ProcessingStage::AudioLoading, token).await? {
            return Ok(StagesEnd::Cancelled);
        }
        let pipeline = Arc::clone(&self.inner.pipeline);
        let audio = self
            .run_stage(
                task_id,
                ProcessingStage::AudioLoading,
                OperationKind::AudioLoading,
                move || pipeline.load_audio(&input),
                |audio| json!({ "duration": audio.duration, "sample_rate": audio.sample_rate }),
            )
            .await?;
        let audio = Arc::new(audio);

        if !self.checkpoint(task, ProcessingStage::FeatureExtraction, token).await? {
            return Ok(StagesEnd::Cancelled);
        }
        let pipeline = Arc::clone(&self.inner.pipeline);
        let stage_audio = Arc::clone(&audio);
        let features = self
            .run_stage(
                task_id,
                ProcessingStage::FeatureExtraction,
                OperationKind::FeatureExtraction,
                move || pipeline.extract_features(&stage_audio),
                |features| {
                    json!({
                        "tempo": features.tempo,
                        "key": features.key,
                        "onsets": features.onsets.len(),
                        "beats": features.beats.len(),
                    })
                },
            )
            .await?;
        let features = Arc::new(features);

        if !self.checkpoint(task, ProcessingStage::PitchDetection, token).await? {
            return Ok(StagesEnd::Cancelled);
        }
        let pipeline = Arc::clone(&self.inner.pipeline);
        let stage_features = Arc::clone(&features);
        let notes = self
            .run_stage(
                task_id,
                ProcessingStage::PitchDetection,
                OperationKind::PitchDetection,
                move || pipeline.detect_notes(&audio, &stage_features),
                |notes| json!({ "notes": notes.len() }),
            )
            .await?;
        let note_count = notes.len();

        if !self.checkpoint(task, ProcessingStage::MidiGeneration, token).await? {
            return Ok(StagesEnd::Cancelled);
        }
        let pipeline = Arc::clone(&self.inner.pipeline);
        let midi = self
            .run_stage(
                task_id,
                ProcessingStage::MidiGeneration,
                OperationKind::MidiGeneration,
                move || pipeline.render_midi(&notes, &features),
                |midi| json!({ "bytes": midi.len() }),
            )
            .await?;

        if !self.checkpoint(task, ProcessingStage::Finalization, token).await? {
            return Ok(StagesEnd::Cancelled);
        }
        Ok(StagesEnd::Rendered { midi, note_count })
    }

    /// Run one CPU-bound stage on a blocking thread, timing and auditing it
    async fn run_stage<T, F, D>(
        &self,
        task_id: Uuid,
        stage: ProcessingStage,
        operation: OperationKind,
        work: F,
        describe: D,
    ) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
        D: FnOnce(&T) -> serde_json::Value,
    {
        let started = Instant::now();
        let result = match tokio::task::spawn_blocking(work).await {
            Ok(result) => result,
            Err(join_error) => Err(ConversionError::from(join_error)),
        };
        let elapsed_ms = started.elapsed().as_millis() as i64;

        let record = match &result {
            Ok(value) => {
                debug!(task_id = %task_id, stage = ?stage, elapsed_ms, "Stage completed");
                OperationRecord::success(task_id, operation, format!("{} completed", stage))
                    .with_metadata(describe(value))
            }
            Err(e) => {
                warn!(task_id = %task_id, stage = ?stage, elapsed_ms, error = %e, "Stage failed");
                OperationRecord::failed(task_id, operation, e.to_string())
            }
        };
        self.audit(record.with_duration_ms(elapsed_ms)).await;

        result
    }

    /// Persist entry into `stage`; `false` when the task was cancelled
    async fn checkpoint(
        &self,
        task: &mut Task,
        stage: ProcessingStage,
        token: &CancellationToken,
    ) -> Result<bool> {
        if token.is_cancelled() {
            return Ok(false);
        }

        let progress = stage.checkpoint_progress();
        if !db::tasks::save_checkpoint(&self.inner.db, task.task_id, stage, progress).await? {
            debug!(task_id = %task.task_id, stage = ?stage, "Task no longer processing");
            return Ok(false);
        }
        task.update_progress(stage);

        self.inner.event_bus.emit_lossy(ConversionEvent::TaskProgress {
            task_id: task.task_id,
            stage,
            progress: task.progress,
            timestamp: time::now(),
        });
        debug!(task_id = %task.task_id, stage = ?stage, progress = task.progress, "Checkpoint");
        Ok(true)
    }

    /// Score the input before loading it
    ///
    /// An unreadable file is left for the loading stage to report. A low
    /// score fails the task only when the threshold is enforced.
    async fn quality_precheck(&self, task_id: Uuid, input: &Path) -> Result<()> {
        let report = match self.assess_quality(input).await {
            Ok(report) => report,
            Err(ConversionError::StageAborted(msg)) => return Err(ConversionError::StageAborted(msg)),
            Err(e) => {
                self.audit(OperationRecord::warning(
                    task_id,
                    OperationKind::QualityCheck,
                    format!("Quality check skipped: {}", e),
                ))
                .await;
                return Ok(());
            }
        };

        let threshold = self.inner.config.quality_threshold;
        let below = report.score < threshold;
        let metadata = json!({
            "score": report.score,
            "rms": report.rms,
            "peak": report.peak,
            "zero_crossing_rate": report.zero_crossing_rate,
            "spectral_centroid": report.spectral_centroid,
            "duration": report.duration,
        });
        let record = if below {
            warn!(task_id = %task_id, score = report.score, threshold, "Audio quality below threshold");
            OperationRecord::warning(
                task_id,
                OperationKind::QualityCheck,
                format!("Quality score {:.2} below threshold {:.2}", report.score, threshold),
            )
        } else {
            OperationRecord::info(
                task_id,
                OperationKind::QualityCheck,
                format!("Quality score {:.2}", report.score),
            )
        };
        self.audit(record.with_metadata(metadata)).await;

        if below && self.inner.config.enforce_quality_threshold {
            return Err(ConversionError::QualityBelowThreshold {
                score: report.score,
                threshold,
            });
        }
        Ok(())
    }

    /// Save the artifact and mark the task COMPLETED
    ///
    /// A cancellation landing after the artifact was written removes it again.
    async fn finalize(&self, task: &mut Task, midi: Vec<u8>, note_count: usize) -> Result<ProcessOutcome> {
        let task_id = task.task_id;
        let path = self.inner.store.save_output(task_id, &midi).await?;
        let output_path = path.to_string_lossy().into_owned();

        let mut completed = task.clone();
        completed.mark_completed(output_path.clone(), midi.len() as u64)?;
        match db::tasks::save_transition(&self.inner.db, &completed, &[TaskStatus::Processing]).await {
            Ok(true) => *task = completed,
            Ok(false) => {
                info!(task_id = %task_id, "Task cancelled during finalization, removing output");
                self.remove_output(task_id, &path).await;
                return Ok(ProcessOutcome::Cancelled);
            }
            Err(e) => {
                self.remove_output(task_id, &path).await;
                return Err(e.into());
            }
        }

        self.audit(
            OperationRecord::success(task_id, OperationKind::TaskCompleted, "MIDI file generated")
                .with_metadata(json!({
                    "output_path": output_path,
                    "output_size": midi.len(),
                    "notes": note_count,
                    "processing_time": task.processing_time,
                })),
        )
        .await;
        self.inner.event_bus.emit_lossy(ConversionEvent::TaskCompleted {
            task_id,
            output_path,
            note_count,
            timestamp: time::now(),
        });
        info!(
            task_id = %task_id,
            notes = note_count,
            bytes = midi.len(),
            processing_time = ?task.processing_time,
            "Conversion completed"
        );
        Ok(ProcessOutcome::Completed)
    }

    async fn remove_output(&self, task_id: Uuid, path: &Path) {
        if let Err(e) = self.inner.store.delete(path).await {
            warn!(task_id = %task_id, error = %e, "Failed to remove output artifact");
        }
    }

    /// Record a stage error on the task
    ///
    /// If the task was cancelled meanwhile, CANCELLED is kept.
    async fn fail(&self, task: &mut Task, err: ConversionError) -> ProcessOutcome {
        let task_id = task.task_id;
        let message = err.to_string();

        if let Err(e) = task.mark_failed(message.clone()) {
            error!(task_id = %task_id, error = %e, "Cannot mark task as failed");
            return ProcessOutcome::Failed;
        }

        match db::tasks::save_transition(&self.inner.db, task, &[TaskStatus::Processing]).await {
            Ok(true) => {}
            Ok(false) => {
                info!(task_id = %task_id, error = %message, "Stage failed after cancellation");
                return ProcessOutcome::Cancelled;
            }
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Failed to persist task failure");
                return ProcessOutcome::Failed;
            }
        }

        self.audit(OperationRecord::failed(task_id, OperationKind::ErrorOccurred, message.clone()))
            .await;
        self.audit(OperationRecord::failed(
            task_id,
            OperationKind::TaskFailed,
            "Task processing failed",
        ))
        .await;
        self.inner.event_bus.emit_lossy(ConversionEvent::TaskFailed {
            task_id,
            error: message.clone(),
            timestamp: time::now(),
        });
        error!(task_id = %task_id, error = %message, "Conversion failed");
        ProcessOutcome::Failed
    }
}
