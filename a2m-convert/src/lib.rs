//! a2m-convert library interface
//!
//! Converts audio recordings to Standard MIDI Files through a staged
//! analysis pipeline, and runs each conversion as a tracked background task.

pub mod db;
pub mod error;
pub mod orchestrator;
pub mod pipeline;
pub mod storage;

pub use crate::error::{ConversionError, Result};
pub use crate::orchestrator::{ProcessOutcome, RejectReason, TaskOrchestrator, TaskStatistics};
pub use crate::pipeline::{AudioToMidiPipeline, ConversionPipeline};
pub use crate::storage::FileStore;
