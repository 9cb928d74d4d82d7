//! # a2m-common
//!
//! Shared code for the Audio2Midi conversion service:
//! - Error type used by every persistence and configuration call
//! - Bootstrap configuration (TOML + environment)
//! - Task and audit-history data model
//! - Event bus for conversion progress notifications
//! - Timestamp helpers for database storage

pub mod config;
pub mod error;
pub mod events;
pub mod models;
pub mod time;

pub use error::{Error, Result};
pub use models::{
    OperationKind, OperationOutcome, OperationRecord, ProcessingStage, Task, TaskStatus,
};
