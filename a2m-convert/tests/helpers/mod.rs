//! Test Helper Utilities
//!
//! Shared utilities for testing a2m-convert

#![allow(dead_code)]

pub mod audio_generator;
pub mod db_utils;
pub mod stub_pipeline;

// Re-export commonly used items
pub use audio_generator::{write_note_sequence, write_sine_wav, ToneNote};
pub use db_utils::{create_test_env, test_config, wait_for_status, wait_until_idle, TestEnv};
pub use stub_pipeline::StubPipeline;
