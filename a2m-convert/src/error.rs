//! Error types for a2m-convert
//!
//! Every pipeline stage returns [`ConversionError`]. The orchestrator catches
//! these at its boundary and records them on the task; they never escape
//! `TaskOrchestrator::process`.

use thiserror::Error;

/// Conversion pipeline error
#[derive(Debug, Error)]
pub enum ConversionError {
    /// File unreadable, corrupt or without a decodable audio track
    #[error("Failed to load audio: {0}")]
    AudioLoad(String),

    /// Decoding produced zero samples
    #[error("Audio file is empty")]
    EmptyAudio,

    #[error("Audio too short: {actual:.2}s (minimum {min:.2}s)")]
    DurationTooShort { actual: f64, min: f64 },

    #[error("Audio too long: {actual:.2}s (maximum {max:.2}s)")]
    DurationTooLong { actual: f64, max: f64 },

    #[error("Feature extraction failed: {0}")]
    FeatureExtraction(String),

    #[error("Pitch detection failed: {0}")]
    PitchDetection(String),

    #[error("MIDI generation failed: {0}")]
    MidiGeneration(String),

    /// Quality pre-check score below the enforced threshold
    #[error("Audio quality {score:.2} below threshold {threshold:.2}")]
    QualityBelowThreshold { score: f64, threshold: f64 },

    /// Artifact storage failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// a2m-common error (database, configuration, ...)
    #[error("Common error: {0}")]
    Common(#[from] a2m_common::Error),

    /// A blocking stage worker panicked or was aborted
    #[error("Stage aborted: {0}")]
    StageAborted(String),
}

impl From<sqlx::Error> for ConversionError {
    fn from(err: sqlx::Error) -> Self {
        ConversionError::Common(a2m_common::Error::Database(err))
    }
}

impl From<tokio::task::JoinError> for ConversionError {
    fn from(err: tokio::task::JoinError) -> Self {
        ConversionError::StageAborted(err.to_string())
    }
}

/// Result type for conversion operations
pub type Result<T> = std::result::Result<T, ConversionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_messages_include_bounds() {
        let err = ConversionError::DurationTooShort {
            actual: 3.5,
            min: 10.0,
        };
        assert_eq!(err.to_string(), "Audio too short: 3.50s (minimum 10.00s)");
    }

    #[test]
    fn test_common_error_converts() {
        let err: ConversionError = a2m_common::Error::NotFound("task".to_string()).into();
        assert!(matches!(err, ConversionError::Common(_)));
        assert!(err.to_string().contains("task"));
    }
}
