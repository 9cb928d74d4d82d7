//! Audio to MIDI conversion stages
//!
//! Each stage is a pure transform; the orchestrator sequences them and owns
//! all task state.
//!
//! ```text
//! AudioLoader -> FeatureExtractor -> NoteDetector -> MidiSerializer
//!                  (QualityAssessor runs separately as a pre-check)
//! ```

pub mod audio_loader;
pub mod features;
pub mod key;
pub mod midi;
pub mod notes;
pub mod quality;
pub mod spectral;

pub use audio_loader::{AudioBuffer, AudioLoader};
pub use features::{FeatureExtractor, FeatureSet};
pub use key::{ChromaRootEstimator, KeyEstimator, KeySignature, Mode};
pub use midi::MidiSerializer;
pub use notes::{FixedVelocity, NoteDetector, NoteEvent, PitchCandidate, PitchTracker, SpectralPeakTracker, VelocityModel};
pub use quality::{QualityAssessor, QualityReport};

use a2m_common::config::ProcessingConfig;
use std::path::Path;

use crate::error::Result;

/// The stage transforms driven by the orchestrator
///
/// Implementations are called from blocking worker threads and must not
/// hold any per-task state.
pub trait ConversionPipeline: Send + Sync {
    fn load_audio(&self, path: &Path) -> Result<AudioBuffer>;

    fn extract_features(&self, audio: &AudioBuffer) -> Result<FeatureSet>;

    fn detect_notes(&self, audio: &AudioBuffer, features: &FeatureSet) -> Result<Vec<NoteEvent>>;

    fn render_midi(&self, notes: &[NoteEvent], features: &FeatureSet) -> Result<Vec<u8>>;

    fn assess_quality(&self, path: &Path) -> Result<QualityReport>;
}

/// Default pipeline built from [`ProcessingConfig`]
#[derive(Debug, Clone, Default)]
pub struct AudioToMidiPipeline {
    loader: AudioLoader,
    extractor: FeatureExtractor,
    detector: NoteDetector,
    serializer: MidiSerializer,
    assessor: QualityAssessor,
}

impl AudioToMidiPipeline {
    pub fn from_config(config: &ProcessingConfig) -> Self {
        Self {
            loader: AudioLoader::from_config(config),
            extractor: FeatureExtractor::from_config(config),
            detector: NoteDetector::from_config(config),
            serializer: MidiSerializer::new(),
            assessor: QualityAssessor::from_config(config),
        }
    }

    pub fn with_extractor(mut self, extractor: FeatureExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_detector(mut self, detector: NoteDetector) -> Self {
        self.detector = detector;
        self
    }
}

impl ConversionPipeline for AudioToMidiPipeline {
    fn load_audio(&self, path: &Path) -> Result<AudioBuffer> {
        self.loader.load(path)
    }

    fn extract_features(&self, audio: &AudioBuffer) -> Result<FeatureSet> {
        self.extractor.extract(audio)
    }

    fn detect_notes(&self, audio: &AudioBuffer, features: &FeatureSet) -> Result<Vec<NoteEvent>> {
        self.detector.detect(audio, features)
    }

    fn render_midi(&self, notes: &[NoteEvent], features: &FeatureSet) -> Result<Vec<u8>> {
        self.serializer.render(notes, features)
    }

    fn assess_quality(&self, path: &Path) -> Result<QualityReport> {
        self.assessor.assess(path)
    }
}
