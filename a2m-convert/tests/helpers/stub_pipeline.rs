//! Deterministic pipeline for orchestrator tests
//!
//! Produces a fixed number of evenly spaced notes without touching the input
//! file. Stage failures and load latency are configurable.

use a2m_common::ProcessingStage;
use a2m_convert::pipeline::{
    AudioBuffer, ConversionPipeline, FeatureSet, MidiSerializer, NoteEvent, QualityReport,
};
use a2m_convert::{ConversionError, Result};
use ndarray::Array2;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const SAMPLE_RATE: u32 = 22050;
const SECONDS: usize = 12;

#[derive(Debug)]
pub struct StubPipeline {
    pub load_delay: Duration,
    pub note_count: usize,
    pub quality_score: f64,
    /// Stage that fails while `failures_remaining` is non-zero
    pub fail_at: Option<ProcessingStage>,
    pub failures_remaining: AtomicUsize,
    pub loads: AtomicUsize,
}

impl Default for StubPipeline {
    fn default() -> Self {
        Self {
            load_delay: Duration::ZERO,
            note_count: 3,
            quality_score: 0.9,
            fail_at: None,
            failures_remaining: AtomicUsize::new(0),
            loads: AtomicUsize::new(0),
        }
    }
}

impl StubPipeline {
    pub fn with_delay(load_delay: Duration) -> Self {
        Self {
            load_delay,
            ..Self::default()
        }
    }

    pub fn failing_at(stage: ProcessingStage, times: usize) -> Self {
        Self {
            fail_at: Some(stage),
            failures_remaining: AtomicUsize::new(times),
            ..Self::default()
        }
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    fn should_fail(&self, stage: ProcessingStage) -> bool {
        self.fail_at == Some(stage)
            && self
                .failures_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
    }
}

impl ConversionPipeline for StubPipeline {
    fn load_audio(&self, _path: &Path) -> Result<AudioBuffer> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.load_delay);
        if self.should_fail(ProcessingStage::AudioLoading) {
            return Err(ConversionError::AudioLoad("stub decoder failure".to_string()));
        }
        Ok(AudioBuffer::new(vec![0.0; SAMPLE_RATE as usize * SECONDS], SAMPLE_RATE))
    }

    fn extract_features(&self, audio: &AudioBuffer) -> Result<FeatureSet> {
        if self.should_fail(ProcessingStage::FeatureExtraction) {
            return Err(ConversionError::FeatureExtraction("stub analysis failure".to_string()));
        }
        let n_frames = 1 + audio.len() / 512;
        Ok(FeatureSet {
            tempo: 120.0,
            beats: (0..SECONDS * 2).map(|b| b as f64 * 0.5).collect(),
            chroma: Array2::zeros((12, n_frames)),
            mfcc: Array2::zeros((13, n_frames)),
            spectral_centroid: vec![0.0; n_frames],
            onsets: (0..self.note_count).map(|i| i as f64).collect(),
            key: "G major".to_string(),
            duration: audio.duration,
            sample_rate: audio.sample_rate,
            sample_count: audio.len(),
            hop_length: 512,
            n_frames,
        })
    }

    fn detect_notes(&self, _audio: &AudioBuffer, features: &FeatureSet) -> Result<Vec<NoteEvent>> {
        if self.should_fail(ProcessingStage::PitchDetection) {
            return Err(ConversionError::PitchDetection("stub tracker failure".to_string()));
        }
        Ok(features
            .onsets
            .iter()
            .enumerate()
            .map(|(i, &start)| NoteEvent {
                pitch: 60 + i as u8,
                frequency: 261.63,
                start,
                duration: 0.5,
                velocity: 80,
                confidence: 1.0,
            })
            .collect())
    }

    fn render_midi(&self, notes: &[NoteEvent], features: &FeatureSet) -> Result<Vec<u8>> {
        if self.should_fail(ProcessingStage::MidiGeneration) {
            return Err(ConversionError::MidiGeneration("stub writer failure".to_string()));
        }
        MidiSerializer::new().render(notes, features)
    }

    fn assess_quality(&self, _path: &Path) -> Result<QualityReport> {
        Ok(QualityReport {
            score: self.quality_score,
            rms: 0.2,
            peak: 0.5,
            zero_crossing_rate: 0.05,
            spectral_centroid: 1200.0,
            duration: SECONDS as f64,
            sample_rate: SAMPLE_RATE,
        })
    }
}
