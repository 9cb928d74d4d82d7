//! Advisory audio quality scoring

use a2m_common::config::ProcessingConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use super::audio_loader::{AudioBuffer, AudioLoader};
use super::features::spectral_centroid;
use super::spectral::Spectrogram;
use crate::error::Result;

const FRAME_LENGTH: usize = 2048;
const HOP_LENGTH: usize = 512;

const QUIET_RMS: f32 = 0.01;
const NOISY_ZCR: f32 = 0.1;
const DULL_CENTROID_HZ: f32 = 500.0;

/// Signal statistics and the derived 0-1 score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub score: f64,
    pub rms: f32,
    pub peak: f32,
    pub zero_crossing_rate: f32,
    /// Mean over frames, Hz
    pub spectral_centroid: f32,
    pub duration: f64,
    pub sample_rate: u32,
}

#[derive(Debug, Clone)]
pub struct QualityAssessor {
    loader: AudioLoader,
    min_duration: f64,
    max_duration: f64,
}

impl QualityAssessor {
    pub fn new(loader: AudioLoader, min_duration: f64, max_duration: f64) -> Self {
        Self {
            loader,
            min_duration,
            max_duration,
        }
    }

    pub fn from_config(config: &ProcessingConfig) -> Self {
        Self::new(
            AudioLoader::from_config(config),
            config.min_duration,
            config.max_duration,
        )
    }

    /// Decode `path` (no duration gate) and score it
    pub fn assess(&self, path: &Path) -> Result<QualityReport> {
        let audio = self.loader.decode(path)?;
        let report = self.assess_buffer(&audio);
        info!(
            path = %path.display(),
            score = format!("{:.3}", report.score),
            rms = report.rms,
            zcr = report.zero_crossing_rate,
            centroid = report.spectral_centroid,
            "Audio quality assessed"
        );
        Ok(report)
    }

    pub fn assess_buffer(&self, audio: &AudioBuffer) -> QualityReport {
        let n = audio.len().max(1) as f32;
        let rms = (audio.samples.iter().map(|s| s * s).sum::<f32>() / n).sqrt();
        let peak = audio.samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
        let zero_crossing_rate = zero_crossing_rate(&audio.samples);

        // Buffers shorter than one window have no meaningful spectrum
        let spectral_centroid = Spectrogram::compute(&audio.samples, audio.sample_rate, FRAME_LENGTH, HOP_LENGTH)
            .map(|spec| mean(&spectral_centroid(&spec)))
            .unwrap_or(0.0);

        let score = self.score(audio.duration, rms, zero_crossing_rate, spectral_centroid);

        QualityReport {
            score,
            rms,
            peak,
            zero_crossing_rate,
            spectral_centroid,
            duration: audio.duration,
            sample_rate: audio.sample_rate,
        }
    }

    /// Multiplicative penalties from 1.0, clamped to [0, 1]
    pub fn score(&self, duration: f64, rms: f32, zcr: f32, centroid: f32) -> f64 {
        let mut score = 1.0f64;

        if duration < self.min_duration {
            score *= 0.5;
        } else if duration > self.max_duration {
            score *= 0.3;
        }
        if rms < QUIET_RMS {
            score *= 0.7;
        }
        if zcr > NOISY_ZCR {
            score *= 0.8;
        }
        if centroid < DULL_CENTROID_HZ {
            score *= 0.9;
        }

        score.clamp(0.0, 1.0)
    }
}

impl Default for QualityAssessor {
    fn default() -> Self {
        Self::from_config(&ProcessingConfig::default())
    }
}

/// Mean over centred frames of the fraction of sign changes per frame
fn zero_crossing_rate(samples: &[f32]) -> f32 {
    if samples.len() < 2 {
        return 0.0;
    }

    let crossings: Vec<bool> = samples
        .windows(2)
        .map(|w| (w[0] >= 0.0) != (w[1] >= 0.0))
        .collect();

    let half = FRAME_LENGTH / 2;
    let n_frames = 1 + samples.len() / HOP_LENGTH;
    let rates: Vec<f32> = (0..n_frames)
        .map(|frame| {
            let centre = frame * HOP_LENGTH;
            let start = centre.saturating_sub(half);
            let end = (centre + half).min(crossings.len());
            if start >= end {
                return 0.0;
            }
            let count = crossings[start..end].iter().filter(|&&c| c).count();
            count as f32 / FRAME_LENGTH as f32
        })
        .collect();

    mean(&rates)
}

fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f32>() / values.len() as f32
    }
}
