//! Onset-aligned pitch/note detection

use a2m_common::config::ProcessingConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use super::audio_loader::AudioBuffer;
use super::features::FeatureSet;
use super::spectral::{frame_for_time, Spectrogram};
use crate::error::{ConversionError, Result};

/// C2
pub const DEFAULT_FMIN_HZ: f32 = 65.41;
/// C7
pub const DEFAULT_FMAX_HZ: f32 = 2093.0;
pub const DEFAULT_MAGNITUDE_THRESHOLD: f32 = 0.1;
pub const DEFAULT_VELOCITY: u8 = 80;

const MIDI_PITCH_MIN: u8 = 21;
const MIDI_PITCH_MAX: u8 = 108;

/// A detected note
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteEvent {
    /// MIDI note number, 21..=108
    pub pitch: u8,
    /// Estimated fundamental in Hz
    pub frequency: f32,
    /// Seconds from the start of the buffer
    pub start: f64,
    /// Seconds, always > 0
    pub duration: f64,
    pub velocity: u8,
    /// 0..=1
    pub confidence: f32,
}

/// One spectral peak in one analysis frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PitchCandidate {
    pub frequency: f32,
    /// Normalized to the global spectrogram maximum, 0..=1
    pub magnitude: f32,
}

/// Frame-wise pitch candidate strategy
pub trait PitchTracker: Send + Sync + fmt::Debug {
    /// Candidates for every analysis frame, indexed by frame
    fn candidates(&self, audio: &AudioBuffer, hop_length: usize) -> Result<Vec<Vec<PitchCandidate>>>;
}

/// Note velocity strategy
pub trait VelocityModel: Send + Sync + fmt::Debug {
    fn velocity(&self, confidence: f32) -> u8;
}

/// Every note gets the same velocity
#[derive(Debug, Clone, Copy)]
pub struct FixedVelocity(pub u8);

impl Default for FixedVelocity {
    fn default() -> Self {
        Self(DEFAULT_VELOCITY)
    }
}

impl VelocityModel for FixedVelocity {
    fn velocity(&self, _confidence: f32) -> u8 {
        self.0.min(127)
    }
}

/// Local maxima of the magnitude spectrum within `[fmin, fmax]`
///
/// Frequencies are refined by parabolic interpolation; peaks weaker than
/// `frame_threshold` × the frame maximum are dropped.
#[derive(Debug, Clone)]
pub struct SpectralPeakTracker {
    pub n_fft: usize,
    pub fmin: f32,
    pub fmax: f32,
    pub frame_threshold: f32,
}

impl SpectralPeakTracker {
    pub fn new(n_fft: usize) -> Self {
        Self {
            n_fft,
            fmin: DEFAULT_FMIN_HZ,
            fmax: DEFAULT_FMAX_HZ,
            frame_threshold: 0.1,
        }
    }
}

impl PitchTracker for SpectralPeakTracker {
    fn candidates(&self, audio: &AudioBuffer, hop_length: usize) -> Result<Vec<Vec<PitchCandidate>>> {
        let spec = Spectrogram::compute(&audio.samples, audio.sample_rate, self.n_fft, hop_length)
            .map_err(|e| ConversionError::PitchDetection(e.to_string()))?;

        let global_max = spec.magnitudes.iter().cloned().fold(0.0f32, f32::max);
        if global_max <= 0.0 {
            return Ok(vec![Vec::new(); spec.n_frames()]);
        }

        let bin_hz = audio.sample_rate as f32 / self.n_fft as f32;
        let lo = ((self.fmin / bin_hz).floor() as usize).max(1);
        let hi = ((self.fmax / bin_hz).ceil() as usize).min(spec.n_bins().saturating_sub(2));

        let frames = spec
            .magnitudes
            .columns()
            .into_iter()
            .map(|column| {
                let frame_max = column.iter().cloned().fold(0.0f32, f32::max);
                let floor = frame_max * self.frame_threshold;
                let mut found = Vec::new();
                if frame_max <= 0.0 {
                    return found;
                }

                for k in lo..=hi {
                    let (alpha, beta, gamma) = (column[k - 1], column[k], column[k + 1]);
                    if !(beta > alpha && beta >= gamma && beta >= floor) {
                        continue;
                    }
                    let denom = alpha - 2.0 * beta + gamma;
                    let shift = if denom.abs() > f32::EPSILON {
                        (0.5 * (alpha - gamma) / denom).clamp(-0.5, 0.5)
                    } else {
                        0.0
                    };
                    let frequency = (k as f32 + shift) * bin_hz;
                    if frequency < self.fmin || frequency > self.fmax {
                        continue;
                    }
                    let peak = beta - 0.25 * (alpha - gamma) * shift;
                    found.push(PitchCandidate {
                        frequency,
                        magnitude: (peak / global_max).clamp(0.0, 1.0),
                    });
                }
                found
            })
            .collect();

        Ok(frames)
    }
}

/// Note detection stage
#[derive(Debug, Clone)]
pub struct NoteDetector {
    tracker: Arc<dyn PitchTracker>,
    velocity: Arc<dyn VelocityModel>,
    magnitude_threshold: f32,
}

impl NoteDetector {
    pub fn new(tracker: Arc<dyn PitchTracker>, velocity: Arc<dyn VelocityModel>) -> Self {
        Self {
            tracker,
            velocity,
            magnitude_threshold: DEFAULT_MAGNITUDE_THRESHOLD,
        }
    }

    pub fn from_config(config: &ProcessingConfig) -> Self {
        Self::new(
            Arc::new(SpectralPeakTracker::new(config.n_fft)),
            Arc::new(FixedVelocity::default()),
        )
    }

    pub fn with_magnitude_threshold(mut self, threshold: f32) -> Self {
        self.magnitude_threshold = threshold;
        self
    }

    pub fn detect(&self, audio: &AudioBuffer, features: &FeatureSet) -> Result<Vec<NoteEvent>> {
        if features.sample_rate != audio.sample_rate {
            return Err(ConversionError::PitchDetection(format!(
                "Feature sample rate {} does not match audio {}",
                features.sample_rate, audio.sample_rate
            )));
        }
        if features.sample_count != audio.len() {
            return Err(ConversionError::PitchDetection(format!(
                "Features computed from {} samples, audio has {}",
                features.sample_count,
                audio.len()
            )));
        }

        if features.onsets.is_empty() {
            return Ok(Vec::new());
        }

        let candidates = self.tracker.candidates(audio, features.hop_length)?;
        let notes = assemble_notes(
            &candidates,
            &features.onsets,
            features.duration,
            features.sample_rate,
            features.hop_length,
            self.magnitude_threshold,
            self.velocity.as_ref(),
        );

        debug!(
            onsets = features.onsets.len(),
            notes = notes.len(),
            "Notes detected"
        );
        Ok(notes)
    }
}

impl Default for NoteDetector {
    fn default() -> Self {
        Self::from_config(&ProcessingConfig::default())
    }
}

/// Turn per-frame candidates into one note per usable onset
///
/// An onset maps to frame `round(t * sr / hop)`; onsets past the last frame,
/// or whose frame has no candidate at or above `magnitude_threshold`, are
/// skipped. Note i lasts until onset i+1; the last note lasts until
/// `duration`. Non-positive durations are skipped.
pub fn assemble_notes(
    candidates: &[Vec<PitchCandidate>],
    onsets: &[f64],
    duration: f64,
    sample_rate: u32,
    hop_length: usize,
    magnitude_threshold: f32,
    velocity: &dyn VelocityModel,
) -> Vec<NoteEvent> {
    let mut notes = Vec::with_capacity(onsets.len());

    for (i, &start) in onsets.iter().enumerate() {
        let frame = frame_for_time(start, sample_rate, hop_length);
        let Some(frame_candidates) = candidates.get(frame) else {
            continue;
        };

        let mut strong: Vec<&PitchCandidate> = frame_candidates
            .iter()
            .filter(|c| c.magnitude >= magnitude_threshold)
            .collect();
        if strong.is_empty() {
            continue;
        }

        let end = onsets.get(i + 1).copied().unwrap_or(duration);
        let note_duration = end - start;
        if !(note_duration > 0.0) {
            continue;
        }

        strong.sort_by(|a, b| a.frequency.total_cmp(&b.frequency));
        let mid = strong.len() / 2;
        let frequency = if strong.len() % 2 == 0 {
            (strong[mid - 1].frequency + strong[mid].frequency) / 2.0
        } else {
            strong[mid].frequency
        };

        let confidence = frame_candidates
            .iter()
            .map(|c| c.magnitude)
            .fold(0.0f32, f32::max)
            .clamp(0.0, 1.0);

        notes.push(NoteEvent {
            pitch: frequency_to_midi(frequency),
            frequency,
            start,
            duration: note_duration,
            velocity: velocity.velocity(confidence).min(127),
            confidence,
        });
    }

    notes
}

/// Nearest MIDI note, clamped to the piano range
pub fn frequency_to_midi(frequency: f32) -> u8 {
    if !(frequency > 0.0) {
        return MIDI_PITCH_MIN;
    }
    let midi = (69.0 + 12.0 * (frequency / 440.0).log2()).round();
    midi.clamp(MIDI_PITCH_MIN as f32, MIDI_PITCH_MAX as f32) as u8
}
