//! Musical feature extraction
//!
//! Produces a [`FeatureSet`] from a mono buffer: onsets, tempo and beat grid,
//! chroma, MFCC, spectral centroid and an estimated key. Every sub-step is
//! required; the first failure aborts extraction.

use a2m_common::config::ProcessingConfig;
use ndarray::Array2;
use std::sync::Arc;
use tracing::debug;

use super::audio_loader::AudioBuffer;
use super::key::{ChromaRootEstimator, KeyEstimator};
use super::spectral::Spectrogram;
use crate::error::{ConversionError, Result};

/// Lowest frequency folded into chroma (C1)
const CHROMA_MIN_HZ: f32 = 32.70;
const N_MELS: usize = 40;
const N_MFCC: usize = 13;
const MIN_BPM: f64 = 30.0;
const MAX_BPM: f64 = 300.0;
const DEFAULT_BPM: f64 = 120.0;
const PEAK_WINDOW: usize = 3;
const PEAK_DELTA: f32 = 0.07;
const PEAK_WAIT: usize = 1;

/// Analysis results for one buffer
#[derive(Debug, Clone)]
pub struct FeatureSet {
    /// Beats per minute
    pub tempo: f64,
    /// Beat times in seconds
    pub beats: Vec<f64>,
    /// Shape (12, frames), each frame normalized to max 1
    pub chroma: Array2<f32>,
    /// Shape (13, frames)
    pub mfcc: Array2<f32>,
    /// Hz per frame
    pub spectral_centroid: Vec<f32>,
    /// Strictly increasing onset times in seconds
    pub onsets: Vec<f64>,
    /// `"<pitch-class> major|minor"`
    pub key: String,
    pub duration: f64,
    pub sample_rate: u32,
    pub sample_count: usize,
    pub hop_length: usize,
    pub n_frames: usize,
}

/// Feature extraction stage
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    n_fft: usize,
    hop_length: usize,
    key_estimator: Arc<dyn KeyEstimator>,
}

impl FeatureExtractor {
    pub fn new(n_fft: usize, hop_length: usize) -> Self {
        Self {
            n_fft,
            hop_length,
            key_estimator: Arc::new(ChromaRootEstimator),
        }
    }

    pub fn from_config(config: &ProcessingConfig) -> Self {
        Self::new(config.n_fft, config.hop_length)
    }

    pub fn with_key_estimator(mut self, estimator: Arc<dyn KeyEstimator>) -> Self {
        self.key_estimator = estimator;
        self
    }

    pub fn extract(&self, audio: &AudioBuffer) -> Result<FeatureSet> {
        let spec = Spectrogram::compute(&audio.samples, audio.sample_rate, self.n_fft, self.hop_length)?;
        let envelope = spec.onset_strength();

        let onsets: Vec<f64> = pick_peaks(&envelope)
            .into_iter()
            .map(|frame| spec.frame_time(frame))
            .filter(|&t| t < audio.duration)
            .collect();

        let frame_rate = audio.sample_rate as f64 / self.hop_length as f64;
        let (tempo, beat_period_frames) = estimate_tempo(&envelope, frame_rate);
        let beats = beat_grid(&envelope, beat_period_frames)
            .into_iter()
            .map(|frame| spec.frame_time(frame))
            .collect();

        let chroma = chroma(&spec);
        let mfcc = mfcc(&spec);
        let spectral_centroid = spectral_centroid(&spec);

        let mut mean_chroma = [0.0f32; 12];
        if spec.n_frames() > 0 {
            for (pc, row) in chroma.outer_iter().enumerate() {
                mean_chroma[pc] = row.sum() / spec.n_frames() as f32;
            }
        }
        let key = self.key_estimator.estimate(&mean_chroma).to_string();

        if !tempo.is_finite() {
            return Err(ConversionError::FeatureExtraction(
                "Tempo estimate is not finite".to_string(),
            ));
        }

        debug!(
            tempo = format!("{:.1}", tempo),
            onsets = onsets.len(),
            frames = spec.n_frames(),
            key = %key,
            "Features extracted"
        );

        Ok(FeatureSet {
            tempo,
            beats,
            chroma,
            mfcc,
            spectral_centroid,
            onsets,
            key,
            duration: audio.duration,
            sample_rate: audio.sample_rate,
            sample_count: audio.len(),
            hop_length: self.hop_length,
            n_frames: spec.n_frames(),
        })
    }
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::from_config(&ProcessingConfig::default())
    }
}

/// Peak picking over the max-normalized envelope
///
/// A frame is an onset when it is the maximum of the ±3 frame window, at least
/// `delta` above that window's mean, and more than `wait` frames after the
/// previous onset.
pub fn pick_peaks(envelope: &[f32]) -> Vec<usize> {
    let max = envelope.iter().cloned().fold(0.0f32, f32::max);
    if max <= 0.0 {
        return Vec::new();
    }
    let normalized: Vec<f32> = envelope.iter().map(|v| v / max).collect();

    let mut peaks: Vec<usize> = Vec::new();
    for i in 0..normalized.len() {
        let lo = i.saturating_sub(PEAK_WINDOW);
        let hi = (i + PEAK_WINDOW + 1).min(normalized.len());
        let window = &normalized[lo..hi];

        let value = normalized[i];
        let local_max = window.iter().all(|&v| v <= value);
        let local_mean = window.iter().sum::<f32>() / window.len() as f32;

        if local_max
            && value >= local_mean + PEAK_DELTA
            && peaks.last().map_or(true, |&last| i > last + PEAK_WAIT)
        {
            peaks.push(i);
        }
    }
    peaks
}

/// Tempo from onset-envelope autocorrelation under a log-normal prior at 120 BPM
///
/// Returns (BPM, beat period in frames). A silent envelope yields 120 BPM.
fn estimate_tempo(envelope: &[f32], frame_rate: f64) -> (f64, f64) {
    let default_period = 60.0 * frame_rate / DEFAULT_BPM;
    let energy: f32 = envelope.iter().map(|v| v * v).sum();
    if energy <= 0.0 {
        return (DEFAULT_BPM, default_period);
    }

    let min_lag = (60.0 * frame_rate / MAX_BPM).floor().max(1.0) as usize;
    let max_lag = ((60.0 * frame_rate / MIN_BPM).ceil() as usize).min(envelope.len().saturating_sub(1));
    if min_lag > max_lag {
        return (DEFAULT_BPM, default_period);
    }

    let mean = envelope.iter().sum::<f32>() / envelope.len() as f32;
    let centered: Vec<f32> = envelope.iter().map(|v| v - mean).collect();

    let autocorr = |lag: usize| -> f64 {
        centered
            .iter()
            .zip(&centered[lag..])
            .map(|(a, b)| (*a as f64) * (*b as f64))
            .sum()
    };

    let mut best: Option<(usize, f64)> = None;
    for lag in min_lag..=max_lag {
        let bpm = 60.0 * frame_rate / lag as f64;
        let prior = (-0.5 * (bpm / DEFAULT_BPM).log2().powi(2)).exp();
        let score = autocorr(lag) * prior;
        if score > 0.0 && best.map_or(true, |(_, s)| score > s) {
            best = Some((lag, score));
        }
    }

    let Some((lag, _)) = best else {
        return (DEFAULT_BPM, default_period);
    };

    // Parabolic refinement of the lag
    let mut period = lag as f64;
    if lag > min_lag && lag < max_lag {
        let (a, b, c) = (autocorr(lag - 1), autocorr(lag), autocorr(lag + 1));
        let denom = a - 2.0 * b + c;
        if denom.abs() > f64::EPSILON {
            let shift = 0.5 * (a - c) / denom;
            if shift.abs() < 1.0 {
                period += shift;
            }
        }
    }

    (60.0 * frame_rate / period, period)
}

/// Beat frames: the grid phase with the most envelope energy
fn beat_grid(envelope: &[f32], period: f64) -> Vec<usize> {
    if envelope.is_empty() || !(period >= 1.0) {
        return Vec::new();
    }

    let grid = |phase: f64| -> Vec<usize> {
        (0..)
            .map(|k| (phase + k as f64 * period).round() as usize)
            .take_while(|&frame| frame < envelope.len())
            .collect()
    };

    let mut best_phase = 0usize;
    let mut best_energy = f32::MIN;
    for phase in 0..period.ceil() as usize {
        let energy: f32 = grid(phase as f64).iter().map(|&f| envelope[f]).sum();
        if energy > best_energy {
            best_energy = energy;
            best_phase = phase;
        }
    }

    grid(best_phase as f64)
}

/// Power folded onto pitch classes, per-frame max-normalized
fn chroma(spec: &Spectrogram) -> Array2<f32> {
    let bin_classes: Vec<Option<usize>> = spec
        .bin_frequencies()
        .into_iter()
        .map(|f| {
            (f >= CHROMA_MIN_HZ).then(|| {
                let midi = (69.0 + 12.0 * (f / 440.0).log2()).round() as i64;
                midi.rem_euclid(12) as usize
            })
        })
        .collect();

    let mut chroma = Array2::<f32>::zeros((12, spec.n_frames()));
    for (t, column) in spec.magnitudes.columns().into_iter().enumerate() {
        for (bin, &mag) in column.iter().enumerate() {
            if let Some(pc) = bin_classes[bin] {
                chroma[[pc, t]] += mag * mag;
            }
        }
        let max = chroma.column(t).iter().cloned().fold(0.0f32, f32::max);
        if max > 0.0 {
            chroma.column_mut(t).mapv_inplace(|v| v / max);
        }
    }
    chroma
}

fn hz_to_mel(hz: f32) -> f32 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz(mel: f32) -> f32 {
    700.0 * (10f32.powf(mel / 2595.0) - 1.0)
}

/// Triangular mel filterbank, shape (n_mels, bins)
fn mel_filterbank(spec: &Spectrogram, n_mels: usize) -> Array2<f32> {
    let freqs = spec.bin_frequencies();
    let nyquist = spec.sample_rate as f32 / 2.0;
    let max_mel = hz_to_mel(nyquist);
    let edges: Vec<f32> = (0..n_mels + 2)
        .map(|i| mel_to_hz(max_mel * i as f32 / (n_mels + 1) as f32))
        .collect();

    let mut bank = Array2::<f32>::zeros((n_mels, freqs.len()));
    for m in 0..n_mels {
        let (lower, centre, upper) = (edges[m], edges[m + 1], edges[m + 2]);
        for (bin, &f) in freqs.iter().enumerate() {
            let weight = if f > lower && f <= centre {
                (f - lower) / (centre - lower)
            } else if f > centre && f < upper {
                (upper - f) / (upper - centre)
            } else {
                0.0
            };
            bank[[m, bin]] = weight;
        }
    }
    bank
}

/// Mel power → dB → orthonormal DCT-II, first 13 coefficients
fn mfcc(spec: &Spectrogram) -> Array2<f32> {
    let bank = mel_filterbank(spec, N_MELS);
    let power = spec.magnitudes.mapv(|m| m * m);
    let mel_db = bank.dot(&power).mapv(|e| 10.0 * e.max(1e-10).log10());

    let n = N_MELS as f32;
    let mut dct = Array2::<f32>::zeros((N_MFCC, N_MELS));
    for k in 0..N_MFCC {
        let scale = if k == 0 { (1.0 / n).sqrt() } else { (2.0 / n).sqrt() };
        for i in 0..N_MELS {
            dct[[k, i]] =
                scale * (std::f32::consts::PI / n * (i as f32 + 0.5) * k as f32).cos();
        }
    }

    dct.dot(&mel_db)
}

/// Magnitude-weighted mean frequency per frame; 0 for silent frames
pub fn spectral_centroid(spec: &Spectrogram) -> Vec<f32> {
    let freqs = spec.bin_frequencies();
    spec.magnitudes
        .columns()
        .into_iter()
        .map(|column| {
            let total: f32 = column.sum();
            if total <= f32::EPSILON {
                0.0
            } else {
                column.iter().zip(&freqs).map(|(m, f)| m * f).sum::<f32>() / total
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: u32 = 22050;

    fn tone(freq: f32, seconds: f32) -> Vec<f32> {
        (0..(SR as f32 * seconds) as usize)
            .map(|i| 0.5 * (2.0 * std::f32::consts::PI * freq * i as f32 / SR as f32).sin())
            .collect()
    }

    /// Short tone bursts at a fixed interval
    fn click_track(bpm: f64, seconds: f32) -> Vec<f32> {
        let mut samples = vec![0.0f32; (SR as f32 * seconds) as usize];
        let interval = (60.0 / bpm * SR as f64) as usize;
        let burst = tone(1000.0, 0.05);
        let mut start = interval / 2;
        while start + burst.len() < samples.len() {
            samples[start..start + burst.len()].copy_from_slice(&burst);
            start += interval;
        }
        samples
    }

    #[test]
    fn test_silence_has_no_onsets_and_default_tempo() {
        let audio = AudioBuffer::new(vec![0.0; SR as usize * 3], SR);
        let features = FeatureExtractor::default().extract(&audio).unwrap();
        assert!(features.onsets.is_empty());
        assert_eq!(features.tempo, 120.0);
        assert!(features.spectral_centroid.iter().all(|&c| c == 0.0));
        assert_eq!(features.chroma.nrows(), 12);
        assert_eq!(features.mfcc.nrows(), 13);
        assert_eq!(features.n_frames, features.chroma.ncols());
    }

    #[test]
    fn test_click_track_onsets_and_tempo() {
        let audio = AudioBuffer::new(click_track(120.0, 8.0), SR);
        let features = FeatureExtractor::default().extract(&audio).unwrap();

        assert!(features.onsets.windows(2).all(|w| w[0] < w[1]));
        // One click every 0.5s, first at 0.25s
        assert!(features.onsets.len() >= 14 && features.onsets.len() <= 17, "{:?}", features.onsets);
        assert!((features.tempo - 120.0).abs() < 6.0, "tempo {}", features.tempo);
        assert!(!features.beats.is_empty());
    }

    #[test]
    fn test_pure_tone_key_root_and_centroid() {
        // A4 for 3 seconds: root A
        let audio = AudioBuffer::new(tone(440.0, 3.0), SR);
        let features = FeatureExtractor::default().extract(&audio).unwrap();
        assert!(features.key.starts_with("A "), "key {}", features.key);

        let mid = features.spectral_centroid[features.n_frames / 2];
        assert!((mid - 440.0).abs() < 60.0, "centroid {}", mid);
    }

    #[test]
    fn test_geometry_recorded() {
        let audio = AudioBuffer::new(tone(220.0, 2.0), SR);
        let features = FeatureExtractor::default().extract(&audio).unwrap();
        assert_eq!(features.sample_rate, SR);
        assert_eq!(features.sample_count, audio.len());
        assert_eq!(features.hop_length, 512);
        assert!((features.duration - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_short_buffer_fails() {
        let audio = AudioBuffer::new(vec![0.1; 1000], SR);
        assert!(matches!(
            FeatureExtractor::default().extract(&audio),
            Err(ConversionError::FeatureExtraction(_))
        ));
    }

    #[test]
    fn test_pick_peaks_respects_window_and_delta() {
        let mut envelope = vec![0.0f32; 40];
        envelope[5] = 1.0;
        envelope[6] = 0.9;
        envelope[20] = 0.5;
        envelope[30] = 0.04;
        assert_eq!(pick_peaks(&envelope), vec![5, 20]);
        assert!(pick_peaks(&[0.0; 10]).is_empty());
    }

    #[test]
    fn test_plateau_yields_single_peak() {
        let mut envelope = vec![0.0f32; 20];
        envelope[10] = 1.0;
        envelope[11] = 1.0;
        assert_eq!(pick_peaks(&envelope), vec![10]);
    }
}
