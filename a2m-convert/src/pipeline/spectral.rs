//! Spectral primitives: centered STFT and onset strength

use ndarray::Array2;
use rustfft::{num_complex::Complex32, FftPlanner};

use crate::error::{ConversionError, Result};

/// Magnitude spectrogram, shape `(n_fft / 2 + 1, frames)`
#[derive(Debug, Clone)]
pub struct Spectrogram {
    pub magnitudes: Array2<f32>,
    pub sample_rate: u32,
    pub n_fft: usize,
    pub hop_length: usize,
}

impl Spectrogram {
    /// Centered Hann-window STFT
    ///
    /// The signal is reflect-padded by `n_fft / 2` on both sides so frame `t`
    /// is centred on sample `t * hop_length`, giving `1 + len / hop_length`
    /// frames. Fails on non-finite samples or input shorter than one window.
    pub fn compute(samples: &[f32], sample_rate: u32, n_fft: usize, hop_length: usize) -> Result<Self> {
        if n_fft < 2 || hop_length == 0 {
            return Err(ConversionError::FeatureExtraction(format!(
                "Invalid STFT geometry: n_fft {}, hop {}",
                n_fft, hop_length
            )));
        }
        if samples.len() < n_fft {
            return Err(ConversionError::FeatureExtraction(format!(
                "Audio too short for analysis: {} samples, window is {}",
                samples.len(),
                n_fft
            )));
        }
        if let Some(idx) = samples.iter().position(|s| !s.is_finite()) {
            return Err(ConversionError::FeatureExtraction(format!(
                "Non-finite sample at index {}",
                idx
            )));
        }

        let padded = reflect_pad(samples, n_fft / 2);
        let n_frames = 1 + (padded.len() - n_fft) / hop_length;
        let n_bins = n_fft / 2 + 1;

        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(n_fft);
        let window = hann_window(n_fft);

        let mut magnitudes = Array2::<f32>::zeros((n_bins, n_frames));
        let mut frame = vec![Complex32::new(0.0, 0.0); n_fft];

        for frame_idx in 0..n_frames {
            let start = frame_idx * hop_length;
            for (slot, (&sample, &win)) in frame
                .iter_mut()
                .zip(padded[start..start + n_fft].iter().zip(&window))
            {
                *slot = Complex32::new(sample * win, 0.0);
            }

            fft.process(&mut frame);

            for (bin, value) in frame[..n_bins].iter().enumerate() {
                magnitudes[[bin, frame_idx]] = value.norm();
            }
        }

        Ok(Self {
            magnitudes,
            sample_rate,
            n_fft,
            hop_length,
        })
    }

    pub fn n_bins(&self) -> usize {
        self.magnitudes.nrows()
    }

    pub fn n_frames(&self) -> usize {
        self.magnitudes.ncols()
    }

    /// Centre frequency of each bin in Hz
    pub fn bin_frequencies(&self) -> Vec<f32> {
        (0..self.n_bins())
            .map(|k| k as f32 * self.sample_rate as f32 / self.n_fft as f32)
            .collect()
    }

    /// Frame index → time in seconds
    pub fn frame_time(&self, frame: usize) -> f64 {
        frame as f64 * self.hop_length as f64 / self.sample_rate as f64
    }

    /// Time in seconds → nearest frame index (may exceed the last frame)
    pub fn nearest_frame(&self, seconds: f64) -> usize {
        frame_for_time(seconds, self.sample_rate, self.hop_length)
    }

    /// Half-wave rectified log-magnitude spectral flux, one value per frame
    ///
    /// Frame 0 has no predecessor and is 0.
    pub fn onset_strength(&self) -> Vec<f32> {
        let log_mag = self.magnitudes.mapv(|m| (1.0 + 100.0 * m).ln());
        let mut envelope = vec![0.0f32; self.n_frames()];

        for t in 1..self.n_frames() {
            let current = log_mag.column(t);
            let previous = log_mag.column(t - 1);
            let flux: f32 = current
                .iter()
                .zip(previous.iter())
                .map(|(c, p)| (c - p).max(0.0))
                .sum();
            envelope[t] = flux / self.n_bins() as f32;
        }

        envelope
    }
}

/// Nearest analysis frame for a time offset: `round(t * sr / hop)`
pub fn frame_for_time(seconds: f64, sample_rate: u32, hop_length: usize) -> usize {
    (seconds.max(0.0) * sample_rate as f64 / hop_length as f64).round() as usize
}

/// Periodic Hann window
pub fn hann_window(size: usize) -> Vec<f32> {
    (0..size)
        .map(|i| 0.5 - 0.5 * (2.0 * std::f32::consts::PI * i as f32 / size as f32).cos())
        .collect()
}

/// Reflect-pad without repeating the edge sample; falls back to zeros when the
/// signal is too short to reflect.
fn reflect_pad(samples: &[f32], pad: usize) -> Vec<f32> {
    let n = samples.len();
    let mut out = Vec::with_capacity(n + 2 * pad);

    if n <= pad {
        out.extend(std::iter::repeat(0.0).take(pad));
        out.extend_from_slice(samples);
        out.extend(std::iter::repeat(0.0).take(pad));
        return out;
    }

    out.extend((1..=pad).rev().map(|i| samples[i]));
    out.extend_from_slice(samples);
    out.extend((1..=pad).map(|i| samples[n - 1 - i]));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, sample_rate: u32, seconds: f32) -> Vec<f32> {
        (0..(sample_rate as f32 * seconds) as usize)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / sample_rate as f32).sin())
            .collect()
    }

    #[test]
    fn test_frame_count_is_centered() {
        let samples = vec![0.0; 22050];
        let spec = Spectrogram::compute(&samples, 22050, 2048, 512).unwrap();
        assert_eq!(spec.n_bins(), 1025);
        assert_eq!(spec.n_frames(), 1 + 22050 / 512);
    }

    #[test]
    fn test_sine_peak_lands_in_expected_bin() {
        let sr = 22050;
        let spec = Spectrogram::compute(&sine(1000.0, sr, 1.0), sr, 2048, 512).unwrap();
        let column = spec.magnitudes.column(spec.n_frames() / 2);
        let peak_bin = column
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        let freq = spec.bin_frequencies()[peak_bin];
        assert!((freq - 1000.0).abs() < 22050.0 / 2048.0, "peak at {} Hz", freq);
    }

    #[test]
    fn test_rejects_short_and_non_finite_input() {
        assert!(Spectrogram::compute(&[0.0; 100], 22050, 2048, 512).is_err());

        let mut samples = vec![0.0; 4096];
        samples[10] = f32::NAN;
        assert!(Spectrogram::compute(&samples, 22050, 2048, 512).is_err());
    }

    #[test]
    fn test_onset_strength_peaks_at_burst() {
        let sr = 22050;
        let mut samples = vec![0.0f32; sr as usize * 2];
        let burst = sine(880.0, sr, 0.2);
        samples[sr as usize..sr as usize + burst.len()].copy_from_slice(&burst);

        let spec = Spectrogram::compute(&samples, sr, 2048, 512).unwrap();
        let envelope = spec.onset_strength();
        assert_eq!(envelope.len(), spec.n_frames());
        assert_eq!(envelope[0], 0.0);

        let peak = envelope
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        let expected = spec.nearest_frame(1.0);
        assert!(peak.abs_diff(expected) <= 3, "peak frame {} vs {}", peak, expected);
    }

    #[test]
    fn test_reflect_pad_mirrors_edges() {
        assert_eq!(reflect_pad(&[1.0, 2.0, 3.0, 4.0], 2), vec![3.0, 2.0, 1.0, 2.0, 3.0, 4.0, 3.0, 2.0]);
        assert_eq!(reflect_pad(&[1.0], 2), vec![0.0, 0.0, 1.0, 0.0, 0.0]);
    }
}
