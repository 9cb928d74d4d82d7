//! Audio loading
//!
//! Decodes any symphonia-supported file (MP3, WAV, FLAC, OGG, ...) into a
//! mono f32 buffer at the analysis sample rate.
//!
//! **Algorithm:**
//! 1. Probe the container and pick the first decodable audio track
//! 2. Decode every packet, averaging channels to mono
//! 3. Resample with rubato (sinc, BlackmanHarris2) if the native rate differs
//! 4. Validate the duration bounds (`load` only)

use a2m_common::config::ProcessingConfig;
use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};
use std::path::Path;
use symphonia::core::audio::{AudioBuffer as DecodedBuffer, AudioBufferRef, Signal};
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::conv::FromSample;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::sample::Sample;
use tracing::{debug, warn};

use crate::error::{ConversionError, Result};

/// Mono PCM buffer at the analysis sample rate
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    /// Mono samples, nominally in [-1.0, 1.0]
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Seconds
    pub duration: f64,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        let duration = if sample_rate == 0 {
            0.0
        } else {
            samples.len() as f64 / sample_rate as f64
        };
        Self {
            samples,
            sample_rate,
            duration,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Decoder + resampler + duration gate
#[derive(Debug, Clone)]
pub struct AudioLoader {
    target_sample_rate: u32,
    min_duration: f64,
    max_duration: f64,
}

impl AudioLoader {
    pub fn new(target_sample_rate: u32, min_duration: f64, max_duration: f64) -> Self {
        Self {
            target_sample_rate,
            min_duration,
            max_duration,
        }
    }

    pub fn from_config(config: &ProcessingConfig) -> Self {
        Self::new(config.sample_rate, config.min_duration, config.max_duration)
    }

    pub fn target_sample_rate(&self) -> u32 {
        self.target_sample_rate
    }

    /// Decode, resample and enforce `[min_duration, max_duration]`
    pub fn load(&self, path: &Path) -> Result<AudioBuffer> {
        let buffer = self.decode(path)?;

        if buffer.duration < self.min_duration {
            return Err(ConversionError::DurationTooShort {
                actual: buffer.duration,
                min: self.min_duration,
            });
        }
        if buffer.duration > self.max_duration {
            return Err(ConversionError::DurationTooLong {
                actual: buffer.duration,
                max: self.max_duration,
            });
        }

        debug!(
            path = %path.display(),
            samples = buffer.len(),
            duration = format!("{:.2}", buffer.duration),
            "Audio loaded"
        );
        Ok(buffer)
    }

    /// Decode and resample without duration validation
    pub fn decode(&self, path: &Path) -> Result<AudioBuffer> {
        let (samples, native_rate) = decode_mono(path)?;
        if samples.is_empty() {
            return Err(ConversionError::EmptyAudio);
        }

        let samples = if native_rate != self.target_sample_rate {
            debug!(
                "Resampling from {} Hz to {} Hz using rubato",
                native_rate, self.target_sample_rate
            );
            resample_mono(samples, native_rate, self.target_sample_rate)?
        } else {
            samples
        };

        if samples.is_empty() {
            return Err(ConversionError::EmptyAudio);
        }

        Ok(AudioBuffer::new(samples, self.target_sample_rate))
    }
}

impl Default for AudioLoader {
    fn default() -> Self {
        Self::from_config(&ProcessingConfig::default())
    }
}

/// Decode the first audio track to mono; returns samples and native rate
fn decode_mono(path: &Path) -> Result<(Vec<f32>, u32)> {
    let file = std::fs::File::open(path).map_err(|e| {
        ConversionError::AudioLoad(format!("Failed to open {}: {}", path.display(), e))
    })?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(extension) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(extension);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| {
            ConversionError::AudioLoad(format!("Failed to probe {}: {}", path.display(), e))
        })?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| ConversionError::AudioLoad("No audio track found in file".to_string()))?;

    let track_id = track.id;
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| ConversionError::AudioLoad("Sample rate unknown".to_string()))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| ConversionError::AudioLoad(format!("Failed to create decoder: {}", e)))?;

    let mut samples: Vec<f32> = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => {
                return Err(ConversionError::AudioLoad(format!(
                    "Error reading packet: {}",
                    e
                )))
            }
        };

        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => append_mono(&decoded, &mut samples),
            // A single corrupt frame is skipped, as players do
            Err(SymphoniaError::DecodeError(msg)) => {
                warn!(path = %path.display(), "Skipping undecodable packet: {}", msg);
            }
            Err(e) => {
                return Err(ConversionError::AudioLoad(format!(
                    "Failed to decode {}: {}",
                    path.display(),
                    e
                )))
            }
        }
    }

    debug!(
        path = %path.display(),
        sample_rate,
        total_samples = samples.len(),
        "Audio decoding complete"
    );

    Ok((samples, sample_rate))
}

fn append_mono(decoded: &AudioBufferRef, out: &mut Vec<f32>) {
    match decoded {
        AudioBufferRef::F32(buf) => mix_down(buf, out),
        AudioBufferRef::F64(buf) => mix_down(buf, out),
        AudioBufferRef::U8(buf) => mix_down(buf, out),
        AudioBufferRef::U16(buf) => mix_down(buf, out),
        AudioBufferRef::U24(buf) => mix_down(buf, out),
        AudioBufferRef::U32(buf) => mix_down(buf, out),
        AudioBufferRef::S8(buf) => mix_down(buf, out),
        AudioBufferRef::S16(buf) => mix_down(buf, out),
        AudioBufferRef::S24(buf) => mix_down(buf, out),
        AudioBufferRef::S32(buf) => mix_down(buf, out),
    }
}

/// Average all channels of a decoded buffer into mono f32
fn mix_down<S>(buf: &DecodedBuffer<S>, out: &mut Vec<f32>)
where
    S: Sample,
    f32: FromSample<S>,
{
    let num_channels = buf.spec().channels.count();
    if num_channels == 0 {
        return;
    }
    let num_frames = buf.frames();
    out.reserve(num_frames);

    for frame_idx in 0..num_frames {
        let mut sum = 0.0f32;
        for ch in 0..num_channels {
            sum += f32::from_sample(buf.chan(ch)[frame_idx]);
        }
        out.push(sum / num_channels as f32);
    }
}

/// High-quality mono resampling with rubato SincFixedIn (single chunk)
fn resample_mono(samples: Vec<f32>, source_rate: u32, target_rate: u32) -> Result<Vec<f32>> {
    let num_frames = samples.len();

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let ratio = target_rate as f64 / source_rate as f64;

    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, num_frames, 1)
        .map_err(|e| ConversionError::AudioLoad(format!("Failed to create resampler: {}", e)))?;

    let mut output = resampler
        .process(&[samples], None)
        .map_err(|e| ConversionError::AudioLoad(format!("Resampling failed: {}", e)))?;

    let resampled = output.pop().unwrap_or_default();
    debug!(
        "Resampled {} frames ({} Hz) → {} frames ({} Hz)",
        num_frames,
        source_rate,
        resampled.len(),
        target_rate
    );
    Ok(resampled)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_sine_wav(path: &Path, sample_rate: u32, channels: u16, seconds: f32) {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        let total = (sample_rate as f32 * seconds) as usize;
        for i in 0..total {
            let t = i as f32 / sample_rate as f32;
            let value = (0.5 * (2.0 * std::f32::consts::PI * 440.0 * t).sin() * i16::MAX as f32) as i16;
            for _ in 0..channels {
                writer.write_sample(value).unwrap();
            }
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_load_at_target_rate_keeps_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_sine_wav(&path, 22050, 1, 2.0);

        let loader = AudioLoader::new(22050, 1.0, 10.0);
        let buffer = loader.load(&path).unwrap();
        assert_eq!(buffer.sample_rate, 22050);
        assert_eq!(buffer.len(), 44100);
        assert!((buffer.duration - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_stereo_is_averaged_and_resampled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        write_sine_wav(&path, 44100, 2, 2.0);

        let loader = AudioLoader::new(22050, 1.0, 10.0);
        let buffer = loader.load(&path).unwrap();
        assert_eq!(buffer.sample_rate, 22050);
        assert!((buffer.duration - 2.0).abs() < 0.05, "duration {}", buffer.duration);
        let peak = buffer.samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!(peak > 0.3 && peak < 0.7, "peak {}", peak);
    }

    #[test]
    fn test_duration_bounds_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.wav");
        write_sine_wav(&path, 22050, 1, 1.0);

        let strict = AudioLoader::new(22050, 10.0, 600.0);
        assert!(matches!(
            strict.load(&path),
            Err(ConversionError::DurationTooShort { .. })
        ));

        let tiny_max = AudioLoader::new(22050, 0.0, 0.5);
        assert!(matches!(
            tiny_max.load(&path),
            Err(ConversionError::DurationTooLong { .. })
        ));

        // decode skips the gate
        assert!(strict.decode(&path).is_ok());
    }

    #[test]
    fn test_missing_and_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let loader = AudioLoader::default();
        assert!(matches!(
            loader.load(&dir.path().join("nope.mp3")),
            Err(ConversionError::AudioLoad(_))
        ));

        let garbage = dir.path().join("garbage.mp3");
        std::fs::write(&garbage, b"definitely not audio").unwrap();
        assert!(matches!(
            loader.load(&garbage),
            Err(ConversionError::AudioLoad(_))
        ));
    }

    #[test]
    fn test_empty_wav_is_empty_audio() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.wav");
        write_sine_wav(&path, 22050, 1, 0.0);

        let loader = AudioLoader::default();
        assert!(matches!(loader.load(&path), Err(ConversionError::EmptyAudio)));
    }
}
