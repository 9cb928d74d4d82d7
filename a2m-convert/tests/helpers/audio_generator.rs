//! Audio Test Fixture Generator
//!
//! Writes 16-bit PCM WAV files for decoder and end-to-end tests

use std::f32::consts::PI;
use std::path::Path;

/// One tone of a generated melody
#[derive(Debug, Clone, Copy)]
pub struct ToneNote {
    pub frequency: f32,
    /// Sounding time in seconds
    pub seconds: f32,
    /// Silence after the tone in seconds
    pub gap: f32,
}

/// Continuous sine at 30% amplitude, duplicated on every channel
pub fn write_sine_wav(
    path: &Path,
    frequency: f32,
    sample_rate: u32,
    channels: u16,
    seconds: f32,
) -> anyhow::Result<()> {
    let mut writer = hound::WavWriter::create(path, spec(sample_rate, channels))?;
    let total = (seconds * sample_rate as f32) as usize;

    for i in 0..total {
        let t = i as f32 / sample_rate as f32;
        let sample = to_i16(0.3 * (2.0 * PI * frequency * t).sin());
        for _ in 0..channels {
            writer.write_sample(sample)?;
        }
    }

    writer.finalize()?;
    Ok(())
}

/// Mono melody: each tone has short linear fades and is followed by silence,
/// so every tone start is a clear onset
pub fn write_note_sequence(path: &Path, sample_rate: u32, notes: &[ToneNote]) -> anyhow::Result<()> {
    let mut writer = hound::WavWriter::create(path, spec(sample_rate, 1))?;
    let fade = (0.005 * sample_rate as f32) as usize;

    for note in notes {
        let tone_len = (note.seconds * sample_rate as f32) as usize;
        for i in 0..tone_len {
            let t = i as f32 / sample_rate as f32;
            let envelope = if i < fade {
                i as f32 / fade as f32
            } else if i + fade > tone_len {
                (tone_len - i) as f32 / fade as f32
            } else {
                1.0
            };
            writer.write_sample(to_i16(0.5 * envelope * (2.0 * PI * note.frequency * t).sin()))?;
        }

        let gap_len = (note.gap * sample_rate as f32) as usize;
        for _ in 0..gap_len {
            writer.write_sample(0i16)?;
        }
    }

    writer.finalize()?;
    Ok(())
}

fn spec(sample_rate: u32, channels: u16) -> hound::WavSpec {
    hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    }
}

fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}
