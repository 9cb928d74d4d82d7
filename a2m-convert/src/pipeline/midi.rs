//! Standard MIDI File rendering

use midly::num::{u15, u24, u28, u4, u7};
use midly::{Format, Header, MetaMessage, MidiMessage, Smf, Timing, TrackEvent, TrackEventKind};
use tracing::{debug, warn};

use super::features::FeatureSet;
use super::key::KeySignature;
use super::notes::NoteEvent;
use crate::error::{ConversionError, Result};

pub const TICKS_PER_QUARTER: u16 = 480;
pub const TRACK_NAME: &str = "Audio2Midi Conversion";
const DEFAULT_TEMPO_BPM: f64 = 120.0;
const CHANNEL: u8 = 0;
/// Largest absolute tick representable as a u28 delta
const MAX_TICK: u32 = 0x0FFF_FFFF;

/// Format-0 single-track MIDI serializer
#[derive(Debug, Clone)]
pub struct MidiSerializer {
    ticks_per_quarter: u16,
    track_name: String,
}

impl Default for MidiSerializer {
    fn default() -> Self {
        Self {
            ticks_per_quarter: TICKS_PER_QUARTER,
            track_name: TRACK_NAME.to_string(),
        }
    }
}

impl MidiSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ticks_per_quarter(&self) -> u16 {
        self.ticks_per_quarter
    }

    /// Render notes with the FeatureSet's tempo and key into SMF bytes
    ///
    /// The file is built in memory and only returned once fully written.
    pub fn render(&self, notes: &[NoteEvent], features: &FeatureSet) -> Result<Vec<u8>> {
        let tempo = effective_tempo(features.tempo);
        let key = features.key.parse::<KeySignature>().unwrap_or_else(|_| {
            warn!(key = %features.key, "Unparseable key, writing C major");
            KeySignature::c_major()
        });

        let micros_per_quarter = (60_000_000.0 / tempo).round() as u32;
        if micros_per_quarter == 0 || micros_per_quarter > 0x00FF_FFFF {
            return Err(ConversionError::MidiGeneration(format!(
                "Tempo {} BPM out of MIDI range",
                tempo
            )));
        }

        let mut track: Vec<TrackEvent<'_>> = vec![
            meta(MetaMessage::TrackName(self.track_name.as_bytes())),
            meta(MetaMessage::Tempo(u24::new(micros_per_quarter))),
            meta(MetaMessage::KeySignature(key.accidentals(), key.is_minor())),
            meta(MetaMessage::TimeSignature(4, 2, 24, 8)),
        ];

        // (tick, is_note_on, order, key, velocity); note-offs sort first at equal ticks
        let mut events: Vec<(u32, bool, usize, u8, u8)> = Vec::with_capacity(notes.len() * 2);
        for (order, note) in notes.iter().enumerate() {
            if note.pitch > 127 {
                return Err(ConversionError::MidiGeneration(format!(
                    "Pitch {} outside MIDI range",
                    note.pitch
                )));
            }
            let start = self.seconds_to_ticks(note.start, tempo)?;
            // A sounding note spans at least one tick so its off never precedes its on
            let end = self
                .seconds_to_ticks(note.start + note.duration, tempo)?
                .max(start + 1)
                .min(MAX_TICK);
            events.push((start, true, order, note.pitch, note.velocity.min(127)));
            events.push((end, false, order, note.pitch, 0));
        }
        events.sort_by_key(|&(tick, is_on, order, _, _)| (tick, is_on, order));

        let mut last_tick = 0u32;
        for (tick, is_on, _, key, velocity) in events {
            let message = if is_on {
                MidiMessage::NoteOn {
                    key: u7::new(key),
                    vel: u7::new(velocity),
                }
            } else {
                MidiMessage::NoteOff {
                    key: u7::new(key),
                    vel: u7::new(0),
                }
            };
            track.push(TrackEvent {
                delta: u28::new(tick - last_tick),
                kind: TrackEventKind::Midi {
                    channel: u4::new(CHANNEL),
                    message,
                },
            });
            last_tick = tick;
        }

        track.push(meta(MetaMessage::EndOfTrack));

        let smf = Smf {
            header: Header::new(
                Format::SingleTrack,
                Timing::Metrical(u15::new(self.ticks_per_quarter)),
            ),
            tracks: vec![track],
        };

        let mut bytes = Vec::new();
        smf.write(&mut bytes)
            .map_err(|e| ConversionError::MidiGeneration(format!("Failed to write MIDI data: {}", e)))?;

        debug!(notes = notes.len(), bytes = bytes.len(), tempo, key = %key, "MIDI rendered");
        Ok(bytes)
    }

    /// `round(seconds / (60 / tempo) * ppq)`
    fn seconds_to_ticks(&self, seconds: f64, tempo: f64) -> Result<u32> {
        let ticks = (seconds / (60.0 / tempo) * self.ticks_per_quarter as f64).round();
        if !ticks.is_finite() || ticks < 0.0 || ticks > MAX_TICK as f64 {
            return Err(ConversionError::MidiGeneration(format!(
                "Time {}s cannot be expressed in ticks",
                seconds
            )));
        }
        Ok(ticks as u32)
    }
}

/// Non-finite or non-positive tempo falls back to 120 BPM
pub fn effective_tempo(tempo: f64) -> f64 {
    if tempo.is_finite() && tempo > 0.0 {
        tempo
    } else {
        DEFAULT_TEMPO_BPM
    }
}

fn meta(message: MetaMessage<'_>) -> TrackEvent<'_> {
    TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Meta(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn features(tempo: f64, key: &str) -> FeatureSet {
        FeatureSet {
            tempo,
            beats: Vec::new(),
            chroma: Array2::zeros((12, 1)),
            mfcc: Array2::zeros((13, 1)),
            spectral_centroid: vec![0.0],
            onsets: Vec::new(),
            key: key.to_string(),
            duration: 10.0,
            sample_rate: 22050,
            sample_count: 220500,
            hop_length: 512,
            n_frames: 431,
        }
    }

    fn note(pitch: u8, start: f64, duration: f64) -> NoteEvent {
        NoteEvent {
            pitch,
            frequency: 440.0,
            start,
            duration,
            velocity: 80,
            confidence: 1.0,
        }
    }

    fn metas<'a>(smf: &Smf<'a>) -> Vec<MetaMessage<'a>> {
        smf.tracks[0]
            .iter()
            .filter_map(|e| match e.kind {
                TrackEventKind::Meta(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_empty_notes_gives_meta_only_track() {
        let bytes = MidiSerializer::new().render(&[], &features(120.0, "C major")).unwrap();
        let smf = Smf::parse(&bytes).unwrap();

        assert_eq!(smf.header.format, Format::SingleTrack);
        assert_eq!(smf.header.timing, Timing::Metrical(u15::new(480)));
        assert_eq!(smf.tracks.len(), 1);
        assert!(smf.tracks[0]
            .iter()
            .all(|e| matches!(e.kind, TrackEventKind::Meta(_))));
        assert_eq!(
            metas(&smf),
            vec![
                MetaMessage::TrackName(TRACK_NAME.as_bytes()),
                MetaMessage::Tempo(u24::new(500_000)),
                MetaMessage::KeySignature(0, false),
                MetaMessage::TimeSignature(4, 2, 24, 8),
                MetaMessage::EndOfTrack,
            ]
        );
    }

    #[test]
    fn test_invalid_tempo_and_key_fall_back() {
        let bytes = MidiSerializer::new()
            .render(&[], &features(f64::NAN, "not a key"))
            .unwrap();
        let smf = Smf::parse(&bytes).unwrap();
        let metas = metas(&smf);
        assert!(metas.contains(&MetaMessage::Tempo(u24::new(500_000))));
        assert!(metas.contains(&MetaMessage::KeySignature(0, false)));
    }

    #[test]
    fn test_key_signature_for_minor_key() {
        let bytes = MidiSerializer::new().render(&[], &features(90.0, "E minor")).unwrap();
        let smf = Smf::parse(&bytes).unwrap();
        let metas = metas(&smf);
        assert!(metas.contains(&MetaMessage::KeySignature(1, true)));
        assert!(metas.contains(&MetaMessage::Tempo(u24::new(666_667))));
    }

    #[test]
    fn test_note_off_precedes_note_on_at_same_tick() {
        // Back-to-back notes at 120 BPM: first ends at tick 480, second starts there
        let notes = [note(60, 0.0, 0.5), note(62, 0.5, 0.5)];
        let bytes = MidiSerializer::new().render(&notes, &features(120.0, "C major")).unwrap();
        let smf = Smf::parse(&bytes).unwrap();

        let mut tick = 0u32;
        let mut timeline = Vec::new();
        for event in &smf.tracks[0] {
            tick += event.delta.as_int();
            if let TrackEventKind::Midi { message, .. } = event.kind {
                match message {
                    MidiMessage::NoteOn { key, .. } => timeline.push((tick, "on", key.as_int())),
                    MidiMessage::NoteOff { key, .. } => timeline.push((tick, "off", key.as_int())),
                    _ => {}
                }
            }
        }
        assert_eq!(
            timeline,
            vec![(0, "on", 60), (480, "off", 60), (480, "on", 62), (960, "off", 62)]
        );
    }

    #[test]
    fn test_sub_tick_note_still_ends_after_it_starts() {
        // 0.4 ms at 120 BPM is under half a tick
        let notes = [note(60, 1.0, 0.0004), note(64, 2.0, 0.5)];
        let bytes = MidiSerializer::new().render(&notes, &features(120.0, "C major")).unwrap();
        let smf = Smf::parse(&bytes).unwrap();

        let mut tick = 0u32;
        let mut timeline = Vec::new();
        for event in &smf.tracks[0] {
            tick += event.delta.as_int();
            if let TrackEventKind::Midi { message, .. } = event.kind {
                match message {
                    MidiMessage::NoteOn { key, .. } => timeline.push((tick, "on", key.as_int())),
                    MidiMessage::NoteOff { key, .. } => timeline.push((tick, "off", key.as_int())),
                    _ => {}
                }
            }
        }
        assert_eq!(
            timeline,
            vec![(960, "on", 60), (961, "off", 60), (1920, "on", 64), (2400, "off", 64)]
        );
    }

    #[test]
    fn test_tick_conversion() {
        let serializer = MidiSerializer::new();
        assert_eq!(serializer.seconds_to_ticks(1.0, 120.0).unwrap(), 960);
        assert_eq!(serializer.seconds_to_ticks(1.0, 60.0).unwrap(), 480);
        assert!(serializer.seconds_to_ticks(-1.0, 120.0).is_err());
    }
}
