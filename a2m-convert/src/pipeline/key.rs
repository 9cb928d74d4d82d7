//! Musical key estimation from chroma

use std::fmt;
use std::str::FromStr;

use crate::error::ConversionError;

const PITCH_CLASS_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// Sharps (positive) or flats (negative) of the major key on each tonic
const MAJOR_KEY_ACCIDENTALS: [i8; 12] = [0, -5, 2, -3, 4, -1, 6, 1, -4, 3, -2, 5];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Major,
    Minor,
}

/// Tonic pitch class (0 = C) and mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeySignature {
    pub tonic: u8,
    pub mode: Mode,
}

impl KeySignature {
    pub fn new(tonic: u8, mode: Mode) -> Self {
        Self {
            tonic: tonic % 12,
            mode,
        }
    }

    pub fn c_major() -> Self {
        Self::new(0, Mode::Major)
    }

    /// Sharps (> 0) or flats (< 0) for the MIDI key-signature meta event
    ///
    /// Minor keys use the signature of their relative major.
    pub fn accidentals(&self) -> i8 {
        let major_tonic = match self.mode {
            Mode::Major => self.tonic,
            Mode::Minor => (self.tonic + 3) % 12,
        };
        MAJOR_KEY_ACCIDENTALS[major_tonic as usize]
    }

    pub fn is_minor(&self) -> bool {
        self.mode == Mode::Minor
    }
}

impl Default for KeySignature {
    fn default() -> Self {
        Self::c_major()
    }
}

impl fmt::Display for KeySignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.mode {
            Mode::Major => "major",
            Mode::Minor => "minor",
        };
        write!(f, "{} {}", PITCH_CLASS_NAMES[self.tonic as usize], mode)
    }
}

impl FromStr for KeySignature {
    type Err = ConversionError;

    /// Parses `"<pitch-class> major|minor"`; the pitch class is a letter A-G
    /// followed by any number of `#` or `b`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConversionError::MidiGeneration(format!("Unrecognized key: {:?}", s));

        let mut parts = s.split_whitespace();
        let (Some(name), Some(mode), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(invalid());
        };

        let mut chars = name.chars();
        let base: i32 = match chars.next().map(|c| c.to_ascii_uppercase()) {
            Some('C') => 0,
            Some('D') => 2,
            Some('E') => 4,
            Some('F') => 5,
            Some('G') => 7,
            Some('A') => 9,
            Some('B') => 11,
            _ => return Err(invalid()),
        };
        let mut offset = 0i32;
        for c in chars {
            match c {
                '#' | '♯' => offset += 1,
                'b' | '♭' => offset -= 1,
                _ => return Err(invalid()),
            }
        }

        let mode = match mode.to_ascii_lowercase().as_str() {
            "major" | "maj" => Mode::Major,
            "minor" | "min" => Mode::Minor,
            _ => return Err(invalid()),
        };

        Ok(Self::new((base + offset).rem_euclid(12) as u8, mode))
    }
}

/// Key estimation strategy
pub trait KeyEstimator: Send + Sync + fmt::Debug {
    /// Estimate the key from the per-pitch-class mean chroma (index 0 = C)
    fn estimate(&self, mean_chroma: &[f32; 12]) -> KeySignature;
}

/// Strongest pitch class as root; third decides the mode
///
/// major strength = chroma[root+4] + chroma[root+7],
/// minor strength = chroma[root+3] + chroma[root+7];
/// ties go to major, ties on the root go to the lowest pitch class.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChromaRootEstimator;

impl KeyEstimator for ChromaRootEstimator {
    fn estimate(&self, mean_chroma: &[f32; 12]) -> KeySignature {
        let mut root = 0usize;
        for (pc, &value) in mean_chroma.iter().enumerate().skip(1) {
            if value > mean_chroma[root] {
                root = pc;
            }
        }

        let at = |interval: usize| mean_chroma[(root + interval) % 12];
        let major = at(4) + at(7);
        let minor = at(3) + at(7);
        let mode = if major >= minor { Mode::Major } else { Mode::Minor };

        KeySignature::new(root as u8, mode)
    }
}
