//! Genre classification from upload metadata.
//!
//! No signal analysis happens here. The filename is matched against fixed
//! keyword sets and the matched genre's pre-authored ten-band table is
//! returned together with a confidence score.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::bands::{Band, BandCollection, FilterKind};
use crate::error::{Error, Result};

const MIB: u64 = 1024 * 1024;

/// Uploads above this size are rejected
pub const MAX_UPLOAD_BYTES: u64 = 50 * MIB;
/// Uploads above this size get a confidence boost
const HIGH_QUALITY_BYTES: u64 = 10 * MIB;

const ACCEPTED_MEDIA_TYPES: [&str; 4] = ["audio/mpeg", "audio/wav", "audio/mp3", "audio/wave"];

const MIN_LATENCY_MS: f64 = 1000.0;
const MAX_LATENCY_MS: f64 = 3000.0;
const LATENCY_MS_PER_MIB: f64 = 500.0;

/// What the classifier knows about an uploaded file
#[derive(Debug, Clone)]
pub struct AudioDescriptor {
    pub name: String,
    pub size: u64,
    pub media_type: String,
}

/// Classifier output. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenreSuggestion {
    pub genre: String,
    pub confidence: f64,
    pub bands: BandCollection,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Genre {
    RockMetal,
    JazzAcoustic,
    ElectronicEdm,
    Classical,
    HipHopRap,
    PopVocal,
}

impl Genre {
    /// Matching order; the first genre with a keyword hit wins.
    const PRIORITY: [Self; 5] = [
        Self::RockMetal,
        Self::JazzAcoustic,
        Self::ElectronicEdm,
        Self::Classical,
        Self::HipHopRap,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::RockMetal => "Rock/Metal",
            Self::JazzAcoustic => "Jazz/Acoustic",
            Self::ElectronicEdm => "Electronic/EDM",
            Self::Classical => "Classical",
            Self::HipHopRap => "Hip-Hop/Rap",
            Self::PopVocal => "Pop/Vocal",
        }
    }

    fn keywords(self) -> &'static [&'static str] {
        match self {
            Self::RockMetal => &["rock", "metal", "guitar"],
            Self::JazzAcoustic => &["jazz", "acoustic", "piano"],
            Self::ElectronicEdm => &["electronic", "edm", "techno", "house"],
            Self::Classical => &["classical", "orchestra", "symphony"],
            Self::HipHopRap => &["hip", "rap", "trap"],
            Self::PopVocal => &[],
        }
    }

    fn base_confidence(self) -> f64 {
        match self {
            Self::RockMetal => 0.9,
            Self::JazzAcoustic => 0.85,
            Self::ElectronicEdm => 0.88,
            Self::Classical => 0.82,
            Self::HipHopRap => 0.8,
            Self::PopVocal => 0.6,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::RockMetal => "Enhanced midrange clarity and controlled low-end for rock music",
            Self::JazzAcoustic => "Natural warmth with enhanced presence for acoustic instruments",
            Self::ElectronicEdm => "Punchy bass and crisp highs for electronic music",
            Self::Classical => "Balanced response preserving natural orchestral dynamics",
            Self::HipHopRap => "Enhanced bass presence with clear vocal articulation",
            Self::PopVocal => "General audio enhancement with vocal clarity",
        }
    }

    /// Gain and Q per standard band, 32 Hz first.
    fn table(self) -> [(f64, f64); 10] {
        match self {
            Self::RockMetal => [
                (2.0, 0.7),  // 32 Hz  -> low-end weight
                (1.0, 1.0),  // 64 Hz
                (-1.0, 1.2), // 125 Hz -> reduce mud in guitars
                (0.0, 1.0),  // 250 Hz
                (1.0, 0.8),  // 500 Hz
                (2.0, 1.0),  // 1 kHz  -> guitar/vocal body
                (3.0, 1.2),  // 2 kHz  -> attack and clarity
                (1.0, 1.0),  // 4 kHz
                (2.0, 0.8),  // 8 kHz  -> brightness
                (1.0, 0.7),  // 16 kHz
            ],
            Self::HipHopRap => [
                (4.0, 0.8),  // 32 Hz  -> 808 sub weight
                (3.0, 1.0),  // 64 Hz
                (2.0, 1.0),  // 125 Hz
                (0.0, 1.0),  // 250 Hz
                (-1.0, 1.2), // 500 Hz -> clean low mids
                (2.0, 1.0),  // 1 kHz
                (3.0, 1.0),  // 2 kHz  -> vocal articulation
                (-1.0, 1.5), // 4 kHz  -> tame sibilance
                (1.0, 1.0),  // 8 kHz
                (0.0, 0.7),  // 16 kHz
            ],
            Self::JazzAcoustic => [
                (0.0, 1.0),
                (1.0, 1.0),
                (1.0, 1.0),
                (2.0, 1.0), // 250 Hz -> instrument body
                (1.0, 1.0),
                (0.0, 1.0),
                (1.0, 1.0),
                (-1.0, 1.0), // 4 kHz -> soften harshness
                (0.0, 1.0),
                (1.0, 1.0),
            ],
            Self::ElectronicEdm => [
                (4.0, 1.0), // 32 Hz  -> sub-bass power
                (3.0, 1.0),
                (1.0, 1.0),
                (-1.0, 1.0),
                (-2.0, 1.0), // 500 Hz -> space for synths
                (0.0, 1.0),
                (1.0, 1.0),
                (2.0, 1.0),
                (3.0, 1.0), // 8 kHz  -> sparkle
                (2.0, 1.0),
            ],
            Self::Classical => [
                (0.0, 1.0),
                (0.0, 1.0),
                (1.0, 1.0),
                (1.0, 1.0),
                (0.0, 1.0),
                (0.0, 1.0),
                (1.0, 1.0),
                (0.0, 1.0),
                (1.0, 1.0),
                (0.0, 1.0),
            ],
            Self::PopVocal => [
                (1.0, 1.0),
                (0.0, 1.0),
                (0.0, 1.0),
                (1.0, 1.0),
                (2.0, 1.0),
                (3.0, 1.0), // 1 kHz -> intelligibility
                (2.0, 1.0),
                (-1.0, 1.0),
                (1.0, 1.0),
                (0.0, 1.0),
            ],
        }
    }

    /// The genre's ten-band EQ table
    pub fn bands(self) -> BandCollection {
        BandCollection::default()
            .iter()
            .zip(self.table())
            .map(|(band, (gain, q))| Band::new(band.frequency, gain, q, band.kind))
            .collect()
    }

    fn detect(file_name: &str) -> Self {
        let name = file_name.to_lowercase();
        Self::PRIORITY
            .into_iter()
            .find(|genre| genre.keywords().iter().any(|kw| name.contains(kw)))
            .unwrap_or(Self::PopVocal)
    }
}

/// True when either the media type or the extension says MP3/WAV.
pub fn is_supported_audio(name: &str, media_type: &str) -> bool {
    let name = name.to_lowercase();
    ACCEPTED_MEDIA_TYPES.iter().any(|t| media_type.contains(t))
        || name.ends_with(".mp3")
        || name.ends_with(".wav")
}

/// Reject anything that is not MP3/WAV or exceeds `max_bytes`.
pub fn validate(file: &AudioDescriptor, max_bytes: u64) -> Result<()> {
    if !is_supported_audio(&file.name, &file.media_type) {
        return Err(Error::Validation(
            "Invalid file type. Please upload MP3 or WAV files.".into(),
        ));
    }
    if file.size > max_bytes {
        return Err(too_large(max_bytes));
    }
    Ok(())
}

/// The size rejection, also used when the upload overruns the body limit.
pub fn too_large(max_bytes: u64) -> Error {
    Error::Validation(format!(
        "File too large. Maximum size is {}MB.",
        max_bytes / MIB
    ))
}

/// Simulated analysis time: 500 ms per MiB, kept within 1..3 s.
pub fn processing_latency(size: u64) -> Duration {
    let mib = size as f64 / MIB as f64;
    let ms = (mib * LATENCY_MS_PER_MIB).clamp(MIN_LATENCY_MS, MAX_LATENCY_MS);
    Duration::from_millis(ms.round() as u64)
}

/// Map an already validated file onto a genre suggestion.
pub fn classify(file: &AudioDescriptor) -> GenreSuggestion {
    let genre = Genre::detect(&file.name);
    let mut confidence = genre.base_confidence();
    if file.size > HIGH_QUALITY_BYTES {
        confidence = (confidence + 0.1).min(0.95);
    }
    debug!(name = %file.name, size = file.size, genre = genre.label(), "matched genre");

    GenreSuggestion {
        genre: genre.label().to_string(),
        confidence,
        bands: genre.bands(),
        description: genre.description().to_string(),
    }
}

/// Full classification request: validate, wait out the simulated
/// analysis time, classify.
pub async fn process(
    file: &AudioDescriptor,
    max_bytes: u64,
    simulate_latency: bool,
) -> Result<GenreSuggestion> {
    validate(file, max_bytes)?;
    if simulate_latency {
        tokio::time::sleep(processing_latency(file.size)).await;
    }
    let suggestion = classify(file);
    info!(
        genre = %suggestion.genre,
        confidence = suggestion.confidence,
        "classified upload"
    );
    Ok(suggestion)
}
