//! Realtime voice catalogue and the protocol constants the relay forces on
//! every session configuration.

use serde::{Deserialize, Serialize};

/// Transcription model forced on the input audio stream.
pub const INPUT_TRANSCRIPTION_MODEL: &str = "whisper-1";

/// Transcription language forced on the input audio stream.
pub const INPUT_TRANSCRIPTION_LANGUAGE: &str = "en";

/// Output audio format forced on every session.
pub const OUTPUT_AUDIO_FORMAT: &str = "pcm16";

/// Response modalities forced on every session.
pub const MODALITIES: [&str; 2] = ["text", "audio"];

/// Server VAD activation threshold.
pub const VAD_THRESHOLD: f64 = 0.5;

/// Audio kept before detected speech (ms).
pub const VAD_PREFIX_PADDING_MS: u32 = 300;

/// Silence that ends a user turn (ms).
pub const VAD_SILENCE_DURATION_MS: u32 = 800;

/// Available voices for the realtime endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RealtimeVoice {
    Alloy,
    Ash,
    Ballad,
    Cedar,
    Coral,
    Echo,
    Marin,
    Sage,
    Shimmer,
    Verse,
}

impl RealtimeVoice {
    /// Convert to the API parameter value.
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alloy => "alloy",
            Self::Ash => "ash",
            Self::Ballad => "ballad",
            Self::Cedar => "cedar",
            Self::Coral => "coral",
            Self::Echo => "echo",
            Self::Marin => "marin",
            Self::Sage => "sage",
            Self::Shimmer => "shimmer",
            Self::Verse => "verse",
        }
    }

    /// Parse a voice name, case-insensitively. Unknown names yield `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "alloy" => Some(Self::Alloy),
            "ash" => Some(Self::Ash),
            "ballad" => Some(Self::Ballad),
            "cedar" => Some(Self::Cedar),
            "coral" => Some(Self::Coral),
            "echo" => Some(Self::Echo),
            "marin" => Some(Self::Marin),
            "sage" => Some(Self::Sage),
            "shimmer" => Some(Self::Shimmer),
            "verse" => Some(Self::Verse),
            _ => None,
        }
    }

    /// Get all available voices.
    pub fn all() -> &'static [RealtimeVoice] {
        &[
            Self::Alloy,
            Self::Ash,
            Self::Ballad,
            Self::Cedar,
            Self::Coral,
            Self::Echo,
            Self::Marin,
            Self::Sage,
            Self::Shimmer,
            Self::Verse,
        ]
    }

    /// Voice names as advertised by the admin surface.
    pub fn names() -> Vec<&'static str> {
        Self::all().iter().map(RealtimeVoice::as_str).collect()
    }
}

impl std::fmt::Display for RealtimeVoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
