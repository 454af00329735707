//! Media-domain enums for containers, codecs, and quality tiers.
//!
//! All enums serialize in lowercase (via `serde(rename_all = "lowercase")`) and
//! implement `Display` manually for consistent string representation. These
//! are the only values that ever reach a transcoder argument vector.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Number of leading output bytes needed to recognise any container.
pub const SIGNATURE_LEN: usize = 12;

/// Audio sample rates a caller may request.
pub const ALLOWED_SAMPLE_RATES: &[u32] = &[8000, 16000, 22050, 44100, 48000];

/// Largest channel count a caller may request.
pub const MAX_CHANNELS: u8 = 2;

// ---------------------------------------------------------------------------
// Container
// ---------------------------------------------------------------------------

/// Supported output container formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    Mp4,
    Webm,
    Mkv,
    Mp3,
    Wav,
    Flac,
}

impl Container {
    /// Every container, in declaration order.
    pub const ALL: [Container; 6] = [
        Self::Mp4,
        Self::Webm,
        Self::Mkv,
        Self::Mp3,
        Self::Wav,
        Self::Flac,
    ];

    /// ffmpeg muxer name passed to `-f`.
    pub fn muxer(self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Webm => "webm",
            Self::Mkv => "matroska",
            Self::Mp3 => "mp3",
            Self::Wav => "wav",
            Self::Flac => "flac",
        }
    }

    /// MIME type for HTTP responses.
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Mp4 => "video/mp4",
            Self::Webm => "video/webm",
            Self::Mkv => "video/x-matroska",
            Self::Mp3 => "audio/mpeg",
            Self::Wav => "audio/wav",
            Self::Flac => "audio/flac",
        }
    }

    /// File extension without the leading dot.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Webm => "webm",
            Self::Mkv => "mkv",
            Self::Mp3 => "mp3",
            Self::Wav => "wav",
            Self::Flac => "flac",
        }
    }

    /// Whether the container can only carry audio.
    pub fn is_audio_only(self) -> bool {
        matches!(self, Self::Mp3 | Self::Wav | Self::Flac)
    }

    /// Whether `codec` can be muxed into this container.
    pub fn supports(self, codec: Codec) -> bool {
        use Codec::*;
        match self {
            Self::Mp4 => matches!(codec, H264 | H265 | Aac | Mp3 | Opus),
            Self::Webm => matches!(codec, Vp9 | Opus),
            Self::Mkv => matches!(codec, H264 | H265 | Vp9 | Aac | Opus | Flac | Mp3),
            Self::Mp3 => matches!(codec, Mp3),
            Self::Wav => matches!(codec, PcmS16le),
            Self::Flac => matches!(codec, Flac),
        }
    }

    /// Check the leading bytes of an output stream against this container's
    /// magic signature.
    pub fn matches_signature(self, head: &[u8]) -> bool {
        match self {
            Self::Mp4 => head.len() >= 8 && &head[4..8] == b"ftyp",
            Self::Webm | Self::Mkv => head.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]),
            Self::Mp3 => {
                head.starts_with(b"ID3")
                    || (head.len() >= 2 && head[0] == 0xFF && head[1] & 0xE0 == 0xE0)
            }
            Self::Wav => head.len() >= 12 && &head[0..4] == b"RIFF" && &head[8..12] == b"WAVE",
            Self::Flac => head.starts_with(b"fLaC"),
        }
    }
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mp4 => write!(f, "mp4"),
            Self::Webm => write!(f, "webm"),
            Self::Mkv => write!(f, "mkv"),
            Self::Mp3 => write!(f, "mp3"),
            Self::Wav => write!(f, "wav"),
            Self::Flac => write!(f, "flac"),
        }
    }
}

impl FromStr for Container {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mp4" => Ok(Self::Mp4),
            "webm" => Ok(Self::Webm),
            "mkv" | "matroska" => Ok(Self::Mkv),
            "mp3" => Ok(Self::Mp3),
            "wav" => Ok(Self::Wav),
            "flac" => Ok(Self::Flac),
            _ => Err(format!("Unknown container: {s}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Supported target codecs. Video codecs imply a companion audio codec chosen
/// by the argument builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    H264,
    H265,
    Vp9,
    Aac,
    Opus,
    Mp3,
    #[serde(rename = "pcm_s16le")]
    PcmS16le,
    Flac,
}

impl Codec {
    /// Whether this is a video codec.
    pub fn is_video(self) -> bool {
        matches!(self, Self::H264 | Self::H265 | Self::Vp9)
    }

    /// ffmpeg encoder name passed to `-c:v` / `-c:a`.
    pub fn encoder(self) -> &'static str {
        match self {
            Self::H264 => "libx264",
            Self::H265 => "libx265",
            Self::Vp9 => "libvpx-vp9",
            Self::Aac => "aac",
            Self::Opus => "libopus",
            Self::Mp3 => "libmp3lame",
            Self::PcmS16le => "pcm_s16le",
            Self::Flac => "flac",
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::H264 => write!(f, "h264"),
            Self::H265 => write!(f, "h265"),
            Self::Vp9 => write!(f, "vp9"),
            Self::Aac => write!(f, "aac"),
            Self::Opus => write!(f, "opus"),
            Self::Mp3 => write!(f, "mp3"),
            Self::PcmS16le => write!(f, "pcm_s16le"),
            Self::Flac => write!(f, "flac"),
        }
    }
}

impl FromStr for Codec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "h264" | "avc" => Ok(Self::H264),
            "h265" | "hevc" => Ok(Self::H265),
            "vp9" => Ok(Self::Vp9),
            "aac" => Ok(Self::Aac),
            "opus" => Ok(Self::Opus),
            "mp3" => Ok(Self::Mp3),
            "pcm_s16le" | "pcm" => Ok(Self::PcmS16le),
            "flac" => Ok(Self::Flac),
            _ => Err(format!("Unknown codec: {s}")),
        }
    }
}

// ---------------------------------------------------------------------------
// QualityTier
// ---------------------------------------------------------------------------

/// Coarse quality knob mapped to codec-specific CRF / bitrate values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Low,
    #[default]
    Medium,
    High,
}

impl QualityTier {
    /// Every tier, lowest first.
    pub const ALL: [QualityTier; 3] = [Self::Low, Self::Medium, Self::High];
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

impl FromStr for QualityTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            _ => Err(format!("Unknown quality tier: {s}")),
        }
    }
}

// ---------------------------------------------------------------------------
// FormatParams
// ---------------------------------------------------------------------------

/// Target output parameters of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatParams {
    pub container: Container,
    pub codec: Codec,
    #[serde(default)]
    pub quality: QualityTier,
    /// Output audio sample rate; one of [`ALLOWED_SAMPLE_RATES`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    /// Output audio channel count, `1..=MAX_CHANNELS`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
}

impl FormatParams {
    pub fn new(container: Container, codec: Codec, quality: QualityTier) -> Self {
        Self {
            container,
            codec,
            quality,
            sample_rate: None,
            channels: None,
        }
    }

    /// Mono 16 kHz WAV, the layout speech recognisers expect.
    pub fn speech_audio() -> Self {
        Self {
            container: Container::Wav,
            codec: Codec::PcmS16le,
            quality: QualityTier::Medium,
            sample_rate: Some(16000),
            channels: Some(1),
        }
    }
}

impl fmt::Display for FormatParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.container, self.codec, self.quality)
    }
}
