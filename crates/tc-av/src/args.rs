//! ffmpeg argument vectors derived from validated [`FormatParams`].
//!
//! Every token comes from a closed enum, a bounded number or a path the
//! service created itself; nothing a caller typed is ever copied into the
//! argument list.

use std::path::Path;

use tc_core::{Codec, Container, FormatParams, QualityTier};

/// Constant rate factor for a video codec at a given tier.
///
/// - H.264: 28 / 23 / 18
/// - H.265: 32 / 28 / 22
/// - VP9:   40 / 33 / 24
pub fn video_crf(codec: Codec, quality: QualityTier) -> Option<u32> {
    let (low, medium, high) = match codec {
        Codec::H264 => (28, 23, 18),
        Codec::H265 => (32, 28, 22),
        Codec::Vp9 => (40, 33, 24),
        _ => return None,
    };
    Some(match quality {
        QualityTier::Low => low,
        QualityTier::Medium => medium,
        QualityTier::High => high,
    })
}

/// Target bitrate for lossy audio codecs; `None` for PCM and FLAC.
pub fn audio_bitrate(codec: Codec, quality: QualityTier) -> Option<&'static str> {
    match (codec, quality) {
        (Codec::Opus, QualityTier::Low) => Some("64k"),
        (Codec::Opus, QualityTier::Medium) => Some("96k"),
        (Codec::Opus, QualityTier::High) => Some("128k"),
        (Codec::Aac | Codec::Mp3, QualityTier::Low) => Some("96k"),
        (Codec::Aac | Codec::Mp3, QualityTier::Medium) => Some("128k"),
        (Codec::Aac | Codec::Mp3, QualityTier::High) => Some("192k"),
        _ => None,
    }
}

/// Audio codec paired with a video codec inside `container`.
fn companion_audio(container: Container) -> Codec {
    match container {
        Container::Webm => Codec::Opus,
        _ => Codec::Aac,
    }
}

/// Build the full argument list (without the program name) for a job that
/// writes to stdout.
///
/// With `input` unset ffmpeg reads stdin. A staged file is passed through the
/// `file:` protocol so that a leading `-` or `:` in the name is never parsed
/// as an option or another protocol.
pub fn build_ffmpeg_args(format: &FormatParams, input: Option<&Path>) -> Vec<String> {
    let mut args: Vec<String> = Vec::with_capacity(32);
    let mut push = |items: &[&str]| args.extend(items.iter().map(|s| s.to_string()));

    let input = match input {
        Some(path) => format!("file:{}", path.display()),
        None => "pipe:0".to_string(),
    };
    push(&["-hide_banner", "-loglevel", "error", "-y", "-i", &input]);

    let audio = if format.codec.is_video() {
        push(&["-map", "0:v:0", "-map", "0:a:0?"]);
        push(&["-c:v", format.codec.encoder()]);
        match format.codec {
            Codec::Vp9 => push(&["-b:v", "0", "-row-mt", "1", "-deadline", "realtime"]),
            _ => push(&["-preset", "veryfast", "-pix_fmt", "yuv420p"]),
        }
        if let Some(crf) = video_crf(format.codec, format.quality) {
            push(&["-crf", &crf.to_string()]);
        }
        companion_audio(format.container)
    } else {
        push(&["-vn", "-map", "0:a:0"]);
        format.codec
    };

    push(&["-c:a", audio.encoder()]);
    if let Some(bitrate) = audio_bitrate(audio, format.quality) {
        push(&["-b:a", bitrate]);
    }
    if let Some(rate) = format.sample_rate {
        push(&["-ar", &rate.to_string()]);
    }
    if let Some(channels) = format.channels {
        push(&["-ac", &channels.to_string()]);
    }

    // A pipe is not seekable, so MP4 must be written fragmented.
    if format.container == Container::Mp4 {
        push(&["-movflags", "frag_keyframe+empty_moov+default_base_moof"]);
    }

    push(&["-f", format.container.muxer(), "pipe:1"]);
    args
}
