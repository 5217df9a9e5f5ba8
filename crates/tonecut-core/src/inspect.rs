// crates/tonecut-core/src/inspect.rs
//
// Info inspector: open with the demuxer only, read track formats and file
// stats, classify the format and report capability flags. Unreadable audio is
// an `Invalid` report, never an error.

use std::path::Path;

use crate::backend::{find_audio_track, Backend, Demuxer};
use crate::error::AudioError;
use crate::helpers::time::{format_duration, us_to_ms};
use crate::media_types::{
    AudioDetails, AudioInfo, CapabilityFlags, InfoErrorKind, TrackFormat,
};

// ── Format classification ─────────────────────────────────────────────────────

/// True for MIME types whose elementary stream can be remuxed into MP4
/// without a codec: the AAC/MP4 family only.
pub fn is_aac_family(mime: &str) -> bool {
    matches!(
        mime.to_ascii_lowercase().as_str(),
        "audio/mp4" | "audio/mp4a-latm" | "audio/aac"
    )
}

/// Fixed MIME-family capability map. Everything readable converts and trims;
/// lossless trimming needs an AAC elementary stream.
pub fn capability_flags(mime: &str) -> CapabilityFlags {
    let mime = mime.to_ascii_lowercase();
    let known = matches!(
        mime.as_str(),
        "audio/mpeg"
            | "audio/mp3"
            | "audio/mp4"
            | "audio/mp4a-latm"
            | "audio/aac"
            | "audio/wav"
            | "audio/x-wav"
            | "audio/wave"
            | "audio/vnd.wave"
            | "audio/ogg"
            | "audio/vorbis"
    );
    CapabilityFlags {
        convertible: known,
        trimmable: known,
        lossless_trimmable: is_aac_family(&mime),
        waveform_supported: known,
    }
}

/// Short codec label for a track MIME, for diagnostics and track listings.
pub fn codec_name(mime: &str) -> &'static str {
    match mime.to_ascii_lowercase().as_str() {
        "audio/mpeg" | "audio/mp3" => "mp3",
        "audio/mp4" | "audio/mp4a-latm" | "audio/aac" => "aac",
        "audio/wav" | "audio/x-wav" | "audio/wave" | "audio/vnd.wave" => "pcm",
        "audio/ogg" | "audio/vorbis" => "vorbis",
        "audio/opus" => "opus",
        "audio/flac" => "flac",
        _ => "unknown",
    }
}

// ── Inspection ────────────────────────────────────────────────────────────────

pub fn inspect<B: Backend>(backend: &B, path: &Path) -> AudioInfo {
    let file_size = match std::fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return AudioInfo::Invalid {
                kind: InfoErrorKind::NotFound,
                details: format!("'{}' does not exist", path.display()),
            };
        }
        Err(e) => {
            return AudioInfo::Invalid {
                kind: InfoErrorKind::Unreadable,
                details: format!("'{}': {e}", path.display()),
            };
        }
    };

    let demuxer = match backend.open_demuxer(path) {
        Ok(d) => d,
        Err(AudioError::UnsupportedFormat(details)) => {
            return AudioInfo::Invalid { kind: InfoErrorKind::UnsupportedContainer, details };
        }
        Err(e) => {
            return AudioInfo::Invalid {
                kind: InfoErrorKind::Unreadable,
                details: e.to_string(),
            };
        }
    };

    let tracks = demuxer.tracks();
    let found_tracks: Vec<String> = tracks
        .iter()
        .enumerate()
        .map(|(i, t)| {
            format!(
                "track {i}: {} {} Hz {} ch",
                if t.mime.is_empty() { "unknown" } else { &t.mime },
                t.sample_rate,
                t.channels
            )
        })
        .collect();

    let Some(track_index) = find_audio_track(tracks) else {
        return AudioInfo::Invalid {
            kind: InfoErrorKind::NoAudioTrack,
            details: format!(
                "no audio track among {} track(s) in '{}'",
                tracks.len(),
                path.display()
            ),
        };
    };
    let track = &tracks[track_index];
    let source = demuxer.source();

    let duration_us = track.duration_us.unwrap_or(source.duration_us);
    let bit_rate_kbps = resolve_bit_rate_kbps(track, source.bit_rate, file_size, duration_us);
    let capability_flags = capability_flags(&track.mime);
    let codec = codec_name(&track.mime).to_string();
    let bit_depth = (codec == "pcm").then_some(16);

    let duration_secs = duration_us as f64 / 1_000_000.0;
    let diagnostics_text = format!(
        "container: {}\ncodec: {codec}\nduration: {}\nsample rate: {} Hz\nchannels: {}\nbit rate: {} kbps{}",
        if source.mime.is_empty() { "unknown" } else { &source.mime },
        format_duration(duration_secs),
        track.sample_rate,
        track.channels,
        bit_rate_kbps,
        if track.bit_rate.is_none() && source.bit_rate == 0 {
            " (estimated from file size)"
        } else {
            ""
        },
    );

    AudioInfo::Valid(AudioDetails {
        file_size,
        duration_ms: us_to_ms(duration_us),
        mime: source.mime.clone(),
        codec,
        bit_rate_kbps,
        sample_rate: track.sample_rate,
        channels: track.channels,
        bit_depth,
        metadata: source.metadata.clone(),
        capability_flags,
        diagnostics_text,
        found_tracks,
    })
}

/// Container bitrate when present; otherwise `size × 8 / duration`.
fn resolve_bit_rate_kbps(
    track: &TrackFormat,
    container_bps: u64,
    file_size: u64,
    duration_us: i64,
) -> u32 {
    let bps = track
        .bit_rate
        .filter(|&b| b > 0)
        .or_else(|| (container_bps > 0).then_some(container_bps))
        .unwrap_or_else(|| {
            if duration_us <= 0 {
                0
            } else {
                file_size * 8 * 1_000_000 / duration_us as u64
            }
        });
    (bps / 1000) as u32
}
