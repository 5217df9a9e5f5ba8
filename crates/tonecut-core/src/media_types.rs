// crates/tonecut-core/src/media_types.rs
//
// Types that flow across the backend seam between tonecut-core and a media
// backend (tonecut-media). No ffmpeg, no channels — just plain data.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;

// ── Buffers ───────────────────────────────────────────────────────────────────

/// Flags carried by every compressed access unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuFlags {
    /// Decoding may start at this AU without prior context.
    pub is_sync: bool,
    /// No further data follows this AU.
    pub is_eos: bool,
}

/// One compressed audio frame, as produced by a demuxer or an encoder.
///
/// Ownership moves across the stage interface; an AU is never shared.
#[derive(Debug, Clone, Default)]
pub struct AccessUnit {
    pub data: Vec<u8>,
    pub pts_us: i64,
    pub flags: AuFlags,
}

impl AccessUnit {
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// A span of decoded samples in the canonical interchange layout:
/// 16-bit little-endian interleaved PCM.
///
/// The frame names its own rate and channel count so a consumer shared
/// across inputs (the splice encoder) can notice when the source format
/// changes under it.
#[derive(Debug, Clone, Default)]
pub struct PcmFrame {
    pub data: Vec<u8>,
    pub rate: u32,
    pub channels: u16,
    pub pts_us: i64,
    /// Set on the final (possibly empty) frame a decoder emits after flush.
    pub is_eos: bool,
}

impl PcmFrame {
    /// Number of per-channel sample frames in the buffer.
    pub fn sample_count(&self) -> usize {
        self.data.len() / (2 * self.channels.max(1) as usize)
    }

    /// Playback duration of the buffer.
    pub fn duration_us(&self) -> i64 {
        if self.rate == 0 {
            return 0;
        }
        self.sample_count() as i64 * 1_000_000 / self.rate as i64
    }
}

// ── Formats ───────────────────────────────────────────────────────────────────

/// Descriptor for one audio track, produced by the demuxer for inputs and by
/// the encoder (after its first output-format event) for outputs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackFormat {
    pub mime: String,
    pub sample_rate: u32,
    pub channels: u16,
    /// Bits per second, when the container reports one.
    pub bit_rate: Option<u64>,
    pub duration_us: Option<i64>,
    /// Codec private data (AudioSpecificConfig for AAC); required by the
    /// muxer to produce a playable track.
    pub codec_specific_data: Option<Vec<u8>>,
}

/// Container-level facts the demuxer knows without touching a codec.
#[derive(Debug, Clone, Default)]
pub struct SourceFormat {
    /// MIME of the container family ("audio/mp4", "audio/mpeg", …).
    pub mime: String,
    pub duration_us: i64,
    /// Container-reported bits per second; 0 when absent.
    pub bit_rate: u64,
    pub metadata: BTreeMap<String, String>,
}

/// Encoder configuration for the transcode path. Always AAC-LC into MP4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Bits per second. The public surface speaks kbps; the ×1000 happens here.
    pub bit_rate: u32,
    /// Input buffer budget. Smaller values have been shown to drop frames
    /// under back-pressure.
    pub max_input_size: usize,
}

impl EncoderConfig {
    pub const MAX_INPUT_SIZE: usize = 65_536;

    /// Derive the output configuration from the input track per the clamping
    /// rules: the input sample rate wins while it is inside the AAC-LC range,
    /// otherwise the caller's requested rate; channels clamp to mono/stereo.
    pub fn for_input(input: &TrackFormat, requested_rate: u32, bit_rate_kbps: u32) -> Self {
        let sample_rate = if (8_000..=48_000).contains(&input.sample_rate) {
            input.sample_rate
        } else if requested_rate > 0 {
            requested_rate
        } else {
            44_100
        };
        let channels = match input.channels {
            0 => 2,
            c => c.min(2),
        };
        Self {
            sample_rate,
            channels,
            bit_rate: bit_rate_kbps * 1000,
            max_input_size: Self::MAX_INPUT_SIZE,
        }
    }

    /// Nominal duration of one AAC frame (1024 samples) at the output rate.
    pub fn frame_duration_us(&self) -> i64 {
        1024 * 1_000_000 / self.sample_rate.max(1) as i64
    }
}

// ── Ranges ────────────────────────────────────────────────────────────────────

/// A half-open presentation-time window `[start_us, end_us)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start_us: i64,
    pub end_us: i64,
}

impl TimeRange {
    pub fn from_ms(start_ms: u64, end_ms: u64) -> Self {
        Self {
            start_us: start_ms as i64 * 1000,
            end_us: end_ms as i64 * 1000,
        }
    }

    pub fn span_us(&self) -> i64 {
        self.end_us - self.start_us
    }
}

// ── Results ───────────────────────────────────────────────────────────────────

/// Returned by every convert / trim / copy / splice call.
#[derive(Debug, Clone, Serialize)]
pub struct ConversionResult {
    pub output_path: PathBuf,
    pub duration_ms: u64,
    pub bit_rate_kbps: u32,
    pub sample_rate_hz: u32,
    /// Number of inputs consumed; 1 for everything but splice.
    pub files_processed: u32,
    /// True when the output carries the input elementary stream unchanged.
    pub lossless: bool,
}

/// Amplitude envelope for UI visualization.
#[derive(Debug, Clone, Serialize)]
pub struct WaveformEnvelope {
    /// Peak absolute amplitudes in [0, 1], one per bucket.
    pub amplitudes: Vec<f64>,
    /// Buckets per second requested by the caller.
    pub sample_rate_hz: u32,
    pub duration_ms: u64,
    pub channels: u16,
}

// ── Audio info ────────────────────────────────────────────────────────────────

/// What each MIME family supports. Lossless trimming is AAC/MP4-family only;
/// everything else routes through the transcode path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CapabilityFlags {
    pub convertible: bool,
    pub trimmable: bool,
    pub lossless_trimmable: bool,
    pub waveform_supported: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InfoErrorKind {
    NotFound,
    Unreadable,
    UnsupportedContainer,
    NoAudioTrack,
}

/// Structured report for one readable audio file.
#[derive(Debug, Clone, Serialize)]
pub struct AudioDetails {
    pub file_size: u64,
    pub duration_ms: u64,
    pub mime: String,
    pub codec: String,
    pub bit_rate_kbps: u32,
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: Option<u16>,
    pub metadata: BTreeMap<String, String>,
    pub capability_flags: CapabilityFlags,
    pub diagnostics_text: String,
    pub found_tracks: Vec<String>,
}

/// Diagnostic result for any input file. `Invalid` is a report, not an error:
/// unreadable audio is an answer the inspector gives, not a failure it throws.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AudioInfo {
    Valid(AudioDetails),
    Invalid { kind: InfoErrorKind, details: String },
}

impl AudioInfo {
    pub fn is_valid(&self) -> bool {
        matches!(self, AudioInfo::Valid(_))
    }
}

// ── Cancellation ──────────────────────────────────────────────────────────────

/// Shared cancel flag checked once per pipeline iteration.
///
/// Cloning shares the flag; a cancel issued through any clone is observed by
/// the pipeline on its next iteration.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoder_config_prefers_in_range_input_rate() {
        let input = TrackFormat { sample_rate: 22_050, channels: 1, ..Default::default() };
        let cfg = EncoderConfig::for_input(&input, 44_100, 128);
        assert_eq!(cfg.sample_rate, 22_050);
        assert_eq!(cfg.channels, 1);
        assert_eq!(cfg.bit_rate, 128_000);
    }

    #[test]
    fn encoder_config_falls_back_when_input_rate_out_of_range() {
        let input = TrackFormat { sample_rate: 96_000, channels: 6, ..Default::default() };
        let cfg = EncoderConfig::for_input(&input, 48_000, 192);
        assert_eq!(cfg.sample_rate, 48_000);
        assert_eq!(cfg.channels, 2);
    }

    #[test]
    fn encoder_config_defaults_unknown_channels_to_stereo() {
        let input = TrackFormat { sample_rate: 44_100, channels: 0, ..Default::default() };
        let cfg = EncoderConfig::for_input(&input, 44_100, 96);
        assert_eq!(cfg.channels, 2);
    }

    #[test]
    fn pcm_frame_duration() {
        // 44100 Hz stereo: 4410 sample frames = 100 ms = 17640 bytes.
        let frame = PcmFrame {
            data: vec![0; 17_640],
            rate: 44_100,
            channels: 2,
            pts_us: 0,
            is_eos: false,
        };
        assert_eq!(frame.sample_count(), 4410);
        assert_eq!(frame.duration_us(), 100_000);
    }

    #[test]
    fn cancel_token_is_shared_across_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn conversion_result_serializes_for_host_bridge() {
        let result = ConversionResult {
            output_path: PathBuf::from("/tmp/out.m4a"),
            duration_ms: 30_000,
            bit_rate_kbps: 192,
            sample_rate_hz: 44_100,
            files_processed: 1,
            lossless: false,
        };
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"duration_ms\":30000"));
        assert!(json.contains("\"bit_rate_kbps\":192"));
    }
}
