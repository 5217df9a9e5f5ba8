// crates/tonecut-core/src/backend.rs
//
// Trait seams between the engines and a media backend. The engines in this
// crate (pipeline, copy, splice, waveform, inspect) are written against these
// traits only; tonecut-media provides the FFmpeg implementations and the test
// suites drive the same engines with the in-memory fakes at the bottom of
// this file.
//
// Codec model:
//   Decoder and encoder are polled, not blocked on. `try_send` either accepts
//   the buffer or reports `Full` — the caller keeps ownership and retries
//   after draining output. `try_receive` returns `Empty` when the codec needs
//   more input. EOS rides on the buffers themselves (`PcmFrame::is_eos`,
//   `AuFlags::is_eos`), so flush completion is observable as data, not as a
//   separate channel of truth.

use std::path::Path;

use crate::error::AudioError;
use crate::media_types::{AccessUnit, EncoderConfig, PcmFrame, SourceFormat, TrackFormat};

pub type TrackId = usize;

/// A muxer accepts timestamps up to this much behind the previous sample
/// before rejecting the write as non-monotonic.
pub const JITTER_TOLERANCE_US: i64 = 10_000;

// ── Demuxer ───────────────────────────────────────────────────────────────────

pub trait Demuxer {
    /// Container-level facts; available immediately after open.
    fn source(&self) -> &SourceFormat;

    /// All tracks, in container order.
    fn tracks(&self) -> &[TrackFormat];

    /// Latch one audio track as the source for `next()`.
    fn select(&mut self, track_index: usize) -> Result<(), AudioError>;

    /// Position the cursor at the nearest preceding sync sample and return
    /// the actual landing timestamp, which may be earlier than `time_us`.
    /// Containers without a sync index land at the earliest AU at or after
    /// `time_us` instead.
    fn seek_to_sync(&mut self, time_us: i64) -> Result<i64, AudioError>;

    /// Next access unit of the selected track; `None` at end of stream.
    /// I/O failures here are fatal to the owning pipeline.
    fn next(&mut self) -> Result<Option<AccessUnit>, AudioError>;
}

// ── Codec pair ────────────────────────────────────────────────────────────────

/// Outcome of handing a buffer to a codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Accepted,
    /// The codec cannot take input until some output is drained. The caller
    /// keeps the buffer and retries.
    Full,
}

#[derive(Debug)]
pub enum DecoderEvent {
    Pcm(PcmFrame),
    Empty,
}

#[derive(Debug)]
pub enum EncoderEvent {
    Packet(AccessUnit),
    /// Emitted exactly once, before the first packet. The receiver registers
    /// this format with the muxer. A second occurrence is a fatal pipeline
    /// error.
    FormatChanged(TrackFormat),
    Empty,
}

pub trait AudioDecoder {
    /// Sample rate of the PCM this decoder emits.
    fn output_rate(&self) -> u32;

    /// Channel count of the PCM this decoder emits (clamped to 1 or 2).
    fn output_channels(&self) -> u16;

    fn try_send(&mut self, au: &AccessUnit) -> Result<SendStatus, AudioError>;

    /// Queue end-of-stream; the decoder flushes and ends its PCM sequence
    /// with an `is_eos` frame.
    fn send_eos(&mut self) -> Result<SendStatus, AudioError>;

    fn try_receive(&mut self) -> Result<DecoderEvent, AudioError>;
}

pub trait AudioEncoder {
    fn config(&self) -> &EncoderConfig;

    fn try_send(&mut self, pcm: &PcmFrame) -> Result<SendStatus, AudioError>;

    /// Queue end-of-stream; the encoder flushes and ends its AU sequence with
    /// an `is_eos` packet.
    fn send_eos(&mut self) -> Result<SendStatus, AudioError>;

    fn try_receive(&mut self) -> Result<EncoderEvent, AudioError>;
}

// ── Muxer ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxerState {
    Created,
    TrackAdded,
    Started,
    Stopped,
}

/// Lifecycle: `Created → add_track → TrackAdded → start → Started →
/// write_sample* → stop → Stopped`. `write_sample` before `start` is a caller
/// bug and fails with `MuxerError`; `stop` is idempotent and safe on every
/// exit path.
pub trait Muxer {
    fn state(&self) -> MuxerState;

    fn add_track(&mut self, format: &TrackFormat) -> Result<TrackId, AudioError>;

    fn start(&mut self) -> Result<(), AudioError>;

    /// AU timestamps must be non-decreasing per track, within
    /// [`JITTER_TOLERANCE_US`].
    fn write_sample(&mut self, track: TrackId, au: &AccessUnit) -> Result<(), AudioError>;

    fn stop(&mut self) -> Result<(), AudioError>;
}

// ── Backend factory ───────────────────────────────────────────────────────────

/// Ties the four stage implementations of one media backend together so the
/// engines can open what they need without naming concrete types.
pub trait Backend {
    type Demuxer: Demuxer;
    type Decoder: AudioDecoder;
    type Encoder: AudioEncoder;
    type Muxer: Muxer;

    fn open_demuxer(&self, path: &Path) -> Result<Self::Demuxer, AudioError>;

    /// Build a decoder for the demuxer's currently selected track.
    fn new_decoder(&self, demuxer: &Self::Demuxer) -> Result<Self::Decoder, AudioError>;

    /// Build an encoder for `config`, told what PCM it will initially be fed
    /// (`input` is the source track the decoder reads from).
    fn new_encoder(
        &self,
        input: &TrackFormat,
        config: EncoderConfig,
    ) -> Result<Self::Encoder, AudioError>;

    fn create_muxer(&self, path: &Path) -> Result<Self::Muxer, AudioError>;
}

/// First audio track in container order, if any.
pub fn find_audio_track(tracks: &[TrackFormat]) -> Option<usize> {
    tracks.iter().position(|t| t.mime.starts_with("audio/"))
}

// ── In-memory fakes (test backend) ────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::{HashMap, VecDeque};
    use std::path::PathBuf;

    use super::*;
    use crate::media_types::AuFlags;

    /// Build a synthetic AAC-shaped track: `frame_count` sync AUs of
    /// `frame_us` each, payload filled with `fill`.
    pub fn synthetic_aus(frame_count: usize, frame_us: i64, fill: u8) -> Vec<AccessUnit> {
        (0..frame_count)
            .map(|i| AccessUnit {
                data: vec![fill; 64],
                pts_us: i as i64 * frame_us,
                flags: AuFlags { is_sync: true, is_eos: false },
            })
            .collect()
    }

    pub struct FakeDemuxer {
        pub source: SourceFormat,
        pub tracks: Vec<TrackFormat>,
        pub aus: Vec<AccessUnit>,
        pub cursor: usize,
        pub selected: Option<usize>,
    }

    impl FakeDemuxer {
        pub fn new(track: TrackFormat, aus: Vec<AccessUnit>) -> Self {
            let duration_us = track.duration_us.unwrap_or_else(|| {
                aus.last().map(|au| au.pts_us).unwrap_or(0)
            });
            Self {
                source: SourceFormat {
                    mime: track.mime.clone(),
                    duration_us,
                    bit_rate: track.bit_rate.unwrap_or(0),
                    metadata: Default::default(),
                },
                tracks: vec![track],
                aus,
                cursor: 0,
                selected: None,
            }
        }
    }

    impl Demuxer for FakeDemuxer {
        fn source(&self) -> &SourceFormat {
            &self.source
        }

        fn tracks(&self) -> &[TrackFormat] {
            &self.tracks
        }

        fn select(&mut self, track_index: usize) -> Result<(), AudioError> {
            if track_index >= self.tracks.len() {
                return Err(AudioError::InvalidArguments(format!(
                    "track {track_index} out of range"
                )));
            }
            self.selected = Some(track_index);
            Ok(())
        }

        fn seek_to_sync(&mut self, time_us: i64) -> Result<i64, AudioError> {
            // Nearest preceding sync AU; all fake AUs are sync.
            let landing = self
                .aus
                .iter()
                .enumerate()
                .take_while(|(_, au)| au.pts_us <= time_us)
                .last()
                .map(|(i, au)| (i, au.pts_us))
                .unwrap_or((0, self.aus.first().map(|au| au.pts_us).unwrap_or(0)));
            self.cursor = landing.0;
            Ok(landing.1)
        }

        fn next(&mut self) -> Result<Option<AccessUnit>, AudioError> {
            let au = self.aus.get(self.cursor).cloned();
            if au.is_some() {
                self.cursor += 1;
            }
            Ok(au)
        }
    }

    /// Passthrough decoder: one AU in, one PCM frame out with the same bytes
    /// and timestamp. Bounded input queue so back-pressure is observable.
    pub struct FakeDecoder {
        pub rate: u32,
        pub channels: u16,
        queue: VecDeque<PcmFrame>,
        capacity: usize,
        eos_queued: bool,
        eos_delivered: bool,
    }

    impl FakeDecoder {
        pub fn new(rate: u32, channels: u16) -> Self {
            Self {
                rate,
                channels,
                queue: VecDeque::new(),
                capacity: 4,
                eos_queued: false,
                eos_delivered: false,
            }
        }
    }

    impl AudioDecoder for FakeDecoder {
        fn output_rate(&self) -> u32 {
            self.rate
        }

        fn output_channels(&self) -> u16 {
            self.channels
        }

        fn try_send(&mut self, au: &AccessUnit) -> Result<SendStatus, AudioError> {
            if self.queue.len() >= self.capacity {
                return Ok(SendStatus::Full);
            }
            self.queue.push_back(PcmFrame {
                data: au.data.clone(),
                rate: self.rate,
                channels: self.channels,
                pts_us: au.pts_us,
                is_eos: false,
            });
            Ok(SendStatus::Accepted)
        }

        fn send_eos(&mut self) -> Result<SendStatus, AudioError> {
            self.eos_queued = true;
            Ok(SendStatus::Accepted)
        }

        fn try_receive(&mut self) -> Result<DecoderEvent, AudioError> {
            if let Some(frame) = self.queue.pop_front() {
                return Ok(DecoderEvent::Pcm(frame));
            }
            if self.eos_queued && !self.eos_delivered {
                self.eos_delivered = true;
                return Ok(DecoderEvent::Pcm(PcmFrame {
                    data: Vec::new(),
                    rate: self.rate,
                    channels: self.channels,
                    pts_us: 0,
                    is_eos: true,
                }));
            }
            Ok(DecoderEvent::Empty)
        }
    }

    /// Passthrough encoder: one PCM frame in, one AU out, format event first.
    /// `stall_for` makes the next N `try_send` calls report `Full`, modelling
    /// a codec that is momentarily out of input buffers.
    pub struct FakeEncoder {
        cfg: EncoderConfig,
        out: VecDeque<EncoderEvent>,
        format_sent: bool,
        eos_seen: bool,
        pub stall_for: u32,
        pub accepted_frames: usize,
    }

    impl FakeEncoder {
        pub fn new(cfg: EncoderConfig) -> Self {
            Self {
                cfg,
                out: VecDeque::new(),
                format_sent: false,
                eos_seen: false,
                stall_for: 0,
                accepted_frames: 0,
            }
        }

        fn output_format(&self) -> TrackFormat {
            TrackFormat {
                mime: "audio/mp4a-latm".into(),
                sample_rate: self.cfg.sample_rate,
                channels: self.cfg.channels,
                bit_rate: Some(self.cfg.bit_rate as u64),
                duration_us: None,
                codec_specific_data: Some(vec![0x12, 0x10]),
            }
        }
    }

    impl AudioEncoder for FakeEncoder {
        fn config(&self) -> &EncoderConfig {
            &self.cfg
        }

        fn try_send(&mut self, pcm: &PcmFrame) -> Result<SendStatus, AudioError> {
            if self.stall_for > 0 {
                self.stall_for -= 1;
                return Ok(SendStatus::Full);
            }
            if !self.format_sent {
                self.format_sent = true;
                self.out.push_back(EncoderEvent::FormatChanged(self.output_format()));
            }
            self.accepted_frames += 1;
            self.out.push_back(EncoderEvent::Packet(AccessUnit {
                data: pcm.data.clone(),
                pts_us: pcm.pts_us,
                flags: AuFlags { is_sync: true, is_eos: false },
            }));
            Ok(SendStatus::Accepted)
        }

        fn send_eos(&mut self) -> Result<SendStatus, AudioError> {
            if self.eos_seen {
                return Ok(SendStatus::Accepted);
            }
            self.eos_seen = true;
            if !self.format_sent {
                self.format_sent = true;
                self.out.push_back(EncoderEvent::FormatChanged(self.output_format()));
            }
            self.out.push_back(EncoderEvent::Packet(AccessUnit {
                data: Vec::new(),
                pts_us: 0,
                flags: AuFlags { is_sync: false, is_eos: true },
            }));
            Ok(SendStatus::Accepted)
        }

        fn try_receive(&mut self) -> Result<EncoderEvent, AudioError> {
            Ok(self.out.pop_front().unwrap_or(EncoderEvent::Empty))
        }
    }

    /// Recording muxer that enforces the lifecycle and per-track timestamp
    /// monotonicity the way the real MP4 muxer does.
    pub struct FakeMuxer {
        state: MuxerState,
        pub track_format: Option<TrackFormat>,
        pub samples: Vec<AccessUnit>,
        last_pts_us: Option<i64>,
    }

    impl FakeMuxer {
        pub fn new() -> Self {
            Self {
                state: MuxerState::Created,
                track_format: None,
                samples: Vec::new(),
                last_pts_us: None,
            }
        }

        pub fn written_bytes(&self) -> usize {
            self.samples.iter().map(|au| au.size()).sum()
        }
    }

    impl Muxer for FakeMuxer {
        fn state(&self) -> MuxerState {
            self.state
        }

        fn add_track(&mut self, format: &TrackFormat) -> Result<TrackId, AudioError> {
            if self.state != MuxerState::Created {
                return Err(AudioError::Muxer("add_track after start".into()));
            }
            self.track_format = Some(format.clone());
            self.state = MuxerState::TrackAdded;
            Ok(0)
        }

        fn start(&mut self) -> Result<(), AudioError> {
            if self.state != MuxerState::TrackAdded {
                return Err(AudioError::Muxer("start without a track".into()));
            }
            self.state = MuxerState::Started;
            Ok(())
        }

        fn write_sample(&mut self, track: TrackId, au: &AccessUnit) -> Result<(), AudioError> {
            if self.state != MuxerState::Started {
                return Err(AudioError::Muxer("write_sample before start".into()));
            }
            if track != 0 {
                return Err(AudioError::Muxer(format!("unknown track {track}")));
            }
            if let Some(last) = self.last_pts_us {
                if au.pts_us < last - JITTER_TOLERANCE_US {
                    return Err(AudioError::Muxer(format!(
                        "non-monotonic timestamp {} after {last}",
                        au.pts_us
                    )));
                }
            }
            self.last_pts_us = Some(au.pts_us);
            self.samples.push(au.clone());
            Ok(())
        }

        fn stop(&mut self) -> Result<(), AudioError> {
            // Idempotent by contract.
            self.state = MuxerState::Stopped;
            Ok(())
        }
    }

    /// A whole backend over in-memory files: path → (track, AUs).
    pub struct FakeBackend {
        pub files: HashMap<PathBuf, (TrackFormat, Vec<AccessUnit>)>,
    }

    impl FakeBackend {
        pub fn new() -> Self {
            Self { files: HashMap::new() }
        }

        pub fn with_file(
            mut self,
            path: impl Into<PathBuf>,
            track: TrackFormat,
            aus: Vec<AccessUnit>,
        ) -> Self {
            self.files.insert(path.into(), (track, aus));
            self
        }
    }

    impl Backend for FakeBackend {
        type Demuxer = FakeDemuxer;
        type Decoder = FakeDecoder;
        type Encoder = FakeEncoder;
        type Muxer = FakeMuxer;

        fn open_demuxer(&self, path: &Path) -> Result<FakeDemuxer, AudioError> {
            let (track, aus) = self
                .files
                .get(path)
                .ok_or_else(|| AudioError::io(path, "no such file"))?;
            Ok(FakeDemuxer::new(track.clone(), aus.clone()))
        }

        fn new_decoder(&self, demuxer: &FakeDemuxer) -> Result<FakeDecoder, AudioError> {
            let track = demuxer
                .selected
                .and_then(|i| demuxer.tracks.get(i))
                .ok_or_else(|| AudioError::Codec("no track selected".into()))?;
            Ok(FakeDecoder::new(track.sample_rate, track.channels.min(2)))
        }

        fn new_encoder(
            &self,
            _input: &TrackFormat,
            config: EncoderConfig,
        ) -> Result<FakeEncoder, AudioError> {
            Ok(FakeEncoder::new(config))
        }

        fn create_muxer(&self, _path: &Path) -> Result<FakeMuxer, AudioError> {
            Ok(FakeMuxer::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::*;
    use super::*;
    use crate::media_types::AuFlags;

    #[test]
    fn fake_muxer_rejects_early_write() {
        let mut muxer = FakeMuxer::new();
        let au = AccessUnit::default();
        assert!(matches!(muxer.write_sample(0, &au), Err(AudioError::Muxer(_))));
    }

    #[test]
    fn fake_muxer_rejects_backward_timestamp_beyond_jitter() {
        let mut muxer = FakeMuxer::new();
        muxer.add_track(&TrackFormat::default()).unwrap();
        muxer.start().unwrap();
        let at = |pts_us| AccessUnit { pts_us, ..Default::default() };
        muxer.write_sample(0, &at(100_000)).unwrap();
        // Within jitter: accepted.
        muxer.write_sample(0, &at(95_000)).unwrap();
        // Beyond jitter: rejected.
        assert!(muxer.write_sample(0, &at(50_000)).is_err());
    }

    #[test]
    fn fake_muxer_stop_is_idempotent() {
        let mut muxer = FakeMuxer::new();
        muxer.add_track(&TrackFormat::default()).unwrap();
        muxer.start().unwrap();
        muxer.stop().unwrap();
        muxer.stop().unwrap();
        assert_eq!(muxer.state(), MuxerState::Stopped);
    }

    #[test]
    fn fake_demuxer_seeks_to_preceding_sync() {
        let track = TrackFormat { duration_us: Some(100_000), ..Default::default() };
        let mut demuxer = FakeDemuxer::new(track, synthetic_aus(10, 10_000, 0));
        let landing = demuxer.seek_to_sync(35_000).unwrap();
        assert_eq!(landing, 30_000);
        assert_eq!(demuxer.next().unwrap().unwrap().pts_us, 30_000);
    }

    #[test]
    fn fake_encoder_emits_format_before_first_packet() {
        let cfg = EncoderConfig {
            sample_rate: 44_100,
            channels: 2,
            bit_rate: 128_000,
            max_input_size: EncoderConfig::MAX_INPUT_SIZE,
        };
        let mut encoder = FakeEncoder::new(cfg);
        let pcm = PcmFrame {
            data: vec![0; 8],
            rate: 44_100,
            channels: 2,
            pts_us: 0,
            is_eos: false,
        };
        encoder.try_send(&pcm).unwrap();
        assert!(matches!(encoder.try_receive().unwrap(), EncoderEvent::FormatChanged(_)));
        assert!(matches!(encoder.try_receive().unwrap(), EncoderEvent::Packet(_)));
        assert!(matches!(encoder.try_receive().unwrap(), EncoderEvent::Empty));
    }

    #[test]
    fn fake_decoder_flushes_with_eos_frame() {
        let mut decoder = FakeDecoder::new(44_100, 2);
        let au = AccessUnit {
            data: vec![1, 2, 3, 4],
            pts_us: 0,
            flags: AuFlags { is_sync: true, is_eos: false },
        };
        decoder.try_send(&au).unwrap();
        decoder.send_eos().unwrap();
        assert!(matches!(decoder.try_receive().unwrap(), DecoderEvent::Pcm(f) if !f.is_eos));
        assert!(matches!(decoder.try_receive().unwrap(), DecoderEvent::Pcm(f) if f.is_eos));
        assert!(matches!(decoder.try_receive().unwrap(), DecoderEvent::Empty));
    }
}
