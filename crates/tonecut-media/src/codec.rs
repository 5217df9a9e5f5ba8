// crates/tonecut-media/src/codec.rs
//
// FFmpeg-backed decoder and encoder behind the core codec traits.
//
// FfmpegDecoder — compressed AU → s16le interleaved PCM at the source rate,
//   channels clamped to mono/stereo. The decoder runs in a microsecond
//   timebase: AU timestamps go in as packet PTS and come back out on the
//   decoded frames unchanged, so PCM timestamps equal the AU timestamps that
//   produced them.
//
// FfmpegEncoder — PCM → AAC-LC. Decoded audio arrives in arbitrary chunk
//   sizes but AAC wants exactly `frame_size` (typically 1024) samples per
//   input frame, so everything is resampled to planar float at the output
//   rate and drained through a plane FIFO. Full frames are popped from the
//   front with a sample-counter PTS; at EOS the tail is zero-padded and
//   flushed so no PCM is lost. Output packet timestamps are therefore
//   continuous across splice input boundaries by construction.
//
// `SendStatus::Full` maps EAGAIN: the caller drains output and retries.

use std::collections::VecDeque;
use std::path::Path;

use ffmpeg_the_third as ffmpeg;
use ffmpeg::codec::{self, Id as CodecId};
use ffmpeg::encoder;
use ffmpeg::format::sample::Type as SampleType;
use ffmpeg::format::Sample;
use ffmpeg::software::resampling;
use ffmpeg::util::channel_layout::{ChannelLayout, ChannelLayoutMask};
use ffmpeg::util::frame::audio::Audio as AudioFrame;
use ffmpeg::util::rational::Rational;

use tonecut_core::backend::{AudioDecoder, AudioEncoder, DecoderEvent, EncoderEvent, SendStatus};
use tonecut_core::media_types::{AccessUnit, AuFlags, EncoderConfig, PcmFrame, TrackFormat};
use tonecut_core::AudioError;

/// Encoded-output backlog the encoder tolerates before reporting `Full`.
const PENDING_OUT_CAP: usize = 64;

const INTERCHANGE_FORMAT: Sample = Sample::I16(SampleType::Packed);

fn layout_mask(channels: u16) -> Result<ChannelLayoutMask, AudioError> {
    match channels {
        1 => Ok(ChannelLayoutMask::MONO),
        2 => Ok(ChannelLayoutMask::STEREO),
        n => Err(AudioError::Codec(format!("unsupported channel count {n}"))),
    }
}

fn layout(channels: u16) -> Result<ChannelLayout<'static>, AudioError> {
    match channels {
        1 => Ok(ChannelLayout::MONO),
        2 => Ok(ChannelLayout::STEREO),
        n => Err(AudioError::Codec(format!("unsupported channel count {n}"))),
    }
}

/// Encoder-timebase (1/rate) packet PTS to microseconds.
fn samples_to_us(samples: i64, rate: u32) -> i64 {
    (samples as i128 * 1_000_000 / rate.max(1) as i128) as i64
}

// ── Decoder ───────────────────────────────────────────────────────────────────

pub struct FfmpegDecoder {
    decoder: ffmpeg::decoder::Audio,
    resampler: Option<resampling::Context>,
    out_rate: u32,
    out_channels: u16,
    pending: VecDeque<PcmFrame>,
    last_pts_us: i64,
    eos_queued: bool,
    drained: bool,
    eos_emitted: bool,
}

impl FfmpegDecoder {
    /// Build a decoder for `stream_index` of `path`.
    ///
    /// Opens a second input context for the codec parameters — `Parameters`
    /// borrows from the stream, and the demuxer owns the first context.
    pub fn open(path: &Path, stream_index: usize) -> Result<Self, AudioError> {
        let ictx = ffmpeg::format::input(&path)
            .map_err(|e| AudioError::io(path, e.to_string()))?;
        let stream = ictx
            .stream(stream_index)
            .ok_or_else(|| AudioError::Codec(format!("stream {stream_index} gone")))?;
        let ctx = codec::context::Context::from_parameters(stream.parameters())
            .map_err(|e| AudioError::Codec(format!("decoder context: {e}")))?;
        let decoder = ctx
            .decoder()
            .audio()
            .map_err(|e| AudioError::Codec(format!("open audio decoder: {e}")))?;

        let out_rate = decoder.rate();
        let out_channels = (decoder.ch_layout().channels().max(1) as u16).min(2);

        Ok(Self {
            decoder,
            resampler: None,
            out_rate,
            out_channels,
            pending: VecDeque::new(),
            last_pts_us: 0,
            eos_queued: false,
            drained: false,
            eos_emitted: false,
        })
    }

    /// Move everything the decoder currently holds into `pending`.
    fn pull_frames(&mut self) -> Result<(), AudioError> {
        let mut decoded = AudioFrame::empty();
        loop {
            match self.decoder.receive_frame(&mut decoded) {
                Ok(()) => {
                    let frame = self.convert(&decoded)?;
                    self.last_pts_us = frame.pts_us + frame.duration_us();
                    self.pending.push_back(frame);
                }
                Err(ffmpeg::Error::Other { errno }) if errno == libc::EAGAIN => break,
                Err(ffmpeg::Error::Eof) => {
                    self.drained = true;
                    break;
                }
                Err(e) => return Err(AudioError::Codec(format!("decoder receive: {e}"))),
            }
        }
        Ok(())
    }

    /// Convert one decoded frame to the s16le interchange layout, downmixing
    /// anything beyond stereo.
    fn convert(&mut self, decoded: &AudioFrame) -> Result<PcmFrame, AudioError> {
        let pts_us = decoded.pts().unwrap_or(self.last_pts_us);
        let src_channels = decoded.ch_layout().channels().max(1) as u16;
        let needs_resample =
            decoded.format() != INTERCHANGE_FORMAT || src_channels != self.out_channels;

        let data = if needs_resample {
            // Built lazily on the first frame so the real input format is
            // known before the SwrContext exists.
            if self.resampler.is_none() {
                let src_layout = if src_channels >= 2 {
                    decoded.ch_layout()
                } else {
                    ChannelLayout::MONO
                };
                let rs = resampling::Context::get2(
                    decoded.format(),
                    src_layout,
                    decoded.rate(),
                    INTERCHANGE_FORMAT,
                    layout(self.out_channels)?,
                    self.out_rate,
                )
                .map_err(|e| AudioError::Codec(format!("create pcm converter: {e}")))?;
                self.resampler = Some(rs);
            }
            let Some(rs) = self.resampler.as_mut() else {
                return Err(AudioError::Codec("pcm converter missing".into()));
            };
            let mut converted = AudioFrame::empty();
            rs.run(decoded, &mut converted)
                .map_err(|e| AudioError::Codec(format!("convert pcm: {e}")))?;
            let n = converted.samples() * self.out_channels as usize * 2;
            converted.data(0)[..n].to_vec()
        } else {
            let n = decoded.samples() * self.out_channels as usize * 2;
            decoded.data(0)[..n].to_vec()
        };

        Ok(PcmFrame {
            data,
            rate: self.out_rate,
            channels: self.out_channels,
            pts_us,
            is_eos: false,
        })
    }
}

impl AudioDecoder for FfmpegDecoder {
    fn output_rate(&self) -> u32 {
        self.out_rate
    }

    fn output_channels(&self) -> u16 {
        self.out_channels
    }

    fn try_send(&mut self, au: &AccessUnit) -> Result<SendStatus, AudioError> {
        self.pull_frames()?;

        let mut packet = ffmpeg::Packet::copy(&au.data);
        packet.set_pts(Some(au.pts_us));
        packet.set_dts(Some(au.pts_us));

        match self.decoder.send_packet(&packet) {
            Ok(()) => Ok(SendStatus::Accepted),
            Err(ffmpeg::Error::Other { errno }) if errno == libc::EAGAIN => {
                Ok(SendStatus::Full)
            }
            // Seek pre-roll can hand the decoder a packet it can't use yet;
            // skipping it is harmless, aborting the run is not.
            Err(ffmpeg::Error::InvalidData) => {
                log::debug!("decoder skipped invalid packet at {} µs", au.pts_us);
                Ok(SendStatus::Accepted)
            }
            Err(e) => Err(AudioError::Codec(format!("decoder send: {e}"))),
        }
    }

    fn send_eos(&mut self) -> Result<SendStatus, AudioError> {
        if self.eos_queued {
            return Ok(SendStatus::Accepted);
        }
        self.pull_frames()?;
        match self.decoder.send_eof() {
            Ok(()) => {}
            Err(ffmpeg::Error::Other { errno }) if errno == libc::EAGAIN => {
                return Ok(SendStatus::Full);
            }
            Err(ffmpeg::Error::Eof) => {}
            Err(e) => return Err(AudioError::Codec(format!("decoder send eof: {e}"))),
        }
        self.eos_queued = true;
        Ok(SendStatus::Accepted)
    }

    fn try_receive(&mut self) -> Result<DecoderEvent, AudioError> {
        self.pull_frames()?;
        if let Some(frame) = self.pending.pop_front() {
            return Ok(DecoderEvent::Pcm(frame));
        }
        if self.eos_queued && self.drained && !self.eos_emitted {
            self.eos_emitted = true;
            return Ok(DecoderEvent::Pcm(PcmFrame {
                data: Vec::new(),
                rate: self.out_rate,
                channels: self.out_channels,
                pts_us: self.last_pts_us,
                is_eos: true,
            }));
        }
        Ok(DecoderEvent::Empty)
    }
}

// ── Plane FIFO ────────────────────────────────────────────────────────────────

/// Planar-float sample FIFO feeding the AAC encoder.
///
/// Left channel samples are in `left`; right in `right`. Mono configurations
/// leave `right` empty. The FIFO exists because decoded chunks have arbitrary
/// sizes and AAC input frames do not.
#[derive(Debug, Default)]
struct PlaneFifo {
    left: Vec<f32>,
    right: Vec<f32>,
    stereo: bool,
}

impl PlaneFifo {
    fn new(stereo: bool) -> Self {
        Self { left: Vec::new(), right: Vec::new(), stereo }
    }

    /// Samples buffered per channel.
    fn len(&self) -> usize {
        self.left.len()
    }

    fn push(&mut self, left: &[f32], right: Option<&[f32]>) {
        self.left.extend_from_slice(left);
        if self.stereo {
            // A missing right plane means a mono source: duplicate it.
            self.right.extend_from_slice(right.unwrap_or(left));
        }
    }

    /// Pop `n` samples per channel from the front. A short tail is
    /// zero-padded — used only for the final flush frame so the encoder
    /// receives a full fixed-size input.
    fn pop(&mut self, n: usize) -> (Vec<f32>, Vec<f32>) {
        let available = self.left.len().min(n);
        let mut left = vec![0.0f32; n];
        left[..available].copy_from_slice(&self.left[..available]);
        self.left.drain(..available);

        let mut right = Vec::new();
        if self.stereo {
            right = vec![0.0f32; n];
            right[..available].copy_from_slice(&self.right[..available]);
            self.right.drain(..available);
        }
        (left, right)
    }
}

// ── Encoder ───────────────────────────────────────────────────────────────────

pub struct FfmpegEncoder {
    encoder: ffmpeg::encoder::Audio,
    cfg: EncoderConfig,
    /// AAC frame size in samples (typically 1024).
    frame_size: usize,
    fifo: PlaneFifo,
    resampler: Option<resampling::Context>,
    /// (rate, channels) the current resampler was built for.
    swr_src: Option<(u32, u16)>,
    /// Next input frame's PTS in samples (encoder timebase = 1/rate).
    next_pts: i64,
    pending_out: VecDeque<AccessUnit>,
    format_pending: Option<TrackFormat>,
    eos_sent: bool,
    flushed: bool,
    eos_emitted: bool,
}

impl FfmpegEncoder {
    pub fn new(input: &TrackFormat, cfg: EncoderConfig) -> Result<Self, AudioError> {
        let aac = encoder::find(CodecId::AAC)
            .ok_or_else(|| AudioError::Codec("AAC encoder not found".into()))?;

        let ctx = codec::context::Context::new_with_codec(aac);
        let mut audio = ctx
            .encoder()
            .audio()
            .map_err(|e| AudioError::Codec(format!("create AAC encoder context: {e}")))?;

        audio.set_rate(cfg.sample_rate as i32);
        audio.set_ch_layout(layout(cfg.channels)?);
        audio.set_format(Sample::F32(SampleType::Planar));
        audio.set_bit_rate(cfg.bit_rate as usize);
        audio.set_time_base(Rational::new(1, cfg.sample_rate as i32));

        let opened = audio
            .open_as_with(aac, ffmpeg::Dictionary::new())
            .map_err(|e| AudioError::Codec(format!("open AAC encoder: {e}")))?;

        // Guard against a codec that reports 0 (shouldn't happen with AAC).
        let frame_size = (opened.frame_size() as usize).max(1024);

        // The muxer needs the AudioSpecificConfig the opened encoder wrote
        // into its extradata; no safe accessor exists.
        let codec_specific_data = unsafe {
            let ptr = opened.as_ptr();
            let size = (*ptr).extradata_size as usize;
            (size > 0 && !(*ptr).extradata.is_null())
                .then(|| std::slice::from_raw_parts((*ptr).extradata, size).to_vec())
        };

        let output_format = TrackFormat {
            mime: "audio/mp4a-latm".into(),
            sample_rate: cfg.sample_rate,
            channels: cfg.channels,
            bit_rate: Some(cfg.bit_rate as u64),
            duration_us: None,
            codec_specific_data,
        };

        let mut enc = Self {
            encoder: opened,
            cfg,
            frame_size,
            fifo: PlaneFifo::new(cfg.channels == 2),
            resampler: None,
            swr_src: None,
            next_pts: 0,
            pending_out: VecDeque::new(),
            format_pending: Some(output_format),
            eos_sent: false,
            flushed: false,
            eos_emitted: false,
        };

        // Pre-build the converter for the announced input format; it is
        // rebuilt transparently if a splice input arrives with another one.
        if input.sample_rate > 0 && input.channels > 0 {
            enc.ensure_resampler(input.sample_rate, input.channels.min(2))?;
        }
        Ok(enc)
    }

    /// Input-equivalent bytes currently buffered, measured against the
    /// configured input budget.
    fn buffered_input_bytes(&self) -> usize {
        self.fifo.len() * 2 * self.cfg.channels as usize
    }

    /// Make sure the input converter matches `(rate, channels)`, rebuilding
    /// it when a splice input arrives in a different source format. The old
    /// converter's buffered tail is flushed into the FIFO first so no
    /// samples are lost at the boundary.
    fn ensure_resampler(&mut self, rate: u32, channels: u16) -> Result<(), AudioError> {
        if self.swr_src == Some((rate, channels)) && self.resampler.is_some() {
            return Ok(());
        }
        if let Some(rs) = self.resampler.as_mut() {
            loop {
                let mut tail = AudioFrame::empty();
                match rs.flush(&mut tail) {
                    Ok(_) if tail.samples() > 0 => push_planes(&mut self.fifo, &tail),
                    Ok(_) => break,
                    Err(e) => {
                        return Err(AudioError::Codec(format!("flush resampler: {e}")))
                    }
                }
            }
        }
        let rs = resampling::Context::get2(
            INTERCHANGE_FORMAT,
            layout(channels)?,
            rate,
            Sample::F32(SampleType::Planar),
            layout(self.cfg.channels)?,
            self.cfg.sample_rate,
        )
        .map_err(|e| AudioError::Codec(format!("create input converter: {e}")))?;
        self.resampler = Some(rs);
        self.swr_src = Some((rate, channels));
        Ok(())
    }

    /// Encode every full frame buffered in the FIFO.
    fn encode_ready(&mut self) -> Result<(), AudioError> {
        while self.fifo.len() >= self.frame_size {
            self.encode_one(self.frame_size)?;
        }
        Ok(())
    }

    /// Pop `n` samples, wrap them in a planar-float frame and hand it to the
    /// encoder, draining packets as they appear.
    fn encode_one(&mut self, n: usize) -> Result<(), AudioError> {
        let (left, right) = self.fifo.pop(n);
        let mut frame = AudioFrame::new(
            Sample::F32(SampleType::Planar),
            n,
            layout_mask(self.cfg.channels)?,
        );
        frame.set_rate(self.cfg.sample_rate);
        frame.set_pts(Some(self.next_pts));
        unsafe {
            let ldata = frame.data_mut(0);
            let ldst = std::slice::from_raw_parts_mut(ldata.as_mut_ptr() as *mut f32, n);
            ldst.copy_from_slice(&left);
            if self.cfg.channels == 2 {
                let rdata = frame.data_mut(1);
                let rdst = std::slice::from_raw_parts_mut(rdata.as_mut_ptr() as *mut f32, n);
                rdst.copy_from_slice(&right);
            }
        }
        self.next_pts += n as i64;

        loop {
            match self.encoder.send_frame(&frame) {
                Ok(()) => break,
                Err(ffmpeg::Error::Other { errno }) if errno == libc::EAGAIN => {
                    self.drain_packets()?;
                }
                Err(e) => return Err(AudioError::Codec(format!("encoder send: {e}"))),
            }
        }
        self.drain_packets()
    }

    fn drain_packets(&mut self) -> Result<(), AudioError> {
        let mut pkt = ffmpeg::Packet::empty();
        loop {
            match self.encoder.receive_packet(&mut pkt) {
                Ok(()) => {
                    let pts = pkt.pts().unwrap_or(0);
                    self.pending_out.push_back(AccessUnit {
                        data: pkt.data().map(|d| d.to_vec()).unwrap_or_default(),
                        pts_us: samples_to_us(pts, self.cfg.sample_rate),
                        flags: AuFlags { is_sync: true, is_eos: false },
                    });
                }
                Err(ffmpeg::Error::Other { errno }) if errno == libc::EAGAIN => break,
                Err(ffmpeg::Error::Eof) => {
                    self.flushed = true;
                    break;
                }
                Err(e) => return Err(AudioError::Codec(format!("encoder receive: {e}"))),
            }
        }
        Ok(())
    }
}

impl AudioEncoder for FfmpegEncoder {
    fn config(&self) -> &EncoderConfig {
        &self.cfg
    }

    fn try_send(&mut self, pcm: &PcmFrame) -> Result<SendStatus, AudioError> {
        if self.eos_sent {
            return Err(AudioError::Codec("encoder input after EOS".into()));
        }
        if self.pending_out.len() >= PENDING_OUT_CAP {
            return Ok(SendStatus::Full);
        }
        if self.buffered_input_bytes() > self.cfg.max_input_size {
            self.encode_ready()?;
            if self.buffered_input_bytes() > self.cfg.max_input_size {
                return Ok(SendStatus::Full);
            }
        }

        let samples = pcm.sample_count();
        if samples == 0 {
            return Ok(SendStatus::Accepted);
        }
        let src_channels = pcm.channels.min(2).max(1);
        self.ensure_resampler(pcm.rate, src_channels)?;

        // Wrap the interleaved s16 bytes in a frame for the converter.
        let mut input = AudioFrame::new(INTERCHANGE_FORMAT, samples, layout_mask(src_channels)?);
        input.set_rate(pcm.rate);
        let byte_len = samples * src_channels as usize * 2;
        input.data_mut(0)[..byte_len].copy_from_slice(&pcm.data[..byte_len]);

        let Some(rs) = self.resampler.as_mut() else {
            return Err(AudioError::Codec("input converter missing".into()));
        };
        let mut converted = AudioFrame::empty();
        rs.run(&input, &mut converted)
            .map_err(|e| AudioError::Codec(format!("resample pcm: {e}")))?;
        push_planes(&mut self.fifo, &converted);

        self.encode_ready()?;
        Ok(SendStatus::Accepted)
    }

    fn send_eos(&mut self) -> Result<SendStatus, AudioError> {
        if self.eos_sent {
            return Ok(SendStatus::Accepted);
        }

        // Flush the rate converter's buffered tail into the FIFO.
        if let Some(rs) = self.resampler.as_mut() {
            loop {
                let mut tail = AudioFrame::empty();
                match rs.flush(&mut tail) {
                    Ok(_) if tail.samples() > 0 => push_planes(&mut self.fifo, &tail),
                    Ok(_) => break,
                    Err(e) => {
                        return Err(AudioError::Codec(format!("flush resampler: {e}")))
                    }
                }
            }
        }

        // Encode full frames, then the zero-padded partial tail.
        self.encode_ready()?;
        if self.fifo.len() > 0 {
            self.encode_one(self.frame_size)?;
        }

        loop {
            match self.encoder.send_eof() {
                Ok(()) => break,
                Err(ffmpeg::Error::Other { errno }) if errno == libc::EAGAIN => {
                    self.drain_packets()?;
                }
                Err(ffmpeg::Error::Eof) => break,
                Err(e) => return Err(AudioError::Codec(format!("encoder send eof: {e}"))),
            }
        }
        self.eos_sent = true;
        self.drain_packets()?;
        Ok(SendStatus::Accepted)
    }

    fn try_receive(&mut self) -> Result<EncoderEvent, AudioError> {
        if let Some(format) = self.format_pending.take() {
            return Ok(EncoderEvent::FormatChanged(format));
        }
        if self.eos_sent && !self.flushed {
            self.drain_packets()?;
        }
        if let Some(au) = self.pending_out.pop_front() {
            return Ok(EncoderEvent::Packet(au));
        }
        if self.eos_sent && self.flushed && !self.eos_emitted {
            self.eos_emitted = true;
            return Ok(EncoderEvent::Packet(AccessUnit {
                data: Vec::new(),
                pts_us: samples_to_us(self.next_pts, self.cfg.sample_rate),
                flags: AuFlags { is_sync: false, is_eos: true },
            }));
        }
        Ok(EncoderEvent::Empty)
    }
}

/// Append a planar-float frame's planes to the FIFO (mono sources fill both
/// output channels).
fn push_planes(fifo: &mut PlaneFifo, frame: &AudioFrame) {
    let n = frame.samples();
    if n == 0 {
        return;
    }
    unsafe {
        let left =
            std::slice::from_raw_parts(frame.data(0).as_ptr() as *const f32, n);
        let right = (frame.ch_layout().channels() >= 2).then(|| {
            std::slice::from_raw_parts(frame.data(1).as_ptr() as *const f32, n)
        });
        fifo.push(left, right);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_pops_in_order_across_pushes() {
        let mut fifo = PlaneFifo::new(true);
        fifo.push(&[1.0, 2.0], Some(&[-1.0, -2.0]));
        fifo.push(&[3.0], Some(&[-3.0]));
        assert_eq!(fifo.len(), 3);
        let (l, r) = fifo.pop(2);
        assert_eq!(l, vec![1.0, 2.0]);
        assert_eq!(r, vec![-1.0, -2.0]);
        assert_eq!(fifo.len(), 1);
    }

    #[test]
    fn fifo_zero_pads_short_tail() {
        let mut fifo = PlaneFifo::new(true);
        fifo.push(&[1.0], Some(&[2.0]));
        let (l, r) = fifo.pop(4);
        assert_eq!(l, vec![1.0, 0.0, 0.0, 0.0]);
        assert_eq!(r, vec![2.0, 0.0, 0.0, 0.0]);
        assert_eq!(fifo.len(), 0);
    }

    #[test]
    fn fifo_duplicates_mono_into_stereo() {
        let mut fifo = PlaneFifo::new(true);
        fifo.push(&[0.5, -0.5], None);
        let (l, r) = fifo.pop(2);
        assert_eq!(l, r);
    }

    #[test]
    fn mono_fifo_ignores_right_plane() {
        let mut fifo = PlaneFifo::new(false);
        fifo.push(&[0.25], Some(&[0.75]));
        let (l, r) = fifo.pop(1);
        assert_eq!(l, vec![0.25]);
        assert!(r.is_empty());
    }

    #[test]
    fn sample_counter_pts_converts_to_us() {
        assert_eq!(samples_to_us(0, 44_100), 0);
        assert_eq!(samples_to_us(44_100, 44_100), 1_000_000);
        assert_eq!(samples_to_us(1024, 44_100), 23_219);
        assert_eq!(samples_to_us(48_000 * 3, 48_000), 3_000_000);
    }

    #[test]
    fn layout_rejects_beyond_stereo() {
        assert!(layout(1).is_ok());
        assert!(layout(2).is_ok());
        assert!(layout(6).is_err());
        assert!(layout_mask(0).is_err());
    }
}
