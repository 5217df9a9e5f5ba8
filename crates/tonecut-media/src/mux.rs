// crates/tonecut-media/src/mux.rs
//
// FfmpegMuxer: MP4 (ISO BMFF) writer behind the core Muxer trait, carrying a
// single AAC elementary stream. Lifecycle `Created → TrackAdded → Started →
// Stopped`; the header is committed on `start`, the moov index on `stop`.
// `stop` is idempotent and safe on every exit path — it only writes the
// trailer from the Started state.
//
// The track is registered from a plain `TrackFormat` (the encoder's post-open
// format, or the demuxer-reported one on the lossless path). There is no
// codec context to copy parameters from, so codecpar is populated directly;
// the AudioSpecificConfig travels in `codec_specific_data` and must be handed
// to libavformat as extradata or the track is unplayable.

use std::path::{Path, PathBuf};

use ffmpeg_the_third as ffmpeg;
use ffmpeg::codec::Id as CodecId;
use ffmpeg::encoder;
use ffmpeg::util::rational::Rational;

use tonecut_core::backend::{Muxer, MuxerState, TrackId, JITTER_TOLERANCE_US};
use tonecut_core::inspect::is_aac_family;
use tonecut_core::media_types::{AccessUnit, TrackFormat};
use tonecut_core::AudioError;

const US_TIMEBASE: Rational = Rational(1, 1_000_000);

pub struct FfmpegMuxer {
    path: PathBuf,
    octx: ffmpeg::format::context::Output,
    state: MuxerState,
    /// Muxer-assigned stream timebase, captured after the header is written.
    stream_tb: Rational,
    last_pts_us: Option<i64>,
}

impl FfmpegMuxer {
    pub fn create(path: &Path) -> Result<Self, AudioError> {
        let octx = ffmpeg::format::output(&path)
            .map_err(|e| AudioError::io(path, format!("could not open output: {e}")))?;
        Ok(Self {
            path: path.to_path_buf(),
            octx,
            state: MuxerState::Created,
            stream_tb: US_TIMEBASE,
            last_pts_us: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Muxer for FfmpegMuxer {
    fn state(&self) -> MuxerState {
        self.state
    }

    fn add_track(&mut self, format: &TrackFormat) -> Result<TrackId, AudioError> {
        if self.state != MuxerState::Created {
            return Err(AudioError::Muxer("add_track after start".into()));
        }
        if !is_aac_family(&format.mime) {
            return Err(AudioError::Muxer(format!(
                "MP4 output carries AAC only, got {}",
                format.mime
            )));
        }
        if format.sample_rate == 0 || format.channels == 0 {
            return Err(AudioError::Muxer("track format missing rate or channels".into()));
        }

        let aac = encoder::find(CodecId::AAC)
            .ok_or_else(|| AudioError::Muxer("AAC codec unavailable".into()))?;
        let mut stream = self
            .octx
            .add_stream(aac)
            .map_err(|e| AudioError::Muxer(format!("add stream: {e}")))?;
        stream.set_time_base(Rational::new(1, format.sample_rate as i32));
        let index = stream.index();

        // Populate codecpar by hand — there is no codec context to copy from.
        unsafe {
            let par = (**(*self.octx.as_mut_ptr()).streams.add(index)).codecpar;
            (*par).codec_type = ffmpeg::ffi::AVMediaType::AVMEDIA_TYPE_AUDIO;
            (*par).codec_id = ffmpeg::ffi::AVCodecID::AV_CODEC_ID_AAC;
            (*par).sample_rate = format.sample_rate as i32;
            (*par).bit_rate = format.bit_rate.unwrap_or(0) as i64;
            (*par).format = ffmpeg::ffi::AVSampleFormat::AV_SAMPLE_FMT_FLTP as i32;
            (*par).frame_size = 1024;
            ffmpeg::ffi::av_channel_layout_default(
                &mut (*par).ch_layout,
                format.channels as i32,
            );
            if let Some(csd) = &format.codec_specific_data {
                let buf = ffmpeg::ffi::av_mallocz(
                    csd.len() + ffmpeg::ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize,
                ) as *mut u8;
                if buf.is_null() {
                    return Err(AudioError::Muxer("extradata allocation failed".into()));
                }
                std::ptr::copy_nonoverlapping(csd.as_ptr(), buf, csd.len());
                (*par).extradata = buf;
                (*par).extradata_size = csd.len() as i32;
            }
        }

        self.state = MuxerState::TrackAdded;
        Ok(index)
    }

    fn start(&mut self) -> Result<(), AudioError> {
        if self.state != MuxerState::TrackAdded {
            return Err(AudioError::Muxer("start without a track".into()));
        }
        self.octx
            .write_header()
            .map_err(|e| AudioError::Muxer(format!("write header: {e}")))?;
        // The muxer may have replaced the requested timebase.
        if let Some(stream) = self.octx.stream(0) {
            self.stream_tb = stream.time_base();
        }
        self.state = MuxerState::Started;
        Ok(())
    }

    fn write_sample(&mut self, track: TrackId, au: &AccessUnit) -> Result<(), AudioError> {
        if self.state != MuxerState::Started {
            return Err(AudioError::Muxer("write_sample before start".into()));
        }
        if let Some(last) = self.last_pts_us {
            if au.pts_us < last - JITTER_TOLERANCE_US {
                return Err(AudioError::Muxer(format!(
                    "non-monotonic timestamp {} after {last}",
                    au.pts_us
                )));
            }
        }

        let mut packet = ffmpeg::Packet::copy(&au.data);
        packet.set_stream(track);
        packet.set_pts(Some(au.pts_us));
        packet.set_dts(Some(au.pts_us));
        if au.flags.is_sync {
            packet.set_flags(ffmpeg::packet::Flags::KEY);
        }
        packet.rescale_ts(US_TIMEBASE, self.stream_tb);
        packet
            .write_interleaved(&mut self.octx)
            .map_err(|e| AudioError::Muxer(format!("write sample: {e}")))?;

        self.last_pts_us = Some(au.pts_us);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        match self.state {
            MuxerState::Started => {
                self.octx
                    .write_trailer()
                    .map_err(|e| AudioError::Muxer(format!("write trailer: {e}")))?;
                self.state = MuxerState::Stopped;
                Ok(())
            }
            // Stopping a muxer that never started (or already stopped) is a
            // normal cleanup-path call.
            _ => {
                self.state = MuxerState::Stopped;
                Ok(())
            }
        }
    }
}
