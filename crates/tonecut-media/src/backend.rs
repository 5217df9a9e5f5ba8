// crates/tonecut-media/src/backend.rs
//
// FfmpegBackend: ties the FFmpeg stage implementations to the core Backend
// trait so the engines in tonecut-core can run against real media.

use std::path::Path;
use std::sync::Once;

use ffmpeg_the_third as ffmpeg;

use tonecut_core::backend::Backend;
use tonecut_core::media_types::{EncoderConfig, TrackFormat};
use tonecut_core::AudioError;

use crate::codec::{FfmpegDecoder, FfmpegEncoder};
use crate::demux::FfmpegDemuxer;
use crate::mux::FfmpegMuxer;

static FFMPEG_INIT: Once = Once::new();

#[derive(Clone, Copy, Default)]
pub struct FfmpegBackend;

impl FfmpegBackend {
    pub fn new() -> Self {
        FFMPEG_INIT.call_once(|| {
            if let Err(e) = ffmpeg::init() {
                log::error!("ffmpeg init failed: {e}");
            }
        });
        Self
    }
}

impl Backend for FfmpegBackend {
    type Demuxer = FfmpegDemuxer;
    type Decoder = FfmpegDecoder;
    type Encoder = FfmpegEncoder;
    type Muxer = FfmpegMuxer;

    fn open_demuxer(&self, path: &Path) -> Result<FfmpegDemuxer, AudioError> {
        FfmpegDemuxer::open(path)
    }

    fn new_decoder(&self, demuxer: &FfmpegDemuxer) -> Result<FfmpegDecoder, AudioError> {
        let index = demuxer
            .selected_index()
            .ok_or_else(|| AudioError::Codec("no track selected".into()))?;
        FfmpegDecoder::open(demuxer.path(), index)
    }

    fn new_encoder(
        &self,
        input: &TrackFormat,
        config: EncoderConfig,
    ) -> Result<FfmpegEncoder, AudioError> {
        FfmpegEncoder::new(input, config)
    }

    fn create_muxer(&self, path: &Path) -> Result<FfmpegMuxer, AudioError> {
        FfmpegMuxer::create(path)
    }
}
