// crates/tonecut-core/src/splice.rs
//
// Splice orchestrator: drive the transcode loop across an ordered list of
// inputs that share one encoder and one muxer. A fresh demuxer + decoder pair
// is created per input because source codecs may differ; the shared encoder
// keeps its FIFO tail across input boundaries so the output is gapless.
//
// Timestamp discipline: every PCM frame handed to the encoder carries
// `cumulative_offset_us`, which after each input moves to one frame past that
// input's last emitted timestamp — strictly beyond it, so timestamps written
// to the muxer never decrease across a boundary.

use std::path::{Path, PathBuf};

use crate::backend::{find_audio_track, AudioEncoder, Backend, Demuxer};
use crate::error::AudioError;
use crate::media_types::CancelToken;
use crate::pipeline::{SinkState, TranscodeLoop, TranscodeParams, TranscodeStats};
use crate::progress::ProgressTracker;

#[derive(Debug)]
pub struct SpliceStats {
    pub files_processed: u32,
    pub sink: SinkState,
}

pub fn run_splice<B: Backend>(
    backend: &B,
    inputs: &[PathBuf],
    encoder: &mut B::Encoder,
    muxer: &mut B::Muxer,
    cancel: &CancelToken,
    progress: &mut ProgressTracker<'_>,
) -> Result<SpliceStats, AudioError> {
    if inputs.is_empty() {
        return Err(AudioError::InvalidArguments("splice needs at least one input".into()));
    }

    let n = inputs.len();
    let frame_us = encoder.config().frame_duration_us();
    let mut sink = SinkState::new();
    let mut cumulative_offset_us: i64 = 0;

    for (i, path) in inputs.iter().enumerate() {
        let is_last = i + 1 == n;
        progress.set_window(i as f32 / n as f32, 1.0 / n as f32);

        let stats = splice_one(
            backend,
            path,
            encoder,
            muxer,
            &mut sink,
            cumulative_offset_us,
            is_last,
            cancel,
            progress,
        )?;

        log::debug!(
            "spliced {} ({} of {n}) — last encoder input {} µs",
            path.display(),
            i + 1,
            stats.last_encoder_input_us
        );

        if !is_last {
            // One frame past the last emitted timestamp, so the next input's
            // first sample lands strictly after everything written so far.
            cumulative_offset_us = stats.last_encoder_input_us + frame_us;
        }
    }

    Ok(SpliceStats { files_processed: n as u32, sink })
}

#[allow(clippy::too_many_arguments)]
fn splice_one<B: Backend>(
    backend: &B,
    path: &Path,
    encoder: &mut B::Encoder,
    muxer: &mut B::Muxer,
    sink: &mut SinkState,
    ts_offset_us: i64,
    is_last: bool,
    cancel: &CancelToken,
    progress: &mut ProgressTracker<'_>,
) -> Result<TranscodeStats, AudioError> {
    let mut demuxer = backend.open_demuxer(path)?;
    let track_index = find_audio_track(demuxer.tracks()).ok_or_else(|| {
        AudioError::UnsupportedFormat(format!("no audio track in '{}'", path.display()))
    })?;
    demuxer.select(track_index)?;
    let duration_us = demuxer.source().duration_us;
    let mut decoder = backend.new_decoder(&demuxer)?;

    let params = TranscodeParams {
        range: None,
        ts_offset_us,
        finalize_encoder: is_last,
        expected_duration_us: duration_us,
    };

    TranscodeLoop::new(
        &mut demuxer,
        &mut decoder,
        encoder,
        muxer,
        sink,
        params,
        cancel.clone(),
    )
    .run(progress)
    // Demuxer and decoder drop here; the shared encoder carries on.
}
