// crates/tonecut-core/src/copy.rs
//
// Lossless stream copy: demux → (time-range gate) → mux. No codec anywhere —
// the compressed elementary stream is written unchanged into the new
// container, with timestamps rebased so the output starts at zero and
// `is_sync` flags preserved. Routing is the caller's job: only AAC-family
// inputs reach this path, everything else falls back to the transcode
// pipeline.

use crate::backend::{Demuxer, Muxer, TrackId};
use crate::error::AudioError;
use crate::gate::{GateDecision, TimeRangeGate};
use crate::media_types::{CancelToken, TimeRange, TrackFormat};
use crate::progress::ProgressTracker;

#[derive(Debug, Clone, Copy, Default)]
pub struct CopyStats {
    pub samples_written: u64,
    pub bytes_written: u64,
    pub last_written_us: i64,
    pub muxer_started: bool,
}

impl CopyStats {
    /// Duration of the written stream, assuming the last AU spans one frame.
    pub fn duration_us(&self, frame_duration_us: i64) -> i64 {
        if self.samples_written == 0 {
            0
        } else {
            self.last_written_us + frame_duration_us
        }
    }
}

/// Copy the selected track of `demuxer` into `muxer`.
///
/// Unlike the transcode path there is no encoder to announce an output
/// format: the demuxer-reported `format` (which carries the codec specific
/// data) registers the track, and the muxer starts before the first sample.
pub fn run_copy<D, M>(
    demuxer: &mut D,
    muxer: &mut M,
    format: &TrackFormat,
    range: Option<TimeRange>,
    cancel: &CancelToken,
    progress: &mut ProgressTracker<'_>,
) -> Result<CopyStats, AudioError>
where
    D: Demuxer,
    M: Muxer,
{
    let expected_us = range
        .map(|r| r.span_us())
        .or(format.duration_us)
        .unwrap_or(0)
        .max(1);
    let range_start = range.map(|r| r.start_us).unwrap_or(0);
    let mut gate = range.map(TimeRangeGate::new);

    let track: TrackId = muxer.add_track(format)?;
    muxer.start()?;

    let mut stats = CopyStats { muxer_started: true, ..Default::default() };

    while let Some(mut au) = demuxer.next()? {
        if cancel.is_cancelled() {
            return Err(AudioError::Cancelled);
        }
        let raw_ts = au.pts_us;

        if let Some(gate) = &mut gate {
            match gate.admit(raw_ts) {
                GateDecision::Skip => continue,
                GateDecision::End => break,
                GateDecision::Pass(rebased) => au.pts_us = rebased,
            }
        }

        muxer.write_sample(track, &au)?;
        stats.samples_written += 1;
        stats.bytes_written += au.size() as u64;
        stats.last_written_us = au.pts_us;

        progress.report((raw_ts - range_start).max(0) as f32 / expected_us as f32);
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::*;
    use crate::backend::{Demuxer as _, Muxer as _};
    use crate::progress::{OperationTag, ProgressEvent};

    const FRAME_US: i64 = 23_220; // 1024 samples at 44.1 kHz

    fn aac_track(duration_us: i64) -> TrackFormat {
        TrackFormat {
            mime: "audio/mp4a-latm".into(),
            sample_rate: 44_100,
            channels: 2,
            bit_rate: Some(128_000),
            duration_us: Some(duration_us),
            codec_specific_data: Some(vec![0x12, 0x10]),
        }
    }

    #[test]
    fn full_copy_preserves_every_sample() {
        let track = aac_track(100 * FRAME_US);
        let mut demuxer = FakeDemuxer::new(track.clone(), synthetic_aus(100, FRAME_US, 0xaa));
        demuxer.select(0).unwrap();
        let mut muxer = FakeMuxer::new();
        let mut seen = Vec::new();
        let mut sink = |e: ProgressEvent| seen.push(e);
        let mut progress = ProgressTracker::new(OperationTag::TrimLossless, &mut sink);

        let stats = run_copy(
            &mut demuxer,
            &mut muxer,
            &track,
            None,
            &CancelToken::new(),
            &mut progress,
        )
        .unwrap();

        assert_eq!(stats.samples_written, 100);
        assert_eq!(muxer.samples.len(), 100);
        assert_eq!(muxer.written_bytes() as u64, stats.bytes_written);
        // Track registered from the demuxer-reported format, csd included.
        assert!(muxer.track_format.as_ref().unwrap().codec_specific_data.is_some());
    }

    #[test]
    fn ranged_copy_rebases_and_cuts() {
        let track = aac_track(1000 * FRAME_US);
        let mut demuxer = FakeDemuxer::new(track.clone(), synthetic_aus(1000, FRAME_US, 0));
        demuxer.select(0).unwrap();
        let range = TimeRange { start_us: 5_000_000, end_us: 15_000_000 };
        let landing = demuxer.seek_to_sync(range.start_us).unwrap();
        assert!(landing <= range.start_us);

        let mut muxer = FakeMuxer::new();
        let mut seen = Vec::new();
        let mut sink = |e: ProgressEvent| seen.push(e);
        let mut progress = ProgressTracker::new(OperationTag::TrimLossless, &mut sink);

        let stats = run_copy(
            &mut demuxer,
            &mut muxer,
            &track,
            Some(range),
            &CancelToken::new(),
            &mut progress,
        )
        .unwrap();

        assert_eq!(muxer.samples.first().unwrap().pts_us, 0);
        assert!(stats.last_written_us <= range.span_us() + FRAME_US);
        let duration = stats.duration_us(FRAME_US);
        assert!((duration - range.span_us()).abs() <= 2 * FRAME_US);
    }

    #[test]
    fn cancel_aborts_mid_copy() {
        let track = aac_track(50 * FRAME_US);
        let mut demuxer = FakeDemuxer::new(track.clone(), synthetic_aus(50, FRAME_US, 0));
        demuxer.select(0).unwrap();
        let mut muxer = FakeMuxer::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut seen = Vec::new();
        let mut sink = |e: ProgressEvent| seen.push(e);
        let mut progress = ProgressTracker::new(OperationTag::TrimLossless, &mut sink);

        let err = run_copy(&mut demuxer, &mut muxer, &track, None, &cancel, &mut progress)
            .unwrap_err();
        assert!(matches!(err, AudioError::Cancelled));
    }
}
