// crates/tonecut-media/src/ops.rs
//
// The public operations: convert, trim, splice, waveform, info. Each one
// validates its arguments before touching the filesystem, wires the FFmpeg
// backend into the matching core engine, and enforces the output
// post-conditions (file exists, size > 0, exactly one terminal progress).
//
// Lossless routing: `format = Copy` runs the remux path only when the input
// elementary stream is AAC-family; anything else silently falls back to the
// transcode pipeline and reports `lossless: false` in the result, so callers
// that cannot pre-classify inputs still get a valid M4A.

use std::path::{Path, PathBuf};

use tonecut_core::backend::{find_audio_track, Backend, Demuxer, Muxer};
use tonecut_core::copy::run_copy;
use tonecut_core::helpers::time::us_to_ms;
use tonecut_core::inspect::{inspect, is_aac_family};
use tonecut_core::media_types::{
    AudioInfo, CancelToken, ConversionResult, EncoderConfig, TimeRange, TrackFormat,
    WaveformEnvelope,
};
use tonecut_core::pipeline::{SinkState, TranscodeLoop, TranscodeParams};
use tonecut_core::splice::run_splice;
use tonecut_core::waveform::run_waveform;
use tonecut_core::{AudioError, OperationTag, ProgressEvent, ProgressTracker};

use crate::backend::FfmpegBackend;

/// The sample rates the encode surface accepts.
pub const SUPPORTED_SAMPLE_RATES: [u32; 9] =
    [8_000, 11_025, 16_000, 22_050, 32_000, 44_100, 48_000, 88_200, 96_000];

/// Accepted AAC bit-rate window, in kbps.
pub const BIT_RATE_KBPS_RANGE: std::ops::RangeInclusive<u32> = 32..=320;

/// Accepted waveform resolution window, in buckets per second.
pub const SAMPLES_PER_SECOND_RANGE: std::ops::RangeInclusive<u32> = 1..=1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Transcode to AAC-LC in an M4A container.
    M4a,
    /// Keep the input elementary stream; AAC-family inputs only, everything
    /// else falls back to `M4a`.
    Copy,
}

pub type ProgressFn<'a> = &'a mut dyn FnMut(ProgressEvent);

// ── Public operations ─────────────────────────────────────────────────────────

pub fn get_audio_info(path: &Path) -> AudioInfo {
    inspect(&FfmpegBackend::new(), path)
}

/// Never fails: any error at all reads as "not supported".
pub fn is_format_supported(path: &Path) -> bool {
    match get_audio_info(path) {
        AudioInfo::Valid(details) => details.capability_flags.convertible,
        AudioInfo::Invalid { .. } => false,
    }
}

pub fn convert_audio(
    input: &Path,
    output: &Path,
    format: OutputFormat,
    bit_rate_kbps: u32,
    sample_rate: u32,
    cancel: &CancelToken,
    progress: ProgressFn<'_>,
) -> Result<ConversionResult, AudioError> {
    validate_encode_args(&[input], output, bit_rate_kbps, sample_rate)?;
    process_one(
        input,
        output,
        format,
        None,
        bit_rate_kbps,
        sample_rate,
        OperationTag::Convert,
        cancel,
        progress,
    )
}

pub fn trim_audio(
    input: &Path,
    output: &Path,
    start_ms: u64,
    end_ms: u64,
    format: OutputFormat,
    bit_rate_kbps: u32,
    sample_rate: u32,
    cancel: &CancelToken,
    progress: ProgressFn<'_>,
) -> Result<ConversionResult, AudioError> {
    validate_encode_args(&[input], output, bit_rate_kbps, sample_rate)?;
    if end_ms <= start_ms {
        return Err(AudioError::InvalidRange(format!(
            "end {end_ms} ms must be after start {start_ms} ms"
        )));
    }
    process_one(
        input,
        output,
        format,
        Some(TimeRange::from_ms(start_ms, end_ms)),
        bit_rate_kbps,
        sample_rate,
        OperationTag::Trim,
        cancel,
        progress,
    )
}

pub fn splice_audio(
    inputs: &[PathBuf],
    output: &Path,
    format: OutputFormat,
    bit_rate_kbps: u32,
    sample_rate: u32,
    cancel: &CancelToken,
    progress: ProgressFn<'_>,
) -> Result<ConversionResult, AudioError> {
    if inputs.is_empty() {
        return Err(AudioError::InvalidArguments("splice needs at least one input".into()));
    }
    let input_refs: Vec<&Path> = inputs.iter().map(PathBuf::as_path).collect();
    validate_encode_args(&input_refs, output, bit_rate_kbps, sample_rate)?;
    if format == OutputFormat::Copy {
        return Err(AudioError::InvalidArguments(
            "splice always re-encodes; format must be m4a".into(),
        ));
    }

    let backend = FfmpegBackend::new();
    ensure_output_dir(output)?;

    // The shared encoder is configured from the first input's track; later
    // inputs in other formats are converted on the way in.
    let first_track = {
        let demuxer = backend.open_demuxer(inputs[0].as_path())?;
        select_audio(&demuxer)?.1
    };
    let config = EncoderConfig::for_input(&first_track, sample_rate, bit_rate_kbps);
    let mut encoder = backend.new_encoder(&first_track, config)?;
    let mut muxer = backend.create_muxer(output)?;
    let mut tracker = ProgressTracker::new(OperationTag::Splice, progress);

    let run_result = run_splice(&backend, inputs, &mut encoder, &mut muxer, cancel, &mut tracker);
    let outcome = run_result.and_then(|stats| {
        muxer.stop()?;
        Ok(stats)
    });

    let stats = match outcome {
        Ok(stats) => stats,
        Err(err) => return Err(fail_output(output, &mut muxer, err)),
    };
    verify_output(output)?;
    tracker.finish();

    Ok(ConversionResult {
        output_path: output.to_path_buf(),
        duration_ms: us_to_ms(stats.sink.duration_us(config.frame_duration_us())),
        bit_rate_kbps,
        sample_rate_hz: config.sample_rate,
        files_processed: stats.files_processed,
        lossless: false,
    })
}

pub fn extract_waveform(
    input: &Path,
    samples_per_second: u32,
    cancel: &CancelToken,
    progress: ProgressFn<'_>,
) -> Result<WaveformEnvelope, AudioError> {
    if input.as_os_str().is_empty() {
        return Err(AudioError::InvalidArguments("input path is empty".into()));
    }
    if !SAMPLES_PER_SECOND_RANGE.contains(&samples_per_second) {
        return Err(AudioError::InvalidArguments(format!(
            "samples_per_second {samples_per_second} outside {SAMPLES_PER_SECOND_RANGE:?}"
        )));
    }

    let backend = FfmpegBackend::new();
    let mut demuxer = backend.open_demuxer(input)?;
    let (track_index, _) = select_audio(&demuxer)?;
    demuxer.select(track_index)?;
    let mut decoder = backend.new_decoder(&demuxer)?;

    let mut tracker = ProgressTracker::new(OperationTag::Waveform, progress);
    let envelope = run_waveform(
        &mut demuxer,
        &mut decoder,
        samples_per_second,
        cancel,
        &mut tracker,
    )?;
    tracker.finish();
    Ok(envelope)
}

// ── Shared single-input flow ──────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
fn process_one(
    input: &Path,
    output: &Path,
    format: OutputFormat,
    range: Option<TimeRange>,
    bit_rate_kbps: u32,
    sample_rate: u32,
    tag: OperationTag,
    cancel: &CancelToken,
    progress: ProgressFn<'_>,
) -> Result<ConversionResult, AudioError> {
    let backend = FfmpegBackend::new();
    ensure_output_dir(output)?;

    let mut demuxer = backend.open_demuxer(input)?;
    let (track_index, track) = select_audio(&demuxer)?;
    demuxer.select(track_index)?;
    let duration_us = demuxer.source().duration_us;

    if let Some(range) = range {
        if duration_us > 0 && range.end_us > duration_us {
            return Err(AudioError::InvalidRange(format!(
                "range ends at {} ms but '{}' is only {} ms long",
                us_to_ms(range.end_us),
                input.display(),
                us_to_ms(duration_us)
            )));
        }
        let landing = demuxer.seek_to_sync(range.start_us)?;
        log::debug!(
            "seek to {} µs landed at {landing} µs ← {}",
            range.start_us,
            input.display()
        );
    }

    let lossless = format == OutputFormat::Copy && is_aac_family(&track.mime);
    if format == OutputFormat::Copy && !lossless {
        log::debug!(
            "lossless copy unsupported for {} — falling back to transcode",
            track.mime
        );
    }

    // The lossless trim keeps its own progress tag; the fallback reports as
    // a plain trim since it re-encodes.
    let tag = match (tag, lossless) {
        (OperationTag::Trim, true) => OperationTag::TrimLossless,
        (tag, _) => tag,
    };
    let mut tracker = ProgressTracker::new(tag, progress);
    let mut muxer = backend.create_muxer(output)?;

    if lossless {
        let run_result = run_copy(&mut demuxer, &mut muxer, &track, range, cancel, &mut tracker);
        let outcome = run_result.and_then(|stats| {
            muxer.stop()?;
            Ok(stats)
        });
        let stats = match outcome {
            Ok(stats) => stats,
            Err(err) => return Err(fail_output(output, &mut muxer, err)),
        };
        verify_output(output)?;
        tracker.finish();

        let frame_us = 1024 * 1_000_000 / track.sample_rate.max(1) as i64;
        return Ok(ConversionResult {
            output_path: output.to_path_buf(),
            duration_ms: us_to_ms(stats.duration_us(frame_us)),
            bit_rate_kbps: (track.bit_rate.unwrap_or(0) / 1000) as u32,
            sample_rate_hz: track.sample_rate,
            files_processed: 1,
            lossless: true,
        });
    }

    let config = EncoderConfig::for_input(&track, sample_rate, bit_rate_kbps);
    let mut decoder = backend.new_decoder(&demuxer)?;
    let mut encoder = backend.new_encoder(&track, config)?;
    let mut sink = SinkState::new();

    let params = TranscodeParams {
        range,
        ts_offset_us: 0,
        finalize_encoder: true,
        expected_duration_us: range.map(|r| r.span_us()).unwrap_or(duration_us).max(1),
    };

    let run_result = TranscodeLoop::new(
        &mut demuxer,
        &mut decoder,
        &mut encoder,
        &mut muxer,
        &mut sink,
        params,
        cancel.clone(),
    )
    .run(&mut tracker);
    let outcome = run_result.and_then(|stats| {
        muxer.stop()?;
        Ok(stats)
    });

    if let Err(err) = outcome {
        return Err(fail_output(output, &mut muxer, err));
    }
    verify_output(output)?;
    tracker.finish();

    Ok(ConversionResult {
        output_path: output.to_path_buf(),
        duration_ms: us_to_ms(sink.duration_us(config.frame_duration_us())),
        bit_rate_kbps,
        sample_rate_hz: config.sample_rate,
        files_processed: 1,
        lossless: false,
    })
}

// ── Validation and output hygiene ─────────────────────────────────────────────

fn validate_encode_args(
    inputs: &[&Path],
    output: &Path,
    bit_rate_kbps: u32,
    sample_rate: u32,
) -> Result<(), AudioError> {
    for input in inputs {
        if input.as_os_str().is_empty() {
            return Err(AudioError::InvalidArguments("input path is empty".into()));
        }
    }
    if output.as_os_str().is_empty() {
        return Err(AudioError::InvalidArguments("output path is empty".into()));
    }
    if !BIT_RATE_KBPS_RANGE.contains(&bit_rate_kbps) {
        return Err(AudioError::InvalidArguments(format!(
            "bit rate {bit_rate_kbps} kbps outside {BIT_RATE_KBPS_RANGE:?}"
        )));
    }
    if !SUPPORTED_SAMPLE_RATES.contains(&sample_rate) {
        return Err(AudioError::InvalidArguments(format!(
            "sample rate {sample_rate} Hz not one of {SUPPORTED_SAMPLE_RATES:?}"
        )));
    }
    Ok(())
}

/// Pick the first audio track and return its index and format.
fn select_audio<D: Demuxer>(demuxer: &D) -> Result<(usize, TrackFormat), AudioError> {
    let index = find_audio_track(demuxer.tracks())
        .ok_or_else(|| AudioError::UnsupportedFormat("no audio track found".into()))?;
    Ok((index, demuxer.tracks()[index].clone()))
}

/// Output directories are created idempotently before any pipeline starts.
fn ensure_output_dir(output: &Path) -> Result<(), AudioError> {
    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AudioError::io(parent, e.to_string()))?;
        }
    }
    Ok(())
}

/// A missing or empty output is an I/O failure no matter how successful the
/// pipeline claimed to be.
fn verify_output(output: &Path) -> Result<(), AudioError> {
    match std::fs::metadata(output) {
        Ok(meta) if meta.len() > 0 => Ok(()),
        Ok(_) => Err(AudioError::io(output, "output file is empty")),
        Err(e) => Err(AudioError::io(output, format!("output missing: {e}"))),
    }
}

/// Error-path cleanup: stop the muxer if it ever started, and remove the
/// partial file on cancellation only — other failures leave it for the
/// caller to examine.
fn fail_output<M: Muxer>(output: &Path, muxer: &mut M, err: AudioError) -> AudioError {
    if let Err(stop_err) = muxer.stop() {
        log::warn!("muxer stop during cleanup: {stop_err}");
    }
    if matches!(err, AudioError::Cancelled) {
        if let Err(rm_err) = std::fs::remove_file(output) {
            if rm_err.kind() != std::io::ErrorKind::NotFound {
                log::warn!("could not remove partial '{}': {rm_err}", output.display());
            }
        }
    }
    err
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_progress() -> impl FnMut(ProgressEvent) {
        |_| {}
    }

    #[test]
    fn convert_rejects_bad_bit_rate_before_io() {
        let mut sink = no_progress();
        // The input path does not exist; an InvalidArguments error proves
        // validation ran before any open.
        let err = convert_audio(
            Path::new("/nonexistent/in.mp3"),
            Path::new("/nonexistent/out.m4a"),
            OutputFormat::M4a,
            512,
            44_100,
            &CancelToken::new(),
            &mut sink,
        )
        .unwrap_err();
        assert!(matches!(err, AudioError::InvalidArguments(_)));
    }

    #[test]
    fn convert_rejects_unsupported_sample_rate() {
        let mut sink = no_progress();
        let err = convert_audio(
            Path::new("/nonexistent/in.mp3"),
            Path::new("/nonexistent/out.m4a"),
            OutputFormat::M4a,
            128,
            44_000,
            &CancelToken::new(),
            &mut sink,
        )
        .unwrap_err();
        assert!(matches!(err, AudioError::InvalidArguments(_)));
    }

    #[test]
    fn trim_rejects_inverted_range_before_io() {
        let mut sink = no_progress();
        let err = trim_audio(
            Path::new("/nonexistent/in.mp3"),
            Path::new("/nonexistent/out.m4a"),
            5_000,
            2_000,
            OutputFormat::M4a,
            128,
            44_100,
            &CancelToken::new(),
            &mut sink,
        )
        .unwrap_err();
        assert!(matches!(err, AudioError::InvalidRange(_)));
    }

    #[test]
    fn splice_rejects_empty_input_list() {
        let mut sink = no_progress();
        let err = splice_audio(
            &[],
            Path::new("/nonexistent/out.m4a"),
            OutputFormat::M4a,
            128,
            44_100,
            &CancelToken::new(),
            &mut sink,
        )
        .unwrap_err();
        assert!(matches!(err, AudioError::InvalidArguments(_)));
    }

    #[test]
    fn splice_rejects_copy_format() {
        let mut sink = no_progress();
        let err = splice_audio(
            &[PathBuf::from("/nonexistent/a.mp3")],
            Path::new("/nonexistent/out.m4a"),
            OutputFormat::Copy,
            128,
            44_100,
            &CancelToken::new(),
            &mut sink,
        )
        .unwrap_err();
        assert!(matches!(err, AudioError::InvalidArguments(_)));
    }

    #[test]
    fn waveform_rejects_out_of_range_resolution() {
        let mut sink = no_progress();
        for sps in [0u32, 1_001] {
            let err = extract_waveform(
                Path::new("/nonexistent/in.mp3"),
                sps,
                &CancelToken::new(),
                &mut sink,
            )
            .unwrap_err();
            assert!(matches!(err, AudioError::InvalidArguments(_)));
        }
    }

    #[test]
    fn unsupported_path_reads_as_not_supported() {
        assert!(!is_format_supported(Path::new("/nonexistent/in.mp3")));
    }

    #[test]
    fn garbage_input_fails_classified_not_panicking() {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("garbage.bin");
        std::fs::write(&input, b"this is not audio at all").unwrap();
        let output = dir.path().join("out.m4a");

        let mut sink = no_progress();
        let err = convert_audio(
            &input,
            &output,
            OutputFormat::M4a,
            128,
            44_100,
            &CancelToken::new(),
            &mut sink,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            AudioError::UnsupportedFormat(_) | AudioError::Io { .. }
        ));

        // The inspector reports the same file as Invalid instead of failing.
        assert!(!get_audio_info(&input).is_valid());
        assert!(!is_format_supported(&input));
    }

    #[test]
    fn info_on_missing_file_is_invalid_not_error() {
        let info = get_audio_info(Path::new("/nonexistent/in.mp3"));
        assert!(!info.is_valid());
    }
}
