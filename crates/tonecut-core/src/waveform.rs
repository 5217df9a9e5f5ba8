// crates/tonecut-core/src/waveform.rs
//
// Waveform extraction: demux → decode → fold PCM into a fixed-rate peak
// envelope. No encoder, no muxer. The reducer is a pure fold over 16-bit
// little-endian interleaved samples so it tests without any backend.

use crate::backend::{AudioDecoder, DecoderEvent, Demuxer, SendStatus};
use crate::error::AudioError;
use crate::helpers::time::us_to_ms;
use crate::media_types::{AccessUnit, CancelToken, WaveformEnvelope};
use crate::progress::ProgressTracker;

/// Iteration cap for the drive loop; a decoder that makes no progress for
/// this long has wedged.
const MAX_ITERATIONS: u64 = 1_000_000;

// ── Reducer ───────────────────────────────────────────────────────────────────

/// Folds interleaved s16le PCM into per-bucket peak amplitudes in [0, 1].
///
/// One bucket covers `max(1, pcm_rate / samples_per_second)` sample frames;
/// every channel's samples contribute to the same bucket, so the envelope
/// length tracks playback time, not channel count.
#[derive(Debug)]
pub struct WaveformReducer {
    samples_per_bucket: usize,
    bucket_peak: f64,
    filled: usize,
    amplitudes: Vec<f64>,
    carry: Option<u8>,
}

impl WaveformReducer {
    pub fn new(pcm_rate: u32, channels: u16, samples_per_second: u32) -> Self {
        let frames_per_bucket = (pcm_rate / samples_per_second.max(1)).max(1) as usize;
        Self {
            samples_per_bucket: frames_per_bucket * channels.max(1) as usize,
            bucket_peak: 0.0,
            filled: 0,
            amplitudes: Vec::new(),
            carry: None,
        }
    }

    /// Fold one PCM buffer. Buffers may split a sample across calls; the odd
    /// byte carries over.
    pub fn push(&mut self, data: &[u8]) {
        let mut buf;
        let bytes: &[u8] = if let Some(b) = self.carry.take() {
            buf = Vec::with_capacity(data.len() + 1);
            buf.push(b);
            buf.extend_from_slice(data);
            &buf
        } else {
            data
        };

        let mut chunks = bytes.chunks_exact(2);
        for pair in &mut chunks {
            let sample = i16::from_le_bytes([pair[0], pair[1]]);
            let amp = (sample as i32).unsigned_abs() as f64 / 32_768.0;
            if amp > self.bucket_peak {
                self.bucket_peak = amp;
            }
            self.filled += 1;
            if self.filled >= self.samples_per_bucket {
                self.amplitudes.push(self.bucket_peak.min(1.0));
                self.bucket_peak = 0.0;
                self.filled = 0;
            }
        }
        if let [b] = chunks.remainder() {
            self.carry = Some(*b);
        }
    }

    /// Emit the trailing partial bucket, if any, and return the envelope.
    pub fn finish(mut self) -> Vec<f64> {
        if self.filled > 0 {
            self.amplitudes.push(self.bucket_peak.min(1.0));
        }
        self.amplitudes
    }

    pub fn len(&self) -> usize {
        self.amplitudes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.amplitudes.is_empty()
    }
}

// ── Drive loop ────────────────────────────────────────────────────────────────

/// Decode the selected track of `demuxer` and reduce it to an envelope with
/// `samples_per_second` buckets per second.
pub fn run_waveform<D, C>(
    demuxer: &mut D,
    decoder: &mut C,
    samples_per_second: u32,
    cancel: &CancelToken,
    progress: &mut ProgressTracker<'_>,
) -> Result<WaveformEnvelope, AudioError>
where
    D: Demuxer,
    C: AudioDecoder,
{
    let duration_us = demuxer.source().duration_us.max(1);
    let channels = decoder.output_channels();
    let mut reducer = WaveformReducer::new(decoder.output_rate(), channels, samples_per_second);

    let mut pending_au: Option<AccessUnit> = None;
    let mut demux_done = false;
    let mut last_pts_us: i64 = 0;
    let mut iterations: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(AudioError::Cancelled);
        }
        iterations += 1;
        if iterations > MAX_ITERATIONS {
            return Err(AudioError::Timeout { elapsed_ms: 0, iterations });
        }

        // Feed.
        if !demux_done {
            let au = match pending_au.take() {
                Some(au) => Some(au),
                None => demuxer.next()?,
            };
            match au {
                Some(au) => {
                    if matches!(decoder.try_send(&au)?, SendStatus::Full) {
                        pending_au = Some(au);
                    }
                }
                None => {
                    if matches!(decoder.send_eos()?, SendStatus::Accepted) {
                        demux_done = true;
                    }
                }
            }
        }

        // Reduce.
        match decoder.try_receive()? {
            DecoderEvent::Pcm(frame) => {
                if !frame.data.is_empty() {
                    reducer.push(&frame.data);
                    last_pts_us = frame.pts_us;
                    progress.report(frame.pts_us as f32 / duration_us as f32);
                }
                if frame.is_eos {
                    break;
                }
            }
            DecoderEvent::Empty => {}
        }
    }

    log::debug!(
        "waveform: {} buckets from {} µs of PCM",
        reducer.len(),
        last_pts_us
    );

    Ok(WaveformEnvelope {
        amplitudes: reducer.finish(),
        sample_rate_hz: samples_per_second,
        duration_ms: us_to_ms(duration_us),
        channels,
    })
}
