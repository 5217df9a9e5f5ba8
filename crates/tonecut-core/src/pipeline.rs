// crates/tonecut-core/src/pipeline.rs
//
// The transcode pipeline: a single-threaded cooperative loop coordinating
// demuxer → decoder → encoder → muxer with back-pressure, EOS propagation and
// a stall watchdog.
//
// Loop shape (per iteration):
//   1. feed one AU (or EOS) into the decoder, through the time-range gate
//   2. move one decoded PCM frame into the encoder — never dropping it:
//      when the encoder is full, drain one encoder output to relieve
//      back-pressure and retry on a longer timeout, up to a fixed budget
//   3. retry the encoder EOS signal if the decoder finished but the signal
//      couldn't be queued yet
//   4. drain encoder output into the muxer; the first output-format event
//      registers the track and starts the muxer
//   5. watchdog: count iterations with no progress anywhere, escalate from
//      forced EOS to PipelineStalled; hard wall-clock and iteration caps
//
// The encoder→muxer half of the state lives in `SinkState`, outside the
// per-input loop, because splice runs several inputs through one shared
// encoder and muxer. A plain convert is the one-input special case with
// `finalize_encoder = true`.

use std::thread;
use std::time::{Duration, Instant};

use crate::backend::{
    AudioDecoder, AudioEncoder, Demuxer, DecoderEvent, EncoderEvent, Muxer, SendStatus, TrackId,
};
use crate::error::AudioError;
use crate::gate::{GateDecision, TimeRangeGate};
use crate::media_types::{CancelToken, PcmFrame, TimeRange};
use crate::progress::ProgressTracker;

/// Poll pause when an iteration made no progress anywhere.
const POLL_SLEEP: Duration = Duration::from_millis(1);

/// Back-pressure retry budget for one PCM frame (phase 2).
const ENCODER_RETRY_LIMIT: u32 = 10;

/// Longer timeout used between back-pressure retries.
const ENCODER_RETRY_SLEEP: Duration = Duration::from_millis(5);

/// Idle iterations before the watchdog intervenes.
const NO_ACTIVITY_LIMIT: u32 = 1_000;

/// Hard caps; exceeding either is a fatal `Timeout`.
const MAX_ITERATIONS: u64 = 50_000;
const MAX_WALL_CLOCK: Duration = Duration::from_secs(120);

// ── Parameters and state ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct TranscodeParams {
    /// Presentation window on the input; `None` converts the whole file.
    pub range: Option<TimeRange>,
    /// Added to every PCM timestamp handed to the encoder. Zero for convert;
    /// the cumulative splice offset for continuation inputs.
    pub ts_offset_us: i64,
    /// Signal EOS to the encoder when this input drains. False for every
    /// splice input but the last, so the shared encoder carries its buffered
    /// samples across the input boundary.
    pub finalize_encoder: bool,
    /// Denominator for progress; the range span when a range is active,
    /// otherwise the input duration.
    pub expected_duration_us: i64,
}

impl TranscodeParams {
    pub fn whole_file(duration_us: i64) -> Self {
        Self {
            range: None,
            ts_offset_us: 0,
            finalize_encoder: true,
            expected_duration_us: duration_us,
        }
    }
}

/// Encoder→muxer state that outlives one input. Splice threads one value
/// through all of its sub-runs; convert/trim use a fresh one.
#[derive(Debug, Default)]
pub struct SinkState {
    pub format_seen: bool,
    pub track_id: Option<TrackId>,
    pub muxer_started: bool,
    pub encoder_eos_signaled: bool,
    pub encoder_done: bool,
    pub samples_written: u64,
    pub bytes_written: u64,
    pub last_written_us: i64,
}

impl SinkState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Duration of the written stream, assuming the last AU spans one frame.
    pub fn duration_us(&self, frame_duration_us: i64) -> i64 {
        if self.samples_written == 0 {
            0
        } else {
            self.last_written_us + frame_duration_us
        }
    }
}

/// Per-input outcome, consumed by the splice orchestrator.
#[derive(Debug, Clone, Copy)]
pub struct TranscodeStats {
    /// Last PCM timestamp fed to the encoder, offset included.
    pub last_encoder_input_us: i64,
    /// Last raw demuxer timestamp consumed.
    pub processed_us: i64,
    pub iterations: u64,
}

// ── The loop ──────────────────────────────────────────────────────────────────

pub struct TranscodeLoop<'a, D, C, E, M>
where
    D: Demuxer,
    C: AudioDecoder,
    E: AudioEncoder,
    M: Muxer,
{
    demuxer: &'a mut D,
    decoder: &'a mut C,
    encoder: &'a mut E,
    muxer: &'a mut M,
    sink: &'a mut SinkState,
    params: TranscodeParams,
    cancel: CancelToken,
    gate: Option<TimeRangeGate>,

    pending_au: Option<crate::media_types::AccessUnit>,
    decoder_done: bool,
    decoder_eos_pending: bool,
    decoder_flushed: bool,
    demux_advanced: bool,
    processed_us: i64,
    last_encoder_input_us: i64,
    iterations: u64,
    no_activity: u32,
}

impl<'a, D, C, E, M> TranscodeLoop<'a, D, C, E, M>
where
    D: Demuxer,
    C: AudioDecoder,
    E: AudioEncoder,
    M: Muxer,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        demuxer: &'a mut D,
        decoder: &'a mut C,
        encoder: &'a mut E,
        muxer: &'a mut M,
        sink: &'a mut SinkState,
        params: TranscodeParams,
        cancel: CancelToken,
    ) -> Self {
        let gate = params.range.map(TimeRangeGate::new);
        Self {
            demuxer,
            decoder,
            encoder,
            muxer,
            sink,
            params,
            cancel,
            gate,
            pending_au: None,
            decoder_done: false,
            decoder_eos_pending: false,
            decoder_flushed: false,
            demux_advanced: false,
            processed_us: 0,
            last_encoder_input_us: 0,
            iterations: 0,
            no_activity: 0,
        }
    }

    /// Drive this input to completion. In finalize mode the loop ends when
    /// the encoder's EOS packet has been written; in carry mode it ends once
    /// the decoder is flushed and the encoder output is drained dry.
    pub fn run(mut self, progress: &mut ProgressTracker<'_>) -> Result<TranscodeStats, AudioError> {
        let started = Instant::now();

        loop {
            if self.cancel.is_cancelled() {
                return Err(AudioError::Cancelled);
            }
            self.iterations += 1;
            if self.iterations > MAX_ITERATIONS {
                return Err(AudioError::Timeout {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    iterations: self.iterations,
                });
            }
            if started.elapsed() > MAX_WALL_CLOCK {
                return Err(AudioError::Timeout {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    iterations: self.iterations,
                });
            }

            let mut activity = false;

            // 1. Feed decoder.
            if !self.decoder_done {
                activity |= self.feed_decoder()?;
            }

            // 2. Pump decoder → encoder.
            activity |= self.pump_decoder()?;

            // 3. Late EOS signal into the encoder.
            if self.decoder_flushed
                && self.params.finalize_encoder
                && !self.sink.encoder_eos_signaled
            {
                if matches!(self.encoder.send_eos()?, SendStatus::Accepted) {
                    self.sink.encoder_eos_signaled = true;
                    activity = true;
                }
            }

            // 4. Drain encoder → muxer.
            activity |= self.drain_encoder()?;

            if self.demux_advanced {
                self.demux_advanced = false;
                progress.report(self.fraction());
            }

            if self.params.finalize_encoder {
                if self.sink.encoder_done {
                    break;
                }
            } else if self.decoder_flushed {
                // Carry mode: phase 4 drained the encoder dry; whatever is
                // left inside it belongs to the next input.
                break;
            }

            // 5. Watchdog.
            if activity {
                self.no_activity = 0;
            } else {
                self.no_activity += 1;
                if self.no_activity >= NO_ACTIVITY_LIMIT {
                    if self.sink.encoder_eos_signaled {
                        // The EOS packet never surfaced; treat the encoder as
                        // silently complete rather than spinning forever.
                        log::warn!(
                            "encoder silent-complete after {} idle iterations",
                            self.no_activity
                        );
                        self.sink.encoder_done = true;
                        break;
                    }
                    if self.decoder_done && self.params.finalize_encoder {
                        // Decoder finished but its EOS frame went missing;
                        // force the signal through and keep draining.
                        if matches!(self.encoder.send_eos()?, SendStatus::Accepted) {
                            self.sink.encoder_eos_signaled = true;
                            self.no_activity = 0;
                            continue;
                        }
                    }
                    return Err(AudioError::PipelineStalled {
                        retries: 0,
                        last_pts_us: self.processed_us,
                        context: format!(
                            "no stage advanced for {} iterations",
                            self.no_activity
                        ),
                    });
                }
                thread::sleep(POLL_SLEEP);
            }
        }

        Ok(TranscodeStats {
            last_encoder_input_us: self.last_encoder_input_us,
            processed_us: self.processed_us,
            iterations: self.iterations,
        })
    }

    fn fraction(&self) -> f32 {
        let expected = self.params.expected_duration_us.max(1) as f32;
        let base = self.params.range.map(|r| r.start_us).unwrap_or(0);
        ((self.processed_us - base).max(0) as f32 / expected).min(1.0)
    }

    // ── Phase 1 ───────────────────────────────────────────────────────────────

    fn feed_decoder(&mut self) -> Result<bool, AudioError> {
        // An EOS that couldn't be queued last iteration takes precedence.
        if self.decoder_eos_pending {
            return self.queue_decoder_eos();
        }

        // A stashed AU exists only because the decoder was full; deliver it
        // before reading anything new so no data is lost.
        if let Some(au) = self.pending_au.take() {
            return match self.decoder.try_send(&au)? {
                SendStatus::Accepted => Ok(true),
                SendStatus::Full => {
                    self.pending_au = Some(au);
                    Ok(false)
                }
            };
        }

        loop {
            let Some(mut au) = self.demuxer.next()? else {
                return self.queue_decoder_eos();
            };
            self.processed_us = au.pts_us;
            self.demux_advanced = true;

            if let Some(gate) = &mut self.gate {
                match gate.admit(au.pts_us) {
                    // Pre-roll: advance the demuxer without queueing.
                    GateDecision::Skip => continue,
                    GateDecision::End => return self.queue_decoder_eos(),
                    GateDecision::Pass(rebased) => au.pts_us = rebased,
                }
            }

            return match self.decoder.try_send(&au)? {
                SendStatus::Accepted => Ok(true),
                SendStatus::Full => {
                    self.pending_au = Some(au);
                    Ok(false)
                }
            };
        }
    }

    fn queue_decoder_eos(&mut self) -> Result<bool, AudioError> {
        match self.decoder.send_eos()? {
            SendStatus::Accepted => {
                self.decoder_done = true;
                self.decoder_eos_pending = false;
                Ok(true)
            }
            SendStatus::Full => {
                self.decoder_eos_pending = true;
                Ok(false)
            }
        }
    }

    // ── Phase 2 ───────────────────────────────────────────────────────────────

    fn pump_decoder(&mut self) -> Result<bool, AudioError> {
        match self.decoder.try_receive()? {
            DecoderEvent::Pcm(mut frame) => {
                if frame.is_eos {
                    self.decoder_flushed = true;
                    if !frame.data.is_empty() {
                        // Flush frames can carry a tail of real samples.
                        frame.is_eos = false;
                        frame.pts_us += self.params.ts_offset_us;
                        self.deliver_to_encoder(&frame)?;
                    }
                    return Ok(true);
                }
                frame.pts_us += self.params.ts_offset_us;
                self.deliver_to_encoder(&frame)?;
                Ok(true)
            }
            DecoderEvent::Empty => Ok(false),
        }
    }

    /// Hand one PCM frame to the encoder. The frame is never dropped: a full
    /// encoder is relieved by draining one output buffer, then the send is
    /// retried on a longer timeout, up to the retry budget.
    fn deliver_to_encoder(&mut self, frame: &PcmFrame) -> Result<(), AudioError> {
        if matches!(self.encoder.try_send(frame)?, SendStatus::Accepted) {
            self.last_encoder_input_us = frame.pts_us;
            return Ok(());
        }
        for _ in 0..ENCODER_RETRY_LIMIT {
            self.drain_encoder_once()?;
            thread::sleep(ENCODER_RETRY_SLEEP);
            if matches!(self.encoder.try_send(frame)?, SendStatus::Accepted) {
                self.last_encoder_input_us = frame.pts_us;
                return Ok(());
            }
        }
        Err(AudioError::PipelineStalled {
            retries: ENCODER_RETRY_LIMIT,
            last_pts_us: frame.pts_us,
            context: "encoder input unavailable under back-pressure".into(),
        })
    }

    // ── Phase 4 ───────────────────────────────────────────────────────────────

    fn drain_encoder(&mut self) -> Result<bool, AudioError> {
        let mut any = false;
        while self.drain_encoder_once()? {
            any = true;
            if self.sink.encoder_done {
                break;
            }
        }
        Ok(any)
    }

    fn drain_encoder_once(&mut self) -> Result<bool, AudioError> {
        match self.encoder.try_receive()? {
            EncoderEvent::FormatChanged(format) => {
                if self.sink.format_seen {
                    return Err(AudioError::Codec(
                        "encoder changed its output format twice".into(),
                    ));
                }
                self.sink.format_seen = true;
                let track = self.muxer.add_track(&format)?;
                self.muxer.start()?;
                self.sink.track_id = Some(track);
                self.sink.muxer_started = true;
                Ok(true)
            }
            EncoderEvent::Packet(au) => {
                if au.flags.is_eos && au.data.is_empty() {
                    // Pure EOS marker; nothing to write.
                    self.sink.encoder_done = true;
                    return Ok(true);
                }
                let Some(track) = self.sink.track_id else {
                    return Err(AudioError::Codec(
                        "encoder produced data before its output format".into(),
                    ));
                };
                self.muxer.write_sample(track, &au)?;
                self.sink.samples_written += 1;
                self.sink.bytes_written += au.size() as u64;
                self.sink.last_written_us = au.pts_us;
                if au.flags.is_eos {
                    self.sink.encoder_done = true;
                }
                Ok(true)
            }
            EncoderEvent::Empty => Ok(false),
        }
    }
}
