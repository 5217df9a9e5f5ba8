// crates/tonecut-media/src/worker.rs
//
// AudioWorker: owns the background job threads and the result channel the
// host drains. All public API an integrating UI calls lives here.
//
// Each operation runs as one job thread with its own cancel token, keyed by
// job id. Cancel tokens are registered *before* the thread spawns so a
// cancel issued immediately after start is never lost. Info probes run
// behind a small counting gate so importing a folder of files doesn't open
// an unbounded number of demuxer contexts at once.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};
use uuid::Uuid;

use tonecut_core::media_types::{AudioInfo, CancelToken, ConversionResult, WaveformEnvelope};
use tonecut_core::{AudioError, OperationTag};

use crate::ops;
use crate::ops::OutputFormat;

// ── Job descriptions ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ConvertSpec {
    pub job_id: Uuid,
    pub input: PathBuf,
    pub output: PathBuf,
    pub format: OutputFormat,
    pub bit_rate_kbps: u32,
    pub sample_rate: u32,
}

#[derive(Debug, Clone)]
pub struct TrimSpec {
    pub job_id: Uuid,
    pub input: PathBuf,
    pub output: PathBuf,
    pub start_ms: u64,
    pub end_ms: u64,
    pub format: OutputFormat,
    pub bit_rate_kbps: u32,
    pub sample_rate: u32,
}

#[derive(Debug, Clone)]
pub struct SpliceSpec {
    pub job_id: Uuid,
    pub inputs: Vec<PathBuf>,
    pub output: PathBuf,
    pub bit_rate_kbps: u32,
    pub sample_rate: u32,
}

#[derive(Debug, Clone)]
pub struct WaveformSpec {
    pub job_id: Uuid,
    pub input: PathBuf,
    pub samples_per_second: u32,
}

/// Results sent from the worker threads to the host.
#[derive(Debug)]
pub enum AudioUpdate {
    Progress { job_id: Uuid, tag: OperationTag, progress: f32 },
    Converted { job_id: Uuid, result: ConversionResult },
    Waveform { job_id: Uuid, envelope: WaveformEnvelope },
    Info { job_id: Uuid, info: AudioInfo },
    Failed { job_id: Uuid, error: AudioError },
}

// ── AudioWorker ───────────────────────────────────────────────────────────────

pub struct AudioWorker {
    /// Shared result channel: progress, completions, failures, info reports.
    pub rx: Receiver<AudioUpdate>,
    tx: Sender<AudioUpdate>,
    shutdown: Arc<AtomicBool>,
    /// Per-job cancel tokens. Entries are inserted before the job thread
    /// spawns and removed when the job finishes, so cancellation is targeted
    /// and the map doesn't grow over a long session.
    cancels: Arc<Mutex<HashMap<Uuid, CancelToken>>>,
    /// Limits concurrent info probes: (active_count, Condvar).
    probe_sem: Arc<(Mutex<u32>, Condvar)>,
}

impl Default for AudioWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioWorker {
    pub fn new() -> Self {
        let (tx, rx) = bounded(512);
        Self {
            rx,
            tx,
            shutdown: Arc::new(AtomicBool::new(false)),
            cancels: Arc::new(Mutex::new(HashMap::new())),
            probe_sem: Arc::new((Mutex::new(0), Condvar::new())),
        }
    }

    /// Stop accepting results and cancel every active job.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let cancels = self.cancels.lock().unwrap();
        for token in cancels.values() {
            token.cancel();
        }
    }

    /// Signal the job identified by `job_id` to stop. The job drains safely
    /// and reports `Failed { error: Cancelled }` on the result channel.
    pub fn cancel(&self, job_id: Uuid) {
        if let Some(token) = self.cancels.lock().unwrap().get(&job_id) {
            token.cancel();
        }
    }

    pub fn start_convert(&self, spec: ConvertSpec) {
        let job_id = spec.job_id;
        self.spawn_job(job_id, move |cancel, progress| {
            ops::convert_audio(
                &spec.input,
                &spec.output,
                spec.format,
                spec.bit_rate_kbps,
                spec.sample_rate,
                cancel,
                progress,
            )
            .map(|result| AudioUpdate::Converted { job_id, result })
        });
    }

    pub fn start_trim(&self, spec: TrimSpec) {
        let job_id = spec.job_id;
        self.spawn_job(job_id, move |cancel, progress| {
            ops::trim_audio(
                &spec.input,
                &spec.output,
                spec.start_ms,
                spec.end_ms,
                spec.format,
                spec.bit_rate_kbps,
                spec.sample_rate,
                cancel,
                progress,
            )
            .map(|result| AudioUpdate::Converted { job_id, result })
        });
    }

    pub fn start_splice(&self, spec: SpliceSpec) {
        let job_id = spec.job_id;
        self.spawn_job(job_id, move |cancel, progress| {
            ops::splice_audio(
                &spec.inputs,
                &spec.output,
                OutputFormat::M4a,
                spec.bit_rate_kbps,
                spec.sample_rate,
                cancel,
                progress,
            )
            .map(|result| AudioUpdate::Converted { job_id, result })
        });
    }

    pub fn start_waveform(&self, spec: WaveformSpec) {
        let job_id = spec.job_id;
        self.spawn_job(job_id, move |cancel, progress| {
            ops::extract_waveform(&spec.input, spec.samples_per_second, cancel, progress)
                .map(|envelope| AudioUpdate::Waveform { job_id, envelope })
        });
    }

    /// Probe a file's diagnostics. Throttled: at most `PROBE_CONCURRENCY`
    /// probes run at once; a gatekeeper thread waits for a slot *before*
    /// spawning the real work, so queued probes cost one parked thread, not
    /// one per file.
    pub fn request_info(&self, job_id: Uuid, path: PathBuf) {
        const PROBE_CONCURRENCY: u32 = 4;

        let tx = self.tx.clone();
        let sd = self.shutdown.clone();
        let sem = self.probe_sem.clone();

        thread::spawn(move || {
            {
                let (lock, cvar) = &*sem;
                let mut count = lock.lock().unwrap();
                while *count >= PROBE_CONCURRENCY {
                    count = cvar.wait(count).unwrap();
                }
                *count += 1;
            }
            // RAII release guard — decrements count and wakes the next
            // waiter on drop, on every exit path.
            struct SemGuard(Arc<(Mutex<u32>, Condvar)>);
            impl Drop for SemGuard {
                fn drop(&mut self) {
                    let (lock, cvar) = &*self.0;
                    *lock.lock().unwrap() -= 1;
                    cvar.notify_one();
                }
            }
            let _guard = SemGuard(sem);

            if sd.load(Ordering::Relaxed) {
                return;
            }
            let info = ops::get_audio_info(&path);
            let _ = tx.send(AudioUpdate::Info { job_id, info });
        });
    }

    /// Register the cancel token, run `work` on its own thread, and report
    /// the outcome on the result channel.
    fn spawn_job<F>(&self, job_id: Uuid, work: F)
    where
        F: FnOnce(&CancelToken, ops::ProgressFn<'_>) -> Result<AudioUpdate, AudioError>
            + Send
            + 'static,
    {
        let cancel = CancelToken::new();
        // Register before spawning — avoids a window where cancel() is
        // called before the thread has inserted the token.
        self.cancels.lock().unwrap().insert(job_id, cancel.clone());

        let tx = self.tx.clone();
        let sd = self.shutdown.clone();
        let cancels = Arc::clone(&self.cancels);

        thread::spawn(move || {
            if sd.load(Ordering::Relaxed) {
                let _ = tx.send(AudioUpdate::Failed {
                    job_id,
                    error: AudioError::Cancelled,
                });
                cancels.lock().unwrap().remove(&job_id);
                return;
            }

            let progress_tx = tx.clone();
            let mut progress = move |event: tonecut_core::ProgressEvent| {
                let _ = progress_tx.send(AudioUpdate::Progress {
                    job_id,
                    tag: event.tag,
                    progress: event.progress,
                });
            };

            let update = match work(&cancel, &mut progress) {
                Ok(update) => update,
                Err(error) => AudioUpdate::Failed { job_id, error },
            };
            let _ = tx.send(update);

            cancels.lock().unwrap().remove(&job_id);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn info_request_reports_invalid_for_missing_file() {
        let worker = AudioWorker::new();
        let job_id = Uuid::new_v4();
        worker.request_info(job_id, PathBuf::from("/nonexistent/tonecut.mp3"));

        let update = worker.rx.recv_timeout(Duration::from_secs(10)).unwrap();
        match update {
            AudioUpdate::Info { job_id: got, info } => {
                assert_eq!(got, job_id);
                assert!(!info.is_valid());
            }
            other => panic!("unexpected update: {other:?}"),
        }
    }

    #[test]
    fn invalid_job_reports_failed() {
        let worker = AudioWorker::new();
        let job_id = Uuid::new_v4();
        worker.start_convert(ConvertSpec {
            job_id,
            input: PathBuf::from("/nonexistent/in.mp3"),
            output: PathBuf::from("/nonexistent/out.m4a"),
            format: OutputFormat::M4a,
            bit_rate_kbps: 9_999, // rejected at the surface
            sample_rate: 44_100,
        });

        let update = worker.rx.recv_timeout(Duration::from_secs(10)).unwrap();
        match update {
            AudioUpdate::Failed { job_id: got, error } => {
                assert_eq!(got, job_id);
                assert!(matches!(error, AudioError::InvalidArguments(_)));
            }
            other => panic!("unexpected update: {other:?}"),
        }
    }

    #[test]
    fn cancel_before_thread_start_is_not_lost() {
        let worker = AudioWorker::new();
        let job_id = Uuid::new_v4();
        worker.start_convert(ConvertSpec {
            job_id,
            input: PathBuf::from("/nonexistent/in.mp3"),
            output: PathBuf::from("/nonexistent/out.m4a"),
            format: OutputFormat::M4a,
            bit_rate_kbps: 128,
            sample_rate: 44_100,
        });
        // The token is registered synchronously, so this cancel targets the
        // job even if its thread hasn't run yet.
        worker.cancel(job_id);

        let update = worker.rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(matches!(update, AudioUpdate::Failed { .. }));
    }
}
