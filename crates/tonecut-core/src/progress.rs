// crates/tonecut-core/src/progress.rs
//
// Progress reporting for every top-level operation. The tracker is the single
// gate all progress flows through, so the public guarantees (non-decreasing,
// streaming phase capped at 0.95, exactly one terminal 1.0) hold no matter
// which engine is reporting.

use serde::Serialize;

/// Streaming-phase ceiling. The final 1.0 is reserved for after the muxer has
/// stopped and the output file has been verified.
const STREAMING_CAP: f32 = 0.95;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationTag {
    Convert,
    Trim,
    TrimLossless,
    Splice,
    Waveform,
}

impl OperationTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationTag::Convert => "convert",
            OperationTag::Trim => "trim",
            OperationTag::TrimLossless => "trim_lossless",
            OperationTag::Splice => "splice",
            OperationTag::Waveform => "waveform",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub tag: OperationTag,
    pub progress: f32,
}

/// Monotonic progress gate in front of a caller-owned sink.
///
/// `report` takes the raw fraction an engine computed; the tracker clamps,
/// enforces monotonicity, and optionally maps it through a window so a
/// multi-input operation can hand each input a slice of the bar.
pub struct ProgressTracker<'a> {
    sink: &'a mut dyn FnMut(ProgressEvent),
    tag: OperationTag,
    last: f32,
    finished: bool,
    window_base: f32,
    window_span: f32,
}

impl<'a> ProgressTracker<'a> {
    pub fn new(tag: OperationTag, sink: &'a mut dyn FnMut(ProgressEvent)) -> Self {
        Self {
            sink,
            tag,
            last: 0.0,
            finished: false,
            window_base: 0.0,
            window_span: 1.0,
        }
    }

    pub fn tag(&self) -> OperationTag {
        self.tag
    }

    /// Map subsequent reports into `[base, base + span]` of the whole bar.
    /// Used by splice: input `i` of `n` gets `base = i/n, span = 1/n`.
    pub fn set_window(&mut self, base: f32, span: f32) {
        self.window_base = base.clamp(0.0, 1.0);
        self.window_span = span.clamp(0.0, 1.0);
    }

    /// Report a raw in-window fraction. Values are clamped into the window,
    /// capped at the streaming ceiling, and never allowed to decrease.
    pub fn report(&mut self, fraction: f32) {
        if self.finished {
            return;
        }
        let mapped = self.window_base + fraction.clamp(0.0, 1.0) * self.window_span;
        let value = mapped.min(STREAMING_CAP);
        if value > self.last {
            self.last = value;
            (self.sink)(ProgressEvent { tag: self.tag, progress: value });
        }
    }

    /// Emit the terminal 1.0. Called exactly once per successful operation,
    /// after the output has been verified on disk.
    pub fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.last = 1.0;
        (self.sink)(ProgressEvent { tag: self.tag, progress: 1.0 });
    }
}
