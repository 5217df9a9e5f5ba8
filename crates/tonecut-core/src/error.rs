// crates/tonecut-core/src/error.rs
//
// One error taxonomy for the whole workspace. Every top-level operation
// fails with exactly one of these; backends map their native failures into
// the matching variant instead of inventing their own.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AudioError {
    /// Caller violated a precondition. Surfaced before any I/O.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// Trim bounds inconsistent with each other or with the input duration.
    #[error("invalid range: {0}")]
    InvalidRange(String),

    /// Input container or codec rejected by classification.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// File open/read/write/seek failed.
    #[error("i/o error on '{path}': {message}")]
    Io { path: PathBuf, message: String },

    /// Decoder or encoder refused configuration or reported a fatal state.
    #[error("codec error: {0}")]
    Codec(String),

    /// Back-pressure retry budget or the no-activity watchdog exhausted.
    #[error("pipeline stalled after {retries} retries at {last_pts_us} µs: {context}")]
    PipelineStalled {
        retries: u32,
        last_pts_us: i64,
        context: String,
    },

    /// Hard wall-clock or iteration cap exceeded.
    #[error("pipeline timed out after {elapsed_ms} ms ({iterations} iterations)")]
    Timeout { elapsed_ms: u64, iterations: u64 },

    /// Cancellation signal observed; resources released, partial output removed.
    #[error("operation cancelled")]
    Cancelled,

    /// Muxer rejected a sample or a track format.
    #[error("muxer error: {0}")]
    Muxer(String),
}

impl AudioError {
    pub fn io(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        AudioError::Io { path: path.into(), message: message.into() }
    }

    /// Stable machine-readable kind, for hosts that key on it.
    pub fn kind(&self) -> &'static str {
        match self {
            AudioError::InvalidArguments(_) => "invalid_arguments",
            AudioError::InvalidRange(_) => "invalid_range",
            AudioError::UnsupportedFormat(_) => "unsupported_format",
            AudioError::Io { .. } => "io_error",
            AudioError::Codec(_) => "codec_error",
            AudioError::PipelineStalled { .. } => "pipeline_stalled",
            AudioError::Timeout { .. } => "timeout",
            AudioError::Cancelled => "cancelled",
            AudioError::Muxer(_) => "muxer_error",
        }
    }
}
