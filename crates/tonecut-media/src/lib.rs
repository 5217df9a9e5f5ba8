// crates/tonecut-media/src/lib.rs

pub mod backend;
pub mod codec;
pub mod demux;
pub mod mux;
pub mod ops;
pub mod worker;
mod helpers;   // internal — not pub, not re-exported

pub use backend::FfmpegBackend;
pub use ops::{
    convert_audio, extract_waveform, get_audio_info, is_format_supported, splice_audio,
    trim_audio, OutputFormat,
};
pub use worker::{AudioUpdate, AudioWorker};
pub use tonecut_core::{
    AudioError, AudioInfo, CancelToken, ConversionResult, OperationTag, ProgressEvent,
    WaveformEnvelope,
};
