// crates/tonecut-core/src/lib.rs

pub mod backend;
pub mod copy;
pub mod error;
pub mod gate;
pub mod inspect;
pub mod media_types;
pub mod pipeline;
pub mod progress;
pub mod splice;
pub mod waveform;
pub mod helpers;

pub use error::AudioError;
pub use media_types::{
    AccessUnit, AudioInfo, CancelToken, ConversionResult, EncoderConfig, PcmFrame, TimeRange,
    TrackFormat, WaveformEnvelope,
};
pub use progress::{OperationTag, ProgressEvent, ProgressTracker};
