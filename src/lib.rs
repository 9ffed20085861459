pub mod audio;
pub mod config;

#[cfg(feature = "ffi")]
pub mod ffi;

pub use audio::{
    AnalysisMode, AudioChunk, AudioError, FrequencyAnalyzer, FrequencySnapshot, Player,
    Recorder, RecorderStatus, StreamEvent, TrackOffset, TransportPayload,
};
pub use config::{load_config, save_config, AudioConfig};
