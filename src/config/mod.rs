pub mod settings;
pub mod storage;

pub use settings::{AnalyzerConfig, AudioConfig, CaptureConfig, PlaybackConfig};
pub use storage::{load_config, load_config_from, save_config, save_config_to, ConfigError};
