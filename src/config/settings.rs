use serde::{Deserialize, Serialize};

/// 音频配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioConfig {
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
}

/// 录音配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// 每个处理周期的采样数（单声道）
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    /// 设备线程到处理线程的环形缓冲时长
    #[serde(default = "default_ring_seconds")]
    pub ring_seconds: u32,
}

fn default_sample_rate() -> u32 {
    24000
}

fn default_block_size() -> usize {
    4096
}

fn default_ring_seconds() -> u32 {
    2
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            block_size: default_block_size(),
            ring_seconds: default_ring_seconds(),
        }
    }
}

/// 播放配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackConfig {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// 可视化监听环形缓冲容量（采样数）
    #[serde(default = "default_tap_capacity")]
    pub tap_capacity: usize,
}

fn default_tap_capacity() -> usize {
    8192
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            tap_capacity: default_tap_capacity(),
        }
    }
}

/// 频谱分析配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    #[serde(default = "default_fft_size")]
    pub fft_size: usize,
    #[serde(default = "default_bar_count")]
    pub bar_count: usize,
    #[serde(default = "default_min_decibels")]
    pub min_decibels: f32,
    #[serde(default = "default_max_decibels")]
    pub max_decibels: f32,
    #[serde(default = "default_voice_min_hz")]
    pub voice_min_hz: f32,
    #[serde(default = "default_voice_max_hz")]
    pub voice_max_hz: f32,
}

fn default_fft_size() -> usize {
    1024
}

fn default_bar_count() -> usize {
    24
}

fn default_min_decibels() -> f32 {
    -100.0
}

fn default_max_decibels() -> f32 {
    -30.0
}

fn default_voice_min_hz() -> f32 {
    80.0
}

fn default_voice_max_hz() -> f32 {
    3000.0
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            fft_size: default_fft_size(),
            bar_count: default_bar_count(),
            min_decibels: default_min_decibels(),
            max_decibels: default_max_decibels(),
            voice_min_hz: default_voice_min_hz(),
            voice_max_hz: default_voice_max_hz(),
        }
    }
}
