mod analysis;
mod backend;
mod pcm;
mod player;
mod recorder;
pub mod wav;

pub use analysis::{AnalysisMode, FrequencyAnalyzer, FrequencySnapshot};
pub use backend::{
    AudioBackend, CpalBackend, DeviceInfo, ErrorCallback, InputCallback, OutputCallback,
    StreamFormat, StreamHandle, StreamRequest,
};
pub use pcm::{
    decode_transport, encode_transport, float_to_int16, int16_to_float, pcm_from_bytes,
    pcm_to_bytes, TransportPayload,
};
pub use player::{PlayheadState, Player, TrackOffset};
pub use recorder::{DecodedAudio, Recorder, RecorderStatus};

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Malformed container: {0}")]
    MalformedContainer(String),
    #[error("Invalid format: {0}")]
    InvalidFormat(String),
    #[error("Stream error: {0}")]
    Stream(String),
}

/// 设备流事件，通过事件通道上报给调用方
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// 设备在运行中丢失（每个流只上报一次，不会自动重连）
    DeviceLost { message: String },
}

/// 一段 16-bit PCM 音频（交错存储），生成后不可变
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    samples: Vec<i16>,
    sample_rate: u32,
    channels: u16,
}

impl AudioChunk {
    pub fn new(samples: Vec<i16>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    /// 从设备原生的 f32 采样构造
    pub fn from_float(samples: &[f32], sample_rate: u32, channels: u16) -> Self {
        Self::new(float_to_int16(samples), sample_rate, channels)
    }

    /// 从传输载荷（base64 或原始字节）解码
    pub fn from_payload(
        payload: &TransportPayload,
        sample_rate: u32,
        channels: u16,
    ) -> Result<Self, AudioError> {
        Ok(Self::new(decode_transport(payload)?, sample_rate, channels))
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// 帧数（每帧包含 channels 个采样）
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frames() as f64 / self.sample_rate as f64)
    }

    /// 编码为 base64 传输格式 (16-bit little-endian)
    pub fn to_base64(&self) -> String {
        encode_transport(&self.samples)
    }

    pub fn into_samples(self) -> Vec<i16> {
        self.samples
    }
}
