//! WAV 容器编解码
//!
//! 编码输出标准 RIFF/WAVE 小端容器（PCM 格式标记，16-bit），解码时校验头部
//! 并可按线性插值重采样到目标采样率。

use std::io::Cursor;

use super::AudioError;

const BITS_PER_SAMPLE: u16 = 16;

/// 完整的 WAV 字节流，对 UI 层而言是不透明的可播放数据
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WavFile {
    bytes: Vec<u8>,
    channels: u16,
    sample_rate: u32,
}

impl WavFile {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// data 段的字节数（从头部读取）
    pub fn data_len(&self) -> Option<u32> {
        find_chunk(&self.bytes, b"data").map(|(len, _)| len)
    }
}

/// 将交错的 i16 采样编码为 WAV
pub fn encode(samples: &[i16], channels: u16, sample_rate: u32) -> Result<WavFile, AudioError> {
    if channels < 1 {
        return Err(AudioError::InvalidFormat("channel count must be >= 1".to_string()));
    }
    if sample_rate == 0 {
        return Err(AudioError::InvalidFormat("sample rate must be > 0".to_string()));
    }
    if samples.len() % channels as usize != 0 {
        return Err(AudioError::InvalidFormat(format!(
            "{} samples do not divide into {} channels",
            samples.len(),
            channels
        )));
    }

    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: BITS_PER_SAMPLE,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    let mut writer = hound::WavWriter::new(&mut cursor, spec)
        .map_err(|e| AudioError::InvalidFormat(e.to_string()))?;

    for &sample in samples {
        writer
            .write_sample(sample)
            .map_err(|e| AudioError::InvalidFormat(e.to_string()))?;
    }

    writer
        .finalize()
        .map_err(|e| AudioError::InvalidFormat(e.to_string()))?;

    Ok(WavFile {
        bytes: cursor.into_inner(),
        channels,
        sample_rate,
    })
}

/// 解码 WAV 字节流，必要时从 `source_rate` 重采样到 `target_rate`
///
/// 返回交错的 i16 采样。头部与实际长度不一致时返回 `MalformedContainer`，
/// 不会返回部分结果。
pub fn decode(bytes: &[u8], source_rate: u32, target_rate: u32) -> Result<Vec<i16>, AudioError> {
    if source_rate == 0 || target_rate == 0 {
        return Err(AudioError::InvalidFormat(format!(
            "invalid resample rates {} -> {}",
            source_rate, target_rate
        )));
    }

    validate_riff(bytes)?;

    let reader = hound::WavReader::new(Cursor::new(bytes)).map_err(malformed)?;
    let spec = reader.spec();

    if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != BITS_PER_SAMPLE {
        return Err(AudioError::InvalidFormat(format!(
            "unsupported sample format {:?} / {} bits",
            spec.sample_format, spec.bits_per_sample
        )));
    }
    if spec.sample_rate != source_rate {
        tracing::debug!(
            "WAV header rate {}Hz differs from declared source rate {}Hz",
            spec.sample_rate,
            source_rate
        );
    }

    let declared = reader.len() as usize;
    let samples = reader
        .into_samples::<i16>()
        .collect::<Result<Vec<_>, _>>()
        .map_err(malformed)?;

    if samples.len() != declared {
        return Err(AudioError::MalformedContainer(format!(
            "data chunk declares {} samples, found {}",
            declared,
            samples.len()
        )));
    }

    Ok(resample_linear(
        &samples,
        spec.channels as usize,
        source_rate,
        target_rate,
    ))
}

/// 线性插值重采样（按声道独立插值）
pub fn resample_linear(
    samples: &[i16],
    channels: usize,
    source_rate: u32,
    target_rate: u32,
) -> Vec<i16> {
    let channels = channels.max(1);
    if source_rate == target_rate || source_rate == 0 || target_rate == 0 || samples.is_empty() {
        return samples.to_vec();
    }

    let frames = samples.len() / channels;
    if frames == 0 {
        return Vec::new();
    }

    let out_frames = ((frames as u64 * target_rate as u64) / source_rate as u64).max(1) as usize;
    let ratio = source_rate as f64 / target_rate as f64;

    let mut out = Vec::with_capacity(out_frames * channels);
    for i in 0..out_frames {
        let position = i as f64 * ratio;
        let index = (position.floor() as usize).min(frames - 1);
        let next = (index + 1).min(frames - 1);
        let frac = position - index as f64;

        for ch in 0..channels {
            let a = samples[index * channels + ch] as f64;
            let b = samples[next * channels + ch] as f64;
            let value = a + (b - a) * frac;
            out.push(value.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16);
        }
    }

    out
}

fn malformed(e: hound::Error) -> AudioError {
    AudioError::MalformedContainer(e.to_string())
}

/// 校验 RIFF/WAVE 标记以及 RIFF 长度不超过实际字节数
fn validate_riff(bytes: &[u8]) -> Result<(), AudioError> {
    if bytes.len() < 12 {
        return Err(AudioError::MalformedContainer(format!(
            "{} bytes is too short for a RIFF header",
            bytes.len()
        )));
    }
    if &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return Err(AudioError::MalformedContainer(
            "missing RIFF/WAVE tags".to_string(),
        ));
    }

    let riff_len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    if riff_len + 8 > bytes.len() {
        return Err(AudioError::MalformedContainer(format!(
            "RIFF length {} exceeds {} available bytes",
            riff_len,
            bytes.len() - 8
        )));
    }

    match find_chunk(bytes, b"data") {
        Some((len, offset)) if offset + len as usize <= bytes.len() => Ok(()),
        Some((len, _)) => Err(AudioError::MalformedContainer(format!(
            "data chunk of {} bytes is truncated",
            len
        ))),
        None => Err(AudioError::MalformedContainer(
            "missing data chunk".to_string(),
        )),
    }
}

/// 查找子块，返回 (长度, 数据起始偏移)
fn find_chunk(bytes: &[u8], id: &[u8; 4]) -> Option<(u32, usize)> {
    let mut offset = 12;
    while offset + 8 <= bytes.len() {
        let len = u32::from_le_bytes([
            bytes[offset + 4],
            bytes[offset + 5],
            bytes[offset + 6],
            bytes[offset + 7],
        ]);
        if &bytes[offset..offset + 4] == id {
            return Some((len, offset + 8));
        }
        // 子块按偶数字节对齐
        offset += 8 + len as usize + (len as usize & 1);
    }
    None
}
