//! PCM 编解码
//!
//! 设备原生格式是 f32 (-1.0 到 1.0)，传输和存储使用 16-bit 有符号整数。
//! 正负半轴分别按 32767 / 32768 缩放，保证整数域上的往返转换是精确的。

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use super::AudioError;

/// 传输载荷：base64 文本或原始字节，内容都是 16-bit little-endian PCM
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportPayload {
    Base64(String),
    Binary(Vec<u8>),
}

impl TransportPayload {
    /// 解出原始字节
    pub fn to_bytes(&self) -> Result<Vec<u8>, AudioError> {
        match self {
            TransportPayload::Base64(text) => BASE64
                .decode(text.trim())
                .map_err(|e| AudioError::InvalidFormat(format!("invalid base64 payload: {}", e))),
            TransportPayload::Binary(bytes) => Ok(bytes.clone()),
        }
    }
}

impl From<String> for TransportPayload {
    fn from(text: String) -> Self {
        TransportPayload::Base64(text)
    }
}

impl From<&str> for TransportPayload {
    fn from(text: &str) -> Self {
        TransportPayload::Base64(text.to_string())
    }
}

impl From<Vec<u8>> for TransportPayload {
    fn from(bytes: Vec<u8>) -> Self {
        TransportPayload::Binary(bytes)
    }
}

impl From<&[u8]> for TransportPayload {
    fn from(bytes: &[u8]) -> Self {
        TransportPayload::Binary(bytes.to_vec())
    }
}

/// 将 f32 采样转换为 i16（先限幅到 [-1.0, 1.0]，再四舍五入）
pub fn float_to_int16(samples: &[f32]) -> Vec<i16> {
    samples.iter().map(|&s| sample_to_int16(s)).collect()
}

#[inline]
pub(crate) fn sample_to_int16(sample: f32) -> i16 {
    // NaN 视为静音
    let s = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    if s < 0.0 {
        (s * 32768.0).round() as i16
    } else {
        (s * 32767.0).round() as i16
    }
}

/// 将 i16 采样转换回 f32
pub fn int16_to_float(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| sample_to_float(s)).collect()
}

#[inline]
pub(crate) fn sample_to_float(sample: i16) -> f32 {
    if sample < 0 {
        sample as f32 / 32768.0
    } else {
        sample as f32 / 32767.0
    }
}

/// 将 i16 采样编码为 PCM 字节 (16-bit little-endian)
pub fn pcm_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut pcm_data = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        pcm_data.extend_from_slice(&sample.to_le_bytes());
    }
    pcm_data
}

/// 将 PCM 字节解码为 i16 采样，字节数必须为偶数
pub fn pcm_from_bytes(bytes: &[u8]) -> Result<Vec<i16>, AudioError> {
    if bytes.len() % 2 != 0 {
        return Err(AudioError::InvalidFormat(format!(
            "PCM payload has odd length {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// 编码为 base64 传输格式
pub fn encode_transport(samples: &[i16]) -> String {
    BASE64.encode(pcm_to_bytes(samples))
}

/// 解码传输载荷为 i16 采样
pub fn decode_transport(payload: &TransportPayload) -> Result<Vec<i16>, AudioError> {
    match payload {
        TransportPayload::Binary(bytes) => pcm_from_bytes(bytes),
        TransportPayload::Base64(_) => pcm_from_bytes(&payload.to_bytes()?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int16_domain_is_idempotent() {
        let all: Vec<i16> = (i16::MIN..=i16::MAX).collect();
        let back = float_to_int16(&int16_to_float(&all));
        assert_eq!(back, all);
    }

    #[test]
    fn test_float_to_int16_clamps_and_rounds() {
        let out = float_to_int16(&[2.0, -2.0, 1.0, -1.0, 0.0, 0.5, -0.5, f32::NAN]);
        assert_eq!(out, vec![32767, -32768, 32767, -32768, 0, 16384, -16384, 0]);
    }

    #[test]
    fn test_transport_round_trip_arbitrary_bytes() {
        let bytes: Vec<u8> = (0..=255u8).chain((0..=255u8).rev()).collect();
        let text = BASE64.encode(&bytes);
        let payload = TransportPayload::from(text.as_str());
        assert_eq!(payload.to_bytes().unwrap(), bytes);

        let samples = decode_transport(&payload).unwrap();
        assert_eq!(pcm_to_bytes(&samples), bytes);
        assert_eq!(encode_transport(&samples), text);
    }

    #[test]
    fn test_transport_empty_payload() {
        assert_eq!(encode_transport(&[]), "");
        assert!(decode_transport(&TransportPayload::from("")).unwrap().is_empty());
        assert!(decode_transport(&TransportPayload::from(Vec::new()))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_binary_and_base64_agree() {
        let samples = vec![0i16, 1, -1, 1234, -4321, i16::MAX, i16::MIN];
        let binary = TransportPayload::from(pcm_to_bytes(&samples));
        let text = TransportPayload::from(encode_transport(&samples));
        assert_eq!(decode_transport(&binary).unwrap(), samples);
        assert_eq!(decode_transport(&text).unwrap(), samples);
    }

    #[test]
    fn test_odd_length_payload_rejected() {
        let result = decode_transport(&TransportPayload::from(vec![1u8, 2, 3]));
        assert!(matches!(result, Err(AudioError::InvalidFormat(_))));
    }

    #[test]
    fn test_invalid_base64_rejected() {
        let result = decode_transport(&TransportPayload::from("not base64!!"));
        assert!(matches!(result, Err(AudioError::InvalidFormat(_))));
    }
}
