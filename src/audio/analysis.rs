//! FFT 频谱分析
//!
//! 对一个时域窗口做加窗 FFT，输出归一化到 [0, 1] 的幅度谱。
//! - `Frequency`: 原始线性频率 bin（fft_size / 2 个）
//! - `Voice`: 只保留人声频段，按对数间隔映射到固定数量的显示条

use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use super::AudioError;
use crate::config::AnalyzerConfig;

/// 分析模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnalysisMode {
    #[default]
    Frequency,
    Voice,
}

/// 一帧频谱快照，仅用于可视化，不持久化
#[derive(Debug, Clone, PartialEq)]
pub struct FrequencySnapshot {
    /// 归一化幅度 [0, 1]
    pub values: Vec<f32>,
    /// 每个 bin 的中心频率 (Hz)
    pub frequencies: Vec<f32>,
}

impl FrequencySnapshot {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_silent(&self) -> bool {
        self.values.iter().all(|&v| v == 0.0)
    }
}

/// 频谱分析器，FFT plan 在构造时生成，之后每次分析都是无状态的
pub struct FrequencyAnalyzer {
    config: AnalyzerConfig,
    sample_rate: u32,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
}

impl FrequencyAnalyzer {
    pub fn new(config: AnalyzerConfig, sample_rate: u32) -> Result<Self, AudioError> {
        let fft_size = config.fft_size;
        if fft_size < 2 || !fft_size.is_power_of_two() {
            return Err(AudioError::InvalidFormat(format!(
                "FFT size {} is not a power of two",
                fft_size
            )));
        }
        if sample_rate == 0 {
            return Err(AudioError::InvalidFormat("sample rate must be > 0".to_string()));
        }
        if config.bar_count == 0 {
            return Err(AudioError::InvalidFormat("bar count must be > 0".to_string()));
        }
        if config.min_decibels >= config.max_decibels {
            return Err(AudioError::InvalidFormat(format!(
                "decibel range [{}, {}] is empty",
                config.min_decibels, config.max_decibels
            )));
        }
        if config.voice_min_hz <= 0.0 || config.voice_min_hz >= config.voice_max_hz {
            return Err(AudioError::InvalidFormat(format!(
                "voice band [{}, {}] Hz is empty",
                config.voice_min_hz, config.voice_max_hz
            )));
        }

        // Hann 窗，减少频谱泄漏
        let window = (0..fft_size)
            .map(|i| {
                0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / fft_size as f32).cos())
            })
            .collect();

        let fft = FftPlanner::<f32>::new().plan_fft_forward(fft_size);

        Ok(Self {
            config,
            sample_rate,
            fft,
            window,
        })
    }

    pub fn fft_size(&self) -> usize {
        self.config.fft_size
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// 分析一个时域窗口
    ///
    /// 输入长于 fft_size 时取末尾的 fft_size 个采样，短于时末尾补零。
    pub fn analyze(&self, samples: &[f32], mode: AnalysisMode) -> FrequencySnapshot {
        let fft_size = self.config.fft_size;
        let tail = &samples[samples.len().saturating_sub(fft_size)..];

        if tail.iter().all(|&s| s == 0.0) {
            return self.silence(mode);
        }

        let mut buffer: Vec<Complex<f32>> = (0..fft_size)
            .map(|i| {
                let s = tail.get(i).copied().unwrap_or(0.0);
                Complex::new(s * self.window[i], 0.0)
            })
            .collect();
        self.fft.process(&mut buffer);

        let bins: Vec<f32> = buffer[..fft_size / 2]
            .iter()
            .map(|c| self.normalize(c.norm() * 2.0 / fft_size as f32))
            .collect();

        match mode {
            AnalysisMode::Frequency => FrequencySnapshot {
                values: bins,
                frequencies: self.bin_frequencies(),
            },
            AnalysisMode::Voice => self.voice_bands(&bins),
        }
    }

    /// 全零快照（静音或未在运行时返回）
    pub fn silence(&self, mode: AnalysisMode) -> FrequencySnapshot {
        match mode {
            AnalysisMode::Frequency => FrequencySnapshot {
                values: vec![0.0; self.config.fft_size / 2],
                frequencies: self.bin_frequencies(),
            },
            AnalysisMode::Voice => FrequencySnapshot {
                values: vec![0.0; self.config.bar_count],
                frequencies: self
                    .voice_edges()
                    .windows(2)
                    .map(|w| (w[0] * w[1]).sqrt())
                    .collect(),
            },
        }
    }

    fn bin_width(&self) -> f32 {
        self.sample_rate as f32 / self.config.fft_size as f32
    }

    fn bin_frequencies(&self) -> Vec<f32> {
        let width = self.bin_width();
        (0..self.config.fft_size / 2).map(|i| i as f32 * width).collect()
    }

    /// 幅度转分贝后映射到 [min_decibels, max_decibels]
    fn normalize(&self, magnitude: f32) -> f32 {
        if magnitude <= 0.0 {
            return 0.0;
        }
        let db = 20.0 * magnitude.log10();
        let range = self.config.max_decibels - self.config.min_decibels;
        ((db - self.config.min_decibels) / range).clamp(0.0, 1.0)
    }

    /// 人声频段的对数间隔边界，上限不超过 Nyquist
    fn voice_edges(&self) -> Vec<f32> {
        let nyquist = self.sample_rate as f32 / 2.0;
        let low = self.config.voice_min_hz.min(nyquist);
        let high = self.config.voice_max_hz.min(nyquist).max(low);
        let bars = self.config.bar_count;
        let ratio = if low > 0.0 { high / low } else { 1.0 };

        (0..=bars)
            .map(|i| low * ratio.powf(i as f32 / bars as f32))
            .collect()
    }

    fn voice_bands(&self, bins: &[f32]) -> FrequencySnapshot {
        let width = self.bin_width();
        let edges = self.voice_edges();
        let last_bin = bins.len().saturating_sub(1);

        let mut values = Vec::with_capacity(self.config.bar_count);
        let mut frequencies = Vec::with_capacity(self.config.bar_count);

        for edge in edges.windows(2) {
            let (low, high) = (edge[0], edge[1]);
            let first = ((low / width).ceil() as usize).min(last_bin);
            let end = ((high / width).ceil() as usize).min(bins.len());

            let value = if end > first {
                // 区间内的 bin 取平均
                bins[first..end].iter().sum::<f32>() / (end - first) as f32
            } else {
                // 低频分辨率不足时取最近的 bin
                let nearest = (((low + high) / 2.0 / width).round() as usize).min(last_bin);
                bins[nearest]
            };

            values.push(value.clamp(0.0, 1.0));
            frequencies.push((low * high).sqrt());
        }

        FrequencySnapshot {
            values,
            frequencies,
        }
    }
}
