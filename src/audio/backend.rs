//! 音频设备抽象
//!
//! `AudioBackend` 是管道和设备之间的接缝：管道只提供回调，设备负责按自己的
//! 时钟周期性调用。回调运行在渲染上下文中，不允许阻塞。
//!
//! cpal 的 `Stream` 在部分平台上不是 `Send`，因此每个流都由独立线程持有，
//! 调用方拿到的 `StreamHandle` 被 drop 时通知该线程停止并等待其退出。

use std::sync::mpsc;
use std::thread;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use super::AudioError;

/// 输入回调：交错的 f32 采样 + 实际设备格式
pub type InputCallback = Box<dyn FnMut(&[f32], StreamFormat) + Send + 'static>;
/// 输出回调：填充交错的 f32 输出缓冲
pub type OutputCallback = Box<dyn FnMut(&mut [f32], StreamFormat) + Send + 'static>;
/// 设备运行中出错时调用
pub type ErrorCallback = Box<dyn FnMut(AudioError) + Send + 'static>;

/// 调用方期望的流格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamRequest {
    pub sample_rate: u32,
    pub channels: u16,
}

/// 设备实际协商出的格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// 输入设备信息
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub is_default: bool,
    pub supported_sample_rates: Vec<u32>,
}

/// 活动流句柄，drop 时停止设备
pub struct StreamHandle {
    format: StreamFormat,
    close: Option<Box<dyn FnOnce() + Send>>,
}

impl StreamHandle {
    pub fn new(format: StreamFormat, close: impl FnOnce() + Send + 'static) -> Self {
        Self {
            format,
            close: Some(Box::new(close)),
        }
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if let Some(close) = self.close.take() {
            close();
        }
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("format", &self.format)
            .finish()
    }
}

/// 音频设备后端
pub trait AudioBackend: Send + Sync {
    /// 打开输入设备，失败时返回 `DeviceUnavailable`
    fn open_input(
        &self,
        request: StreamRequest,
        data: InputCallback,
        error: ErrorCallback,
    ) -> Result<StreamHandle, AudioError>;

    /// 打开输出设备，失败时返回 `DeviceUnavailable`
    fn open_output(
        &self,
        request: StreamRequest,
        data: OutputCallback,
        error: ErrorCallback,
    ) -> Result<StreamHandle, AudioError>;

    /// 列出输入设备
    fn input_devices(&self) -> Result<Vec<DeviceInfo>, AudioError>;
}

// ============================================================================
// cpal 实现
// ============================================================================

/// 基于 cpal 默认 host 的后端
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }
}

impl AudioBackend for CpalBackend {
    fn open_input(
        &self,
        request: StreamRequest,
        data: InputCallback,
        error: ErrorCallback,
    ) -> Result<StreamHandle, AudioError> {
        spawn_stream("voxlink-input", move || {
            let host = cpal::default_host();
            let device = host.default_input_device().ok_or_else(|| {
                AudioError::DeviceUnavailable("No input device found".to_string())
            })?;

            let supported = negotiate(
                &device,
                request,
                device.supported_input_configs().ok().map(|c| c.collect()),
                device.default_input_config(),
            )?;
            let format = StreamFormat {
                sample_rate: supported.sample_rate().0,
                channels: supported.channels(),
            };

            tracing::info!(
                "Using input device: {:?}, config: {:?}",
                device.name(),
                supported
            );

            let config = supported.config();
            let stream = match supported.sample_format() {
                cpal::SampleFormat::F32 => {
                    build_input::<f32>(&device, &config, format, data, error)?
                }
                cpal::SampleFormat::I16 => {
                    build_input::<i16>(&device, &config, format, data, error)?
                }
                cpal::SampleFormat::U16 => {
                    build_input::<u16>(&device, &config, format, data, error)?
                }
                other => {
                    return Err(AudioError::DeviceUnavailable(format!(
                        "Unsupported input sample format: {}",
                        other
                    )))
                }
            };
            Ok((stream, format))
        })
    }

    fn open_output(
        &self,
        request: StreamRequest,
        data: OutputCallback,
        error: ErrorCallback,
    ) -> Result<StreamHandle, AudioError> {
        spawn_stream("voxlink-output", move || {
            let host = cpal::default_host();
            let device = host.default_output_device().ok_or_else(|| {
                AudioError::DeviceUnavailable("No output device found".to_string())
            })?;

            let supported = negotiate(
                &device,
                request,
                device.supported_output_configs().ok().map(|c| c.collect()),
                device.default_output_config(),
            )?;
            let format = StreamFormat {
                sample_rate: supported.sample_rate().0,
                channels: supported.channels(),
            };

            tracing::info!(
                "Using output device: {:?}, config: {:?}",
                device.name(),
                supported
            );

            let config = supported.config();
            let stream = match supported.sample_format() {
                cpal::SampleFormat::F32 => {
                    build_output::<f32>(&device, &config, format, data, error)?
                }
                cpal::SampleFormat::I16 => {
                    build_output::<i16>(&device, &config, format, data, error)?
                }
                cpal::SampleFormat::U16 => {
                    build_output::<u16>(&device, &config, format, data, error)?
                }
                other => {
                    return Err(AudioError::DeviceUnavailable(format!(
                        "Unsupported output sample format: {}",
                        other
                    )))
                }
            };
            Ok((stream, format))
        })
    }

    fn input_devices(&self) -> Result<Vec<DeviceInfo>, AudioError> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?;
        let default_name = host
            .default_input_device()
            .and_then(|d| d.name().ok());

        let mut device_infos = Vec::new();
        for device in devices {
            let name = device.name().unwrap_or_else(|_| "Unknown Device".to_string());
            let is_default = default_name.as_deref() == Some(name.as_str());

            let mut supported_sample_rates: Vec<u32> = device
                .supported_input_configs()
                .map(|configs| configs.map(|c| c.max_sample_rate().0).collect())
                .unwrap_or_default();
            supported_sample_rates.sort_unstable();
            supported_sample_rates.dedup();

            device_infos.push(DeviceInfo {
                name,
                is_default,
                supported_sample_rates,
            });
        }

        Ok(device_infos)
    }
}

/// 选择最合适的设备配置
///
/// 优先选择包含目标采样率的配置（声道数一致、f32 格式加分），
/// 都不满足时退回设备默认配置，由管道负责重采样和声道转换。
fn negotiate(
    device: &cpal::Device,
    request: StreamRequest,
    ranges: Option<Vec<cpal::SupportedStreamConfigRange>>,
    default: Result<cpal::SupportedStreamConfig, cpal::DefaultStreamConfigError>,
) -> Result<cpal::SupportedStreamConfig, AudioError> {
    let wanted = cpal::SampleRate(request.sample_rate);

    let best = ranges.unwrap_or_default().into_iter().filter(|range| {
        range.min_sample_rate() <= wanted
            && wanted <= range.max_sample_rate()
            && matches!(
                range.sample_format(),
                cpal::SampleFormat::F32 | cpal::SampleFormat::I16 | cpal::SampleFormat::U16
            )
    });
    let best = best.max_by_key(|range| {
        let mut score = 0;
        if range.channels() == request.channels {
            score += 2;
        }
        if range.sample_format() == cpal::SampleFormat::F32 {
            score += 1;
        }
        score
    });

    if let Some(range) = best {
        return Ok(range.with_sample_rate(wanted));
    }

    tracing::info!(
        "Device {:?} does not support {}Hz/{}ch, falling back to default config",
        device.name(),
        request.sample_rate,
        request.channels
    );
    default.map_err(|e| AudioError::DeviceUnavailable(e.to_string()))
}

fn build_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    format: StreamFormat,
    mut data: InputCallback,
    mut error: ErrorCallback,
) -> Result<cpal::Stream, AudioError>
where
    T: cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    // 预分配转换缓冲，只在硬件缓冲变大时扩容
    let mut scratch: Vec<f32> = Vec::with_capacity(8192);

    device
        .build_input_stream(
            config,
            move |input: &[T], _: &cpal::InputCallbackInfo| {
                scratch.clear();
                scratch.extend(input.iter().map(|&s| <f32 as cpal::Sample>::from_sample(s)));
                data(scratch.as_slice(), format);
            },
            move |err| {
                tracing::error!("Audio input stream error: {}", err);
                error(AudioError::Stream(err.to_string()));
            },
            None,
        )
        .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))
}

fn build_output<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    format: StreamFormat,
    mut data: OutputCallback,
    mut error: ErrorCallback,
) -> Result<cpal::Stream, AudioError>
where
    T: cpal::SizedSample + cpal::FromSample<f32> + Send + 'static,
{
    let mut scratch: Vec<f32> = vec![0.0; 8192];

    device
        .build_output_stream(
            config,
            move |output: &mut [T], _: &cpal::OutputCallbackInfo| {
                if scratch.len() < output.len() {
                    scratch.resize(output.len(), 0.0);
                }
                let buffer = &mut scratch[..output.len()];
                data(buffer, format);
                for (out, &sample) in output.iter_mut().zip(buffer.iter()) {
                    *out = <T as cpal::Sample>::from_sample(sample);
                }
            },
            move |err| {
                tracing::error!("Audio output stream error: {}", err);
                error(AudioError::Stream(err.to_string()));
            },
            None,
        )
        .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))
}

/// 在独立线程中构建并持有流，等待构建结果后返回
fn spawn_stream<F>(name: &str, build: F) -> Result<StreamHandle, AudioError>
where
    F: FnOnce() -> Result<(cpal::Stream, StreamFormat), AudioError> + Send + 'static,
{
    let (ready_tx, ready_rx) = mpsc::channel::<Result<StreamFormat, AudioError>>();
    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let thread_name = name.to_string();

    let worker = thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            let stream = match build() {
                Ok((stream, format)) => match stream.play() {
                    Ok(()) => {
                        let _ = ready_tx.send(Ok(format));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(AudioError::DeviceUnavailable(e.to_string())));
                        return;
                    }
                },
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            tracing::info!("Audio stream {} playing", thread_name);

            // 等待停止命令（或句柄被丢弃）
            let _ = stop_rx.recv();

            // 流会在 drop 时自动停止
            drop(stream);
            tracing::info!("Audio stream {} stopped", thread_name);
        })
        .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?;

    let format = match ready_rx.recv() {
        Ok(result) => result?,
        Err(_) => {
            return Err(AudioError::DeviceUnavailable(
                "audio thread exited before the stream started".to_string(),
            ))
        }
    };

    Ok(StreamHandle::new(format, move || {
        let _ = stop_tx.send(());
        let _ = worker.join();
    }))
}

// ============================================================================
// 测试用的手动后端
// ============================================================================

#[cfg(test)]
pub(crate) mod manual {
    use std::sync::{Arc, Mutex};

    use super::*;

    type Slot<T> = Arc<Mutex<Option<T>>>;

    /// 由测试线程驱动的后端：`feed` 模拟麦克风回调，`pull` 模拟输出回调
    pub(crate) struct ManualBackend {
        input_format: StreamFormat,
        output_format: StreamFormat,
        available: bool,
        input: Slot<(InputCallback, ErrorCallback)>,
        output: Slot<(OutputCallback, ErrorCallback)>,
    }

    impl ManualBackend {
        pub(crate) fn new(sample_rate: u32, channels: u16) -> Self {
            let format = StreamFormat {
                sample_rate,
                channels,
            };
            Self::with_formats(format, format)
        }

        pub(crate) fn with_formats(input: StreamFormat, output: StreamFormat) -> Self {
            Self {
                input_format: input,
                output_format: output,
                available: true,
                input: Arc::new(Mutex::new(None)),
                output: Arc::new(Mutex::new(None)),
            }
        }

        pub(crate) fn unavailable() -> Self {
            let mut backend = Self::new(24000, 1);
            backend.available = false;
            backend
        }

        pub(crate) fn input_open(&self) -> bool {
            self.input.lock().unwrap().is_some()
        }

        pub(crate) fn output_open(&self) -> bool {
            self.output.lock().unwrap().is_some()
        }

        /// 模拟一次输入回调
        pub(crate) fn feed(&self, samples: &[f32]) {
            if let Some((data, _)) = self.input.lock().unwrap().as_mut() {
                data(samples, self.input_format);
            }
        }

        /// 模拟一次输出回调，返回设备收到的交错采样
        pub(crate) fn pull(&self, frames: usize) -> Vec<f32> {
            let mut buffer = vec![f32::NAN; frames * self.output_format.channels as usize];
            if let Some((data, _)) = self.output.lock().unwrap().as_mut() {
                data(buffer.as_mut_slice(), self.output_format);
            }
            buffer
        }

        pub(crate) fn fail_output(&self, message: &str) {
            if let Some((_, error)) = self.output.lock().unwrap().as_mut() {
                error(AudioError::Stream(message.to_string()));
            }
        }

        pub(crate) fn fail_input(&self, message: &str) {
            if let Some((_, error)) = self.input.lock().unwrap().as_mut() {
                error(AudioError::Stream(message.to_string()));
            }
        }
    }

    impl AudioBackend for ManualBackend {
        fn open_input(
            &self,
            _request: StreamRequest,
            data: InputCallback,
            error: ErrorCallback,
        ) -> Result<StreamHandle, AudioError> {
            if !self.available {
                return Err(AudioError::DeviceUnavailable("permission denied".to_string()));
            }
            *self.input.lock().unwrap() = Some((data, error));
            let slot = self.input.clone();
            Ok(StreamHandle::new(self.input_format, move || {
                if let Ok(mut slot) = slot.lock() {
                    *slot = None;
                }
            }))
        }

        fn open_output(
            &self,
            _request: StreamRequest,
            data: OutputCallback,
            error: ErrorCallback,
        ) -> Result<StreamHandle, AudioError> {
            if !self.available {
                return Err(AudioError::DeviceUnavailable("no output device".to_string()));
            }
            *self.output.lock().unwrap() = Some((data, error));
            let slot = self.output.clone();
            Ok(StreamHandle::new(self.output_format, move || {
                if let Ok(mut slot) = slot.lock() {
                    *slot = None;
                }
            }))
        }

        fn input_devices(&self) -> Result<Vec<DeviceInfo>, AudioError> {
            Ok(vec![DeviceInfo {
                name: "manual".to_string(),
                is_default: true,
                supported_sample_rates: vec![self.input_format.sample_rate],
            }])
        }
    }
}
