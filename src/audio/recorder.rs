use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{mpsc, Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rtrb::{Consumer, Producer, RingBuffer};
use tokio::sync::mpsc as event_mpsc;

use super::analysis::{AnalysisMode, FrequencyAnalyzer, FrequencySnapshot};
use super::backend::{
    AudioBackend, CpalBackend, DeviceInfo, StreamFormat, StreamHandle, StreamRequest,
};
use super::wav::{self, WavFile};
use super::{AudioChunk, AudioError, StreamEvent};
use crate::config::{AnalyzerConfig, CaptureConfig};

/// 处理线程轮询环形缓冲的间隔
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// 每个处理周期回调一次，参数是最新的 16-bit PCM 块
pub type ChunkCallback = Box<dyn FnMut(AudioChunk) + Send + 'static>;

/// 录音状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecorderStatus {
    Ended = 0,
    Paused = 1,
    Recording = 2,
}

impl From<u8> for RecorderStatus {
    fn from(v: u8) -> Self {
        match v {
            1 => RecorderStatus::Paused,
            2 => RecorderStatus::Recording,
            _ => RecorderStatus::Ended,
        }
    }
}

/// 处理线程控制命令
enum WorkerCommand {
    Record(ChunkCallback),
    /// 处理完环形缓冲中已有的采样，不足一块的尾部作为短块交付，然后停止回调并确认
    Pause(mpsc::Sender<()>),
    Shutdown(mpsc::Sender<()>),
}

/// `Recorder::decode` 的结果
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Vec<i16>,
    pub wav: WavFile,
    pub sample_rate: u32,
    pub duration: Duration,
}

struct CaptureWorker {
    command_tx: mpsc::Sender<WorkerCommand>,
    handle: Option<JoinHandle<()>>,
}

/// 录音管道
///
/// 设备回调把采样转成单声道、重采样后写入无锁环形缓冲；处理线程按固定块大小
/// 切分，追加到录音缓冲并回调调用方。
pub struct Recorder {
    config: CaptureConfig,
    backend: Arc<dyn AudioBackend>,
    analyzer: FrequencyAnalyzer,
    status: Arc<AtomicU8>,
    /// 设备回调的闸门，只有录音中才写入环形缓冲
    capturing: Arc<AtomicBool>,
    buffer: Arc<RwLock<Vec<f32>>>,
    /// 最近 fft_size 个采样，供频谱分析（包括尚未凑满一块的采样）
    live: Arc<Mutex<VecDeque<f32>>>,
    overflow: Arc<AtomicU64>,
    device_lost: Arc<AtomicBool>,
    stream: Option<StreamHandle>,
    worker: Option<CaptureWorker>,
    events_tx: event_mpsc::UnboundedSender<StreamEvent>,
    events_rx: Option<event_mpsc::UnboundedReceiver<StreamEvent>>,
}

impl Recorder {
    /// 使用系统默认输入设备创建录音器
    pub fn new(config: CaptureConfig, analyzer: AnalyzerConfig) -> Result<Self, AudioError> {
        Self::with_backend(config, analyzer, Arc::new(CpalBackend::new()))
    }

    pub fn with_backend(
        config: CaptureConfig,
        analyzer: AnalyzerConfig,
        backend: Arc<dyn AudioBackend>,
    ) -> Result<Self, AudioError> {
        if config.sample_rate == 0 {
            return Err(AudioError::InvalidFormat("sample rate must be > 0".to_string()));
        }
        if config.block_size == 0 {
            return Err(AudioError::InvalidFormat("block size must be > 0".to_string()));
        }
        let analyzer = FrequencyAnalyzer::new(analyzer, config.sample_rate)?;
        let (events_tx, events_rx) = event_mpsc::unbounded_channel();

        Ok(Self {
            config,
            backend,
            analyzer,
            status: Arc::new(AtomicU8::new(RecorderStatus::Ended as u8)),
            capturing: Arc::new(AtomicBool::new(false)),
            buffer: Arc::new(RwLock::new(Vec::new())),
            live: Arc::new(Mutex::new(VecDeque::new())),
            overflow: Arc::new(AtomicU64::new(0)),
            device_lost: Arc::new(AtomicBool::new(false)),
            stream: None,
            worker: None,
            events_tx,
            events_rx: Some(events_rx),
        })
    }

    /// 获取麦克风并启动处理线程
    ///
    /// 已经开始时直接返回成功（不会停止当前录音）。
    pub fn begin(&mut self) -> Result<(), AudioError> {
        if self.stream.is_some() {
            return Ok(());
        }

        self.write_buffer()?.clear();
        if let Ok(mut live) = self.live.lock() {
            live.clear();
        }
        self.capturing.store(false, Ordering::SeqCst);
        self.overflow.store(0, Ordering::SeqCst);
        self.device_lost.store(false, Ordering::SeqCst);

        let ring_capacity = (self.config.sample_rate as usize)
            .saturating_mul(self.config.ring_seconds.max(1) as usize)
            .max(self.config.block_size * 2);
        let (producer, consumer) = RingBuffer::<f32>::new(ring_capacity);

        let mut sink = CaptureSink::new(
            producer,
            self.capturing.clone(),
            self.overflow.clone(),
            self.config.sample_rate,
        );
        let device_lost = self.device_lost.clone();
        let events_tx = self.events_tx.clone();

        let stream = self.backend.open_input(
            StreamRequest {
                sample_rate: self.config.sample_rate,
                channels: 1,
            },
            Box::new(move |data: &[f32], format: StreamFormat| sink.process(data, format)),
            Box::new(move |err: AudioError| {
                if !device_lost.swap(true, Ordering::SeqCst) {
                    let _ = events_tx.send(StreamEvent::DeviceLost {
                        message: err.to_string(),
                    });
                }
            }),
        )?;

        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();
        let state = CaptureState {
            consumer,
            pending: Vec::with_capacity(self.config.block_size),
            buffer: self.buffer.clone(),
            live: self.live.clone(),
            window_len: self.analyzer.fft_size(),
            block_size: self.config.block_size,
            sample_rate: self.config.sample_rate,
        };
        let overflow = self.overflow.clone();

        let handle = thread::Builder::new()
            .name("voxlink-capture".to_string())
            .spawn(move || {
                run_capture_loop(command_rx, state, overflow)
            })
            .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?;

        tracing::info!(
            "Recorder began: {}Hz mono, block size {}, device format {:?}",
            self.config.sample_rate,
            self.config.block_size,
            stream.format()
        );

        self.stream = Some(stream);
        self.worker = Some(CaptureWorker {
            command_tx,
            handle: Some(handle),
        });
        self.status.store(RecorderStatus::Paused as u8, Ordering::SeqCst);
        Ok(())
    }

    /// 开始录音，每个处理周期回调一次
    pub fn record<F>(&mut self, on_chunk: F) -> Result<(), AudioError>
    where
        F: FnMut(AudioChunk) + Send + 'static,
    {
        let worker = self.worker.as_ref().ok_or_else(|| {
            AudioError::InvalidState("Session ended: call begin() first".to_string())
        })?;
        if self.status() == RecorderStatus::Recording {
            return Err(AudioError::InvalidState("Already recording".to_string()));
        }

        // 先把回调交给处理线程，再打开闸门
        worker
            .command_tx
            .send(WorkerCommand::Record(Box::new(on_chunk)))
            .map_err(|_| AudioError::InvalidState("capture worker has stopped".to_string()))?;
        self.capturing.store(true, Ordering::SeqCst);
        self.status.store(RecorderStatus::Recording as u8, Ordering::SeqCst);

        tracing::info!("Recording started");
        Ok(())
    }

    /// 暂停录音，保留缓冲和设备
    pub fn pause(&mut self) -> Result<(), AudioError> {
        let worker = self.worker.as_ref().ok_or_else(|| {
            AudioError::InvalidState("Session ended: call begin() first".to_string())
        })?;
        if self.status() != RecorderStatus::Recording {
            return Ok(());
        }

        self.capturing.store(false, Ordering::SeqCst);
        let (ack_tx, ack_rx) = mpsc::channel();
        if worker.command_tx.send(WorkerCommand::Pause(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
        self.status.store(RecorderStatus::Paused as u8, Ordering::SeqCst);

        tracing::info!(
            "Recording paused, {} samples captured",
            self.read_buffer().map(|b| b.len()).unwrap_or(0)
        );
        Ok(())
    }

    /// 释放设备并结束会话；缓冲保留到下一次 begin
    pub fn end(&mut self) -> Result<(), AudioError> {
        if self.worker.is_none() {
            return Err(AudioError::InvalidState(
                "Session ended: call begin() first".to_string(),
            ));
        }

        self.capturing.store(false, Ordering::SeqCst);
        // 流会在 drop 时自动停止
        self.stream = None;

        if let Some(mut worker) = self.worker.take() {
            let (ack_tx, ack_rx) = mpsc::channel();
            if worker.command_tx.send(WorkerCommand::Shutdown(ack_tx)).is_ok() {
                let _ = ack_rx.recv();
            }
            if let Some(handle) = worker.handle.take() {
                handle.join().ok();
            }
        }

        self.status.store(RecorderStatus::Ended as u8, Ordering::SeqCst);
        tracing::info!("Recorder ended");
        Ok(())
    }

    pub fn status(&self) -> RecorderStatus {
        RecorderStatus::from(self.status.load(Ordering::SeqCst))
    }

    /// 清空录音缓冲
    pub fn clear(&self) -> Result<(), AudioError> {
        self.write_buffer()?.clear();
        Ok(())
    }

    /// 录音缓冲的快照（f32）
    pub fn read(&self) -> Result<Vec<f32>, AudioError> {
        Ok(self.read_buffer()?.clone())
    }

    /// 录音缓冲的快照（16-bit PCM）
    pub fn captured_pcm(&self) -> Result<Vec<i16>, AudioError> {
        Ok(super::float_to_int16(&self.read_buffer()?))
    }

    /// 将录音缓冲导出为 WAV；录音中需要 `force`
    pub fn save(&self, force: bool) -> Result<WavFile, AudioError> {
        if self.status() == RecorderStatus::Recording && !force {
            return Err(AudioError::InvalidState(
                "Currently recording: pause() before save(), or pass force".to_string(),
            ));
        }
        let pcm = self.captured_pcm()?;
        wav::encode(&pcm, 1, self.config.sample_rate)
    }

    /// 把 PCM 封装为 WAV 再解码，可选重采样；不需要设备
    pub fn decode(
        samples: &[i16],
        source_rate: u32,
        target_rate: u32,
    ) -> Result<DecodedAudio, AudioError> {
        let source = wav::encode(samples, 1, source_rate)?;
        let decoded = wav::decode(source.as_bytes(), source_rate, target_rate)?;
        let wav = if target_rate == source_rate {
            source
        } else {
            wav::encode(&decoded, 1, target_rate)?
        };
        let duration = Duration::from_secs_f64(decoded.len() as f64 / target_rate as f64);

        Ok(DecodedAudio {
            samples: decoded,
            wav,
            sample_rate: target_rate,
            duration,
        })
    }

    /// 最近采样的频谱；未在录音时返回全零
    pub fn get_frequencies(&self, mode: AnalysisMode) -> FrequencySnapshot {
        if self.status() != RecorderStatus::Recording {
            return self.analyzer.silence(mode);
        }

        let window = match self.live.try_lock() {
            Ok(mut live) => live.make_contiguous().to_vec(),
            Err(_) => return self.analyzer.silence(mode),
        };
        self.analyzer.analyze(&window, mode)
    }

    pub fn list_devices(&self) -> Result<Vec<DeviceInfo>, AudioError> {
        self.backend.input_devices()
    }

    /// 取出设备事件接收器（只能取一次）
    pub fn take_events(&mut self) -> Option<event_mpsc::UnboundedReceiver<StreamEvent>> {
        self.events_rx.take()
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    pub fn block_size(&self) -> usize {
        self.config.block_size
    }

    /// 因环形缓冲已满而丢弃的采样数
    pub fn dropped_samples(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }

    fn read_buffer(&self) -> Result<std::sync::RwLockReadGuard<'_, Vec<f32>>, AudioError> {
        self.buffer
            .read()
            .map_err(|e| AudioError::InvalidState(format!("capture buffer poisoned: {}", e)))
    }

    fn write_buffer(&self) -> Result<std::sync::RwLockWriteGuard<'_, Vec<f32>>, AudioError> {
        self.buffer
            .write()
            .map_err(|e| AudioError::InvalidState(format!("capture buffer poisoned: {}", e)))
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if self.worker.is_some() {
            let _ = self.end();
        }
    }
}

/// 设备回调侧：转单声道、重采样、写入环形缓冲，不加锁不分配
struct CaptureSink {
    producer: Producer<f32>,
    capturing: Arc<AtomicBool>,
    overflow: Arc<AtomicU64>,
    target_sample_rate: u32,
    // 使用浮点累加器实现精确重采样
    accumulator: f64,
}

impl CaptureSink {
    fn new(
        producer: Producer<f32>,
        capturing: Arc<AtomicBool>,
        overflow: Arc<AtomicU64>,
        target_sample_rate: u32,
    ) -> Self {
        Self {
            producer,
            capturing,
            overflow,
            target_sample_rate,
            accumulator: 0.0,
        }
    }

    fn process(&mut self, data: &[f32], format: StreamFormat) {
        if !self.capturing.load(Ordering::Acquire) || format.sample_rate == 0 {
            return;
        }

        let channels = format.channels.max(1) as usize;
        let step = self.target_sample_rate as f64 / format.sample_rate as f64;
        let mut dropped = 0u64;

        for frame in data.chunks(channels) {
            let mono: f32 = frame.iter().sum::<f32>() / frame.len() as f32;

            // 当累加器 >= 1.0 时输出一个样本
            self.accumulator += step;
            while self.accumulator >= 1.0 {
                if self.producer.push(mono).is_err() {
                    dropped += 1;
                }
                self.accumulator -= 1.0;
            }
        }

        if dropped > 0 {
            self.overflow.fetch_add(dropped, Ordering::Relaxed);
        }
    }
}

/// 处理线程持有的状态
struct CaptureState {
    consumer: Consumer<f32>,
    /// 尚未凑满一块的采样
    pending: Vec<f32>,
    buffer: Arc<RwLock<Vec<f32>>>,
    live: Arc<Mutex<VecDeque<f32>>>,
    window_len: usize,
    block_size: usize,
    sample_rate: u32,
}

impl CaptureState {
    /// 取出环形缓冲中的采样，按块追加并回调；`flush` 时把不足一块的尾部也交付出去
    fn drain(&mut self, on_chunk: &mut Option<ChunkCallback>, flush: bool) {
        // 没有回调时样本留在环形缓冲里，等 record 之后再处理
        // 残留的尾部直接写入录音缓冲
        let Some(callback) = on_chunk.as_mut() else {
            self.flush_pending(None);
            return;
        };

        let available = self.consumer.slots();
        if available > 0 {
            if let Ok(chunk) = self.consumer.read_chunk(available) {
                let (first, second) = chunk.as_slices();
                update_live(&self.live, self.window_len, first, second);

                for &sample in first.iter().chain(second.iter()) {
                    self.pending.push(sample);
                    if self.pending.len() == self.block_size {
                        deliver(&mut self.pending, &self.buffer, self.sample_rate, callback);
                    }
                }
                chunk.commit_all();
            }
        }

        if flush {
            self.flush_pending(Some(callback));
        }
    }

    fn flush_pending(&mut self, callback: Option<&mut ChunkCallback>) {
        if self.pending.is_empty() {
            return;
        }
        match callback {
            Some(callback) => deliver(&mut self.pending, &self.buffer, self.sample_rate, callback),
            None => {
                if let Ok(mut buffer) = self.buffer.write() {
                    buffer.extend_from_slice(&self.pending);
                }
                self.pending.clear();
            }
        }
    }
}

/// 把 `pending` 追加到录音缓冲并作为一个块回调
fn deliver(
    pending: &mut Vec<f32>,
    buffer: &RwLock<Vec<f32>>,
    sample_rate: u32,
    callback: &mut ChunkCallback,
) {
    if let Ok(mut buffer) = buffer.write() {
        buffer.extend_from_slice(pending);
    }
    callback(AudioChunk::from_float(pending, sample_rate, 1));
    pending.clear();
}

fn update_live(live: &Mutex<VecDeque<f32>>, window_len: usize, first: &[f32], second: &[f32]) {
    let Ok(mut live) = live.lock() else {
        return;
    };
    for &sample in first.iter().chain(second.iter()) {
        if live.len() == window_len {
            live.pop_front();
        }
        live.push_back(sample);
    }
}

/// 处理线程：从环形缓冲取采样，按块追加到录音缓冲并回调
fn run_capture_loop(
    commands: mpsc::Receiver<WorkerCommand>,
    mut state: CaptureState,
    overflow: Arc<AtomicU64>,
) {
    let mut on_chunk: Option<ChunkCallback> = None;
    let mut reported_overflow = 0u64;

    loop {
        match commands.recv_timeout(POLL_INTERVAL) {
            Ok(WorkerCommand::Record(callback)) => on_chunk = Some(callback),
            Ok(WorkerCommand::Pause(ack)) => {
                state.drain(&mut on_chunk, true);
                on_chunk = None;
                let _ = ack.send(());
            }
            Ok(WorkerCommand::Shutdown(ack)) => {
                state.drain(&mut on_chunk, true);
                let _ = ack.send(());
                break;
            }
            Err(mpsc::RecvTimeoutError::Timeout) => state.drain(&mut on_chunk, false),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                state.drain(&mut on_chunk, true);
                break;
            }
        }

        let dropped = overflow.load(Ordering::Relaxed);
        if dropped > reported_overflow {
            tracing::warn!("Capture ring overflow: {} samples dropped", dropped - reported_overflow);
            reported_overflow = dropped;
        }
    }

    tracing::debug!("Capture worker stopped");
}
