//! 流式播放管道
//!
//! 所有轨道的 PCM 块按到达顺序排在同一个队列里，同一时刻只有一个轨道在发声。
//! 渲染回调只 `try_lock` 队列：拿不到锁就输出一个周期的静音且不推进播放头，
//! 因此打断时报告的偏移始终精确到采样。渲染回调从不分配或释放内存，
//! 播放完的块由主线程在下次加锁时回收。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rtrb::{Consumer, Producer, RingBuffer};
use tokio::sync::mpsc as event_mpsc;

use super::analysis::{AnalysisMode, FrequencyAnalyzer, FrequencySnapshot};
use super::backend::{AudioBackend, CpalBackend, StreamFormat, StreamHandle, StreamRequest};
use super::pcm::{decode_transport, int16_to_float, TransportPayload};
use super::{AudioChunk, AudioError, StreamEvent};
use crate::config::{AnalyzerConfig, PlaybackConfig};

/// 打断结果：调用方据此告知上游用户实际听到了多少
#[derive(Debug, Clone, PartialEq)]
pub struct TrackOffset {
    pub track_id: String,
    /// 已渲染的采样数
    pub offset: u64,
    pub current_time: Duration,
}

/// 单个轨道的播放头
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayheadState {
    pub enqueued: u64,
    pub rendered: u64,
}

struct TrackRecord {
    id: String,
    enqueued: u64,
    rendered: u64,
}

struct QueuedChunk {
    track: usize,
    samples: Vec<f32>,
}

/// 轨道登记表 + 播放队列
///
/// `chunks[..head]` 已播放完，等待主线程回收；`cursor` 是 `chunks[head]` 内的位置。
/// 队列中的块都不为空。
///
/// 新轨道登记时回收已播完的轨道记录。被打断的轨道 ID 一直保留到 disconnect，
/// 用来拒绝迟到的数据。
#[derive(Default)]
struct PlaybackQueue {
    tracks: Vec<TrackRecord>,
    index: HashMap<String, usize>,
    interrupted: HashSet<String>,
    chunks: VecDeque<QueuedChunk>,
    head: usize,
    cursor: usize,
    phase: f64,
}

impl PlaybackQueue {
    fn track_index(&mut self, id: &str) -> usize {
        if let Some(&idx) = self.index.get(id) {
            return idx;
        }
        self.prune_finished();
        let idx = self.tracks.len();
        self.tracks.push(TrackRecord {
            id: id.to_string(),
            enqueued: 0,
            rendered: 0,
        });
        self.index.insert(id.to_string(), idx);
        idx
    }

    /// 回收已播放完的块（主线程调用）
    fn compact(&mut self) {
        for _ in 0..self.head {
            self.chunks.pop_front();
        }
        self.head = 0;
    }

    /// 删除没有待播放数据的轨道记录，并重写块里的轨道下标（主线程调用）
    fn prune_finished(&mut self) {
        self.compact();

        let mut live = vec![false; self.tracks.len()];
        for chunk in &self.chunks {
            live[chunk.track] = true;
        }
        if live.iter().all(|&l| l) {
            return;
        }

        let mut remap = vec![usize::MAX; live.len()];
        self.index.clear();
        let records = std::mem::take(&mut self.tracks);
        for (old, record) in records.into_iter().enumerate() {
            if live[old] {
                remap[old] = self.tracks.len();
                self.index.insert(record.id.clone(), self.tracks.len());
                self.tracks.push(record);
            }
        }
        for chunk in self.chunks.iter_mut() {
            chunk.track = remap[chunk.track];
        }
    }

    /// 下一个待渲染采样所属的轨道
    fn active(&self) -> Option<usize> {
        self.chunks.get(self.head).map(|chunk| chunk.track)
    }

    /// 取当前采样并按步长推进；队列为空时返回 None
    ///
    /// `step` 为源采样率 / 设备采样率，只有完整消耗的源采样才计入播放头。
    fn next_sample(&mut self, step: f64) -> Option<f32> {
        let Some(chunk) = self.chunks.get(self.head) else {
            self.phase = 0.0;
            return None;
        };
        let sample = chunk.samples[self.cursor];

        self.phase += step;
        while self.phase >= 1.0 {
            self.phase -= 1.0;
            let Some(chunk) = self.chunks.get(self.head) else {
                self.phase = 0.0;
                break;
            };
            self.tracks[chunk.track].rendered += 1;
            self.cursor += 1;
            if self.cursor >= chunk.samples.len() {
                self.head += 1;
                self.cursor = 0;
            }
        }

        Some(sample)
    }

    fn pending(&self, track: usize) -> u64 {
        self.chunks
            .iter()
            .enumerate()
            .skip(self.head)
            .filter(|(_, chunk)| chunk.track == track)
            .map(|(i, chunk)| {
                let consumed = if i == self.head { self.cursor } else { 0 };
                (chunk.samples.len() - consumed) as u64
            })
            .sum()
    }
}

struct PlaybackShared {
    queue: Mutex<PlaybackQueue>,
    device_lost: AtomicBool,
    /// 监听缓冲已满时丢弃的采样总数
    tap_dropped: AtomicU64,
}

/// 渲染上下文：由设备回调驱动
struct PlaybackRenderer {
    shared: Arc<PlaybackShared>,
    tap: Producer<f32>,
    source_rate: u32,
}

impl PlaybackRenderer {
    fn render(&mut self, output: &mut [f32], format: StreamFormat) {
        let channels = format.channels.max(1) as usize;

        let Ok(mut queue) = self.shared.queue.try_lock() else {
            output.fill(0.0);
            return;
        };
        if format.sample_rate == 0 {
            output.fill(0.0);
            return;
        }

        let step = self.source_rate as f64 / format.sample_rate as f64;
        for frame in output.chunks_mut(channels) {
            match queue.next_sample(step) {
                Some(sample) => {
                    frame.fill(sample);
                    // 监听缓冲满了就丢弃，可视化不影响播放
                    if self.tap.push(sample).is_err() {
                        self.shared.tap_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
                None => frame.fill(0.0),
            }
        }
    }
}

/// 播放端的可视化监听窗口
struct OutputMonitor {
    consumer: Consumer<f32>,
    window: VecDeque<f32>,
    seen_dropped: u64,
}

/// 播放管道
pub struct Player {
    config: PlaybackConfig,
    backend: Arc<dyn AudioBackend>,
    analyzer: FrequencyAnalyzer,
    shared: Arc<PlaybackShared>,
    stream: Option<StreamHandle>,
    monitor: Mutex<Option<OutputMonitor>>,
    events_tx: event_mpsc::UnboundedSender<StreamEvent>,
    events_rx: Option<event_mpsc::UnboundedReceiver<StreamEvent>>,
}

impl Player {
    /// 使用系统默认输出设备创建播放器
    pub fn new(config: PlaybackConfig, analyzer: AnalyzerConfig) -> Result<Self, AudioError> {
        Self::with_backend(config, analyzer, Arc::new(CpalBackend::new()))
    }

    pub fn with_backend(
        config: PlaybackConfig,
        analyzer: AnalyzerConfig,
        backend: Arc<dyn AudioBackend>,
    ) -> Result<Self, AudioError> {
        if config.sample_rate == 0 {
            return Err(AudioError::InvalidFormat("sample rate must be > 0".to_string()));
        }
        let analyzer = FrequencyAnalyzer::new(analyzer, config.sample_rate)?;
        let (events_tx, events_rx) = event_mpsc::unbounded_channel();

        Ok(Self {
            config,
            backend,
            analyzer,
            shared: Arc::new(PlaybackShared {
                queue: Mutex::new(PlaybackQueue::default()),
                device_lost: AtomicBool::new(false),
                tap_dropped: AtomicU64::new(0),
            }),
            stream: None,
            monitor: Mutex::new(None),
            events_tx,
            events_rx: Some(events_rx),
        })
    }

    /// 获取输出设备并启动渲染循环
    pub fn connect(&mut self) -> Result<(), AudioError> {
        if self.stream.is_some() {
            return Ok(());
        }

        self.shared.device_lost.store(false, Ordering::SeqCst);

        let capacity = self.config.tap_capacity.max(self.analyzer.fft_size());
        let (producer, consumer) = RingBuffer::<f32>::new(capacity);

        let mut renderer = PlaybackRenderer {
            shared: self.shared.clone(),
            tap: producer,
            source_rate: self.config.sample_rate,
        };
        let shared = self.shared.clone();
        let events_tx = self.events_tx.clone();

        let stream = self.backend.open_output(
            StreamRequest {
                sample_rate: self.config.sample_rate,
                channels: 1,
            },
            Box::new(move |output: &mut [f32], format: StreamFormat| {
                renderer.render(output, format)
            }),
            Box::new(move |err: AudioError| {
                if !shared.device_lost.swap(true, Ordering::SeqCst) {
                    let _ = events_tx.send(StreamEvent::DeviceLost {
                        message: err.to_string(),
                    });
                }
            }),
        )?;

        tracing::info!(
            "Player connected: {}Hz tracks, device format {:?}",
            self.config.sample_rate,
            stream.format()
        );

        self.stream = Some(stream);
        *self.lock_monitor() = Some(OutputMonitor {
            consumer,
            window: VecDeque::with_capacity(self.analyzer.fft_size()),
            seen_dropped: self.shared.tap_dropped.load(Ordering::Relaxed),
        });
        Ok(())
    }

    /// 停止设备并丢弃所有排队的音频
    pub fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            tracing::info!("Player disconnected");
        }
        *self.lock_monitor() = None;
        *self.lock_queue() = PlaybackQueue::default();
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// 追加一段 16-bit PCM（base64 或原始字节）到指定轨道
    ///
    /// 不会阻塞渲染循环，追加的数据在下一个渲染周期可见。
    pub fn add_16bit_pcm(
        &self,
        payload: impl Into<TransportPayload>,
        track_id: &str,
    ) -> Result<(), AudioError> {
        self.ensure_connected()?;
        let samples = decode_transport(&payload.into())?;
        self.enqueue(track_id, int16_to_float(&samples))
    }

    /// 直接追加录音块（无需重新编码）
    pub fn add_chunk(&self, chunk: &AudioChunk, track_id: &str) -> Result<(), AudioError> {
        self.ensure_connected()?;
        if chunk.channels() != 1 || chunk.sample_rate() != self.config.sample_rate {
            return Err(AudioError::InvalidFormat(format!(
                "expected mono {}Hz, got {}ch {}Hz",
                self.config.sample_rate,
                chunk.channels(),
                chunk.sample_rate()
            )));
        }
        self.enqueue(track_id, int16_to_float(chunk.samples()))
    }

    /// 立即停止当前轨道，返回已渲染的精确偏移并丢弃其未播放的数据
    ///
    /// 没有正在播放的轨道时返回 None。被打断的轨道之后追加的数据会被拒绝。
    pub fn interrupt(&self) -> Option<TrackOffset> {
        let offset = {
            let mut queue = self.lock_queue();
            queue.compact();
            let track = queue.active()?;

            queue.chunks.retain(|chunk| chunk.track != track);
            queue.cursor = 0;
            queue.phase = 0.0;

            let offset = self.offset_of(&queue.tracks[track]);
            queue.interrupted.insert(offset.track_id.clone());
            offset
        };

        tracing::info!(
            "Interrupted track {} at sample {}",
            offset.track_id,
            offset.offset
        );
        Some(offset)
    }

    /// 当前轨道的播放偏移（不打断）
    pub fn track_offset(&self) -> Option<TrackOffset> {
        let queue = self.lock_queue();
        let track = queue.active()?;
        Some(self.offset_of(&queue.tracks[track]))
    }

    pub fn playhead(&self, track_id: &str) -> Option<PlayheadState> {
        let queue = self.lock_queue();
        let &idx = queue.index.get(track_id)?;
        let record = &queue.tracks[idx];
        Some(PlayheadState {
            enqueued: record.enqueued,
            rendered: record.rendered,
        })
    }

    /// 指定轨道尚未渲染的采样数
    pub fn queued_samples(&self, track_id: &str) -> u64 {
        let queue = self.lock_queue();
        match queue.index.get(track_id) {
            Some(&idx) => queue.pending(idx),
            None => 0,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.lock_queue().active().is_some()
    }

    /// 输出端的频谱；空闲时返回全零
    ///
    /// 监听缓冲溢出过时，里面是旧数据，本次返回全零并丢弃，下一次从新数据开始。
    pub fn get_frequencies(&self, mode: AnalysisMode) -> FrequencySnapshot {
        let playing = self.is_playing();

        let mut monitor = self.lock_monitor();
        let Some(monitor) = monitor.as_mut() else {
            return self.analyzer.silence(mode);
        };

        let fft_size = self.analyzer.fft_size();
        while let Ok(sample) = monitor.consumer.pop() {
            if monitor.window.len() == fft_size {
                monitor.window.pop_front();
            }
            monitor.window.push_back(sample);
        }

        let dropped = self.shared.tap_dropped.load(Ordering::Relaxed);
        if !playing || dropped != monitor.seen_dropped {
            monitor.seen_dropped = dropped;
            monitor.window.clear();
            return self.analyzer.silence(mode);
        }

        self.analyzer.analyze(monitor.window.make_contiguous(), mode)
    }

    /// 取出设备事件接收器（只能取一次）
    pub fn take_events(&mut self) -> Option<event_mpsc::UnboundedReceiver<StreamEvent>> {
        self.events_rx.take()
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    fn ensure_connected(&self) -> Result<(), AudioError> {
        if self.stream.is_none() {
            return Err(AudioError::InvalidState(
                "Player not connected: call connect() first".to_string(),
            ));
        }
        Ok(())
    }

    fn enqueue(&self, track_id: &str, samples: Vec<f32>) -> Result<(), AudioError> {
        if samples.is_empty() {
            return Ok(());
        }

        let mut queue = self.lock_queue();
        if queue.interrupted.contains(track_id) {
            tracing::debug!("Ignoring chunk for interrupted track {}", track_id);
            return Err(AudioError::InvalidState(format!(
                "track {} was interrupted",
                track_id
            )));
        }
        queue.compact();
        let track = queue.track_index(track_id);

        queue.tracks[track].enqueued += samples.len() as u64;
        queue.chunks.push_back(QueuedChunk { track, samples });
        Ok(())
    }

    fn offset_of(&self, record: &TrackRecord) -> TrackOffset {
        TrackOffset {
            track_id: record.id.clone(),
            offset: record.rendered,
            current_time: Duration::from_secs_f64(
                record.rendered as f64 / self.config.sample_rate as f64,
            ),
        }
    }

    fn lock_queue(&self) -> MutexGuard<'_, PlaybackQueue> {
        self.shared
            .queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_monitor(&self) -> MutexGuard<'_, Option<OutputMonitor>> {
        self.monitor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::backend::manual::ManualBackend;
    use crate::audio::pcm::{encode_transport, pcm_to_bytes};

    fn player(backend: Arc<ManualBackend>) -> Player {
        let mut player =
            Player::with_backend(PlaybackConfig::default(), AnalyzerConfig::default(), backend)
                .unwrap();
        player.connect().unwrap();
        player
    }

    fn ramp(len: usize) -> Vec<i16> {
        (0..len).map(|i| (i as i16 + 1) * 100).collect()
    }

    fn tone(len: usize) -> Vec<i16> {
        (0..len)
            .map(|i| (2000.0 * (2.0 * std::f32::consts::PI * 600.0 * i as f32 / 24000.0).sin()) as i16)
            .collect()
    }

    #[test]
    fn test_interrupt_reports_rendered_offset() {
        let backend = Arc::new(ManualBackend::new(24000, 1));
        let player = player(backend.clone());

        player
            .add_16bit_pcm(encode_transport(&ramp(100)), "trackA")
            .unwrap();
        backend.pull(40);

        let offset = player.interrupt().unwrap();
        assert_eq!(offset.track_id, "trackA");
        assert_eq!(offset.offset, 40);
        assert_eq!(player.queued_samples("trackA"), 0);

        let after = backend.pull(20);
        assert!(after.iter().all(|&s| s == 0.0));
        assert_eq!(player.playhead("trackA").unwrap().rendered, 40);
        assert!(!player.is_playing());
    }

    #[test]
    fn test_same_track_renders_in_order() {
        let backend = Arc::new(ManualBackend::new(24000, 1));
        let player = player(backend.clone());

        let silence = vec![0i16; 50];
        let rising = ramp(50);
        player.add_16bit_pcm(pcm_to_bytes(&silence), "t").unwrap();
        player.add_16bit_pcm(encode_transport(&rising), "t").unwrap();

        let rendered = backend.pull(100);
        let expected: Vec<f32> = int16_to_float(&[silence, rising].concat());
        assert_eq!(rendered, expected);
        assert_eq!(
            player.playhead("t").unwrap(),
            PlayheadState {
                enqueued: 100,
                rendered: 100
            }
        );
    }

    #[test]
    fn test_interrupt_when_idle_is_none() {
        let backend = Arc::new(ManualBackend::new(24000, 1));
        let player = player(backend.clone());
        assert!(player.interrupt().is_none());

        player.add_16bit_pcm(encode_transport(&ramp(10)), "a").unwrap();
        backend.pull(10);
        assert!(player.interrupt().is_none(), "drained track is not playing");
    }

    #[test]
    fn test_tracks_play_one_after_another() {
        let backend = Arc::new(ManualBackend::new(24000, 1));
        let player = player(backend.clone());

        player.add_16bit_pcm(encode_transport(&ramp(30)), "a").unwrap();
        player.add_16bit_pcm(encode_transport(&ramp(30)), "b").unwrap();
        backend.pull(40);

        let offset = player.track_offset().unwrap();
        assert_eq!(offset.track_id, "b");
        assert_eq!(offset.offset, 10);
        assert_eq!(player.playhead("a").unwrap().rendered, 30);
    }

    #[test]
    fn test_interrupt_keeps_other_tracks_queued() {
        let backend = Arc::new(ManualBackend::new(24000, 1));
        let player = player(backend.clone());

        player.add_16bit_pcm(encode_transport(&ramp(30)), "a").unwrap();
        player.add_16bit_pcm(encode_transport(&ramp(20)), "b").unwrap();
        player.add_16bit_pcm(encode_transport(&ramp(30)), "a").unwrap();
        backend.pull(10);

        let offset = player.interrupt().unwrap();
        assert_eq!((offset.track_id.as_str(), offset.offset), ("a", 10));
        assert_eq!(player.queued_samples("a"), 0);
        assert_eq!(player.queued_samples("b"), 20);

        let next = backend.pull(1);
        assert_eq!(next[0], int16_to_float(&[100])[0], "b starts from its first sample");
    }

    #[test]
    fn test_interrupted_track_rejects_new_chunks() {
        let backend = Arc::new(ManualBackend::new(24000, 1));
        let player = player(backend.clone());

        player.add_16bit_pcm(encode_transport(&ramp(50)), "a").unwrap();
        backend.pull(5);
        player.interrupt().unwrap();

        let late = player.add_16bit_pcm(encode_transport(&ramp(50)), "a");
        assert!(matches!(late, Err(AudioError::InvalidState(_))));
        assert_eq!(player.queued_samples("a"), 0);
        assert!(player.add_16bit_pcm(encode_transport(&ramp(50)), "b").is_ok());
    }

    #[test]
    fn test_add_before_connect_is_invalid() {
        let backend = Arc::new(ManualBackend::new(24000, 1));
        let player =
            Player::with_backend(PlaybackConfig::default(), AnalyzerConfig::default(), backend)
                .unwrap();
        let result = player.add_16bit_pcm(encode_transport(&ramp(10)), "a");
        assert!(matches!(result, Err(AudioError::InvalidState(_))));
    }

    #[test]
    fn test_connect_without_device() {
        let mut player = Player::with_backend(
            PlaybackConfig::default(),
            AnalyzerConfig::default(),
            Arc::new(ManualBackend::unavailable()),
        )
        .unwrap();
        assert!(matches!(player.connect(), Err(AudioError::DeviceUnavailable(_))));
        assert!(!player.is_connected());
    }

    #[test]
    fn test_malformed_payload_queues_nothing() {
        let backend = Arc::new(ManualBackend::new(24000, 1));
        let player = player(backend);
        let result = player.add_16bit_pcm(vec![1u8, 2, 3], "a");
        assert!(matches!(result, Err(AudioError::InvalidFormat(_))));
        assert!(player.playhead("a").is_none());
    }

    #[test]
    fn test_contended_period_renders_silence_without_advancing() {
        let backend = Arc::new(ManualBackend::new(24000, 1));
        let player = player(backend.clone());
        player.add_16bit_pcm(encode_transport(&ramp(20)), "a").unwrap();

        {
            let _guard = player.shared.queue.lock().unwrap();
            let out = backend.pull(10);
            assert!(out.iter().all(|&s| s == 0.0));
        }

        assert_eq!(player.playhead("a").unwrap().rendered, 0);
        backend.pull(5);
        assert_eq!(player.playhead("a").unwrap().rendered, 5);
    }

    #[test]
    fn test_faster_stereo_device_counts_source_samples() {
        let output = StreamFormat {
            sample_rate: 48000,
            channels: 2,
        };
        let backend = Arc::new(ManualBackend::with_formats(output, output));
        let player = player(backend.clone());

        let samples = ramp(100);
        player.add_16bit_pcm(encode_transport(&samples), "a").unwrap();
        let out = backend.pull(80);

        let expected = int16_to_float(&samples);
        for (frame_idx, frame) in out.chunks(2).enumerate() {
            assert_eq!(frame[0], frame[1], "mono duplicated across channels");
            assert_eq!(frame[0], expected[frame_idx / 2]);
        }
        assert_eq!(player.interrupt().unwrap().offset, 40);
    }

    #[test]
    fn test_add_chunk_passthrough() {
        let backend = Arc::new(ManualBackend::new(24000, 1));
        let player = player(backend.clone());

        let chunk = AudioChunk::new(ramp(10), 24000, 1);
        player.add_chunk(&chunk, "echo").unwrap();
        assert_eq!(backend.pull(10), int16_to_float(chunk.samples()));

        let wrong_rate = AudioChunk::new(ramp(10), 16000, 1);
        assert!(matches!(
            player.add_chunk(&wrong_rate, "echo"),
            Err(AudioError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_frequencies_follow_playback() {
        let backend = Arc::new(ManualBackend::new(24000, 1));
        let player = player(backend.clone());
        assert!(player.get_frequencies(AnalysisMode::Voice).is_silent());

        player.add_16bit_pcm(encode_transport(&tone(4096)), "a").unwrap();
        backend.pull(2048);

        let snapshot = player.get_frequencies(AnalysisMode::Voice);
        assert_eq!(snapshot.len(), 24);
        assert!(!snapshot.is_silent());

        player.interrupt().unwrap();
        assert!(player.get_frequencies(AnalysisMode::Voice).is_silent());
    }

    #[test]
    fn test_next_track_spectrum_starts_fresh() {
        let backend = Arc::new(ManualBackend::new(24000, 1));
        let player = player(backend.clone());

        player.add_16bit_pcm(encode_transport(&tone(2048)), "a").unwrap();
        backend.pull(2048);
        assert!(!player.is_playing());
        assert!(player.get_frequencies(AnalysisMode::Frequency).is_silent());

        player.add_16bit_pcm(encode_transport(&[0i16; 200]), "b").unwrap();
        backend.pull(100);
        assert!(player.is_playing());
        assert!(
            player.get_frequencies(AnalysisMode::Frequency).is_silent(),
            "previous track's tone must not leak into the window"
        );
    }

    #[test]
    fn test_overflowed_tap_is_discarded() {
        let backend = Arc::new(ManualBackend::new(24000, 1));
        let player = player(backend.clone());

        player.add_16bit_pcm(encode_transport(&tone(12000)), "a").unwrap();
        backend.pull(9000);
        assert!(player.get_frequencies(AnalysisMode::Frequency).is_silent());

        backend.pull(1024);
        assert!(!player.get_frequencies(AnalysisMode::Frequency).is_silent());
    }

    #[test]
    fn test_finished_tracks_are_released() {
        let backend = Arc::new(ManualBackend::new(24000, 1));
        let player = player(backend.clone());

        player.add_16bit_pcm(encode_transport(&ramp(10)), "a").unwrap();
        backend.pull(10);
        player.add_16bit_pcm(encode_transport(&ramp(10)), "b").unwrap();
        backend.pull(4);
        player.interrupt().unwrap();
        player.add_16bit_pcm(encode_transport(&ramp(10)), "c").unwrap();

        assert!(player.playhead("a").is_none());
        assert!(player.playhead("b").is_none());
        assert_eq!(player.playhead("c").unwrap().enqueued, 10);
        assert_eq!(player.shared.queue.lock().unwrap().tracks.len(), 1);

        let late = player.add_16bit_pcm(encode_transport(&ramp(10)), "b");
        assert!(matches!(late, Err(AudioError::InvalidState(_))), "interrupt is remembered");
        assert!(player.add_16bit_pcm(encode_transport(&ramp(10)), "a").is_ok());
        assert_eq!(player.track_offset().unwrap().track_id, "c");
    }

    #[test]
    fn test_device_loss_reported_once() {
        let backend = Arc::new(ManualBackend::new(24000, 1));
        let mut player = player(backend.clone());
        let mut events = player.take_events().unwrap();

        backend.fail_output("device unplugged");
        backend.fail_output("device unplugged");

        assert_eq!(
            events.try_recv().unwrap(),
            StreamEvent::DeviceLost {
                message: "Stream error: device unplugged".to_string()
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_disconnect_releases_device_and_queue() {
        let backend = Arc::new(ManualBackend::new(24000, 1));
        let mut player = player(backend.clone());
        player.add_16bit_pcm(encode_transport(&ramp(10)), "a").unwrap();

        player.disconnect();
        assert!(!backend.output_open());
        assert!(!player.is_playing());
    }
}
