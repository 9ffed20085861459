//! FFI 层 - 为原生宿主提供 C 接口
//!
//! # 内存管理约定
//! - 所有返回的字符串由调用方负责释放，使用 `voxlink_string_free`
//! - Handle 由 `voxlink_create` 创建，`voxlink_destroy` 销毁
//!
//! # 线程安全
//! - 所有函数都应在宿主的主线程调用
//! - 录音回调会在后台线程调用，宿主需要自行切回主线程

use std::ffi::{c_char, c_void, CStr, CString};
use std::ptr;
use std::sync::{Mutex, MutexGuard};

use crate::audio::{AudioChunk, Player, Recorder};
use crate::config::AudioConfig;

// ============================================================================
// Handle 定义
// ============================================================================

/// 不透明句柄，持有一个录音器和一个播放器
pub struct VoxlinkHandle {
    recorder: Mutex<Recorder>,
    player: Mutex<Player>,
}

impl VoxlinkHandle {
    fn recorder(&self) -> MutexGuard<'_, Recorder> {
        self.recorder
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn player(&self) -> MutexGuard<'_, Player> {
        self.player
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ============================================================================
// 回调类型
// ============================================================================

/// 录音块回调
/// - context: 用户传入的上下文指针
/// - samples: 单声道 16-bit PCM，仅在回调期间有效
/// - len: 采样数
pub type VoxlinkChunkCallback =
    extern "C" fn(context: *mut c_void, samples: *const i16, len: usize);

// ============================================================================
// FFI 函数
// ============================================================================

/// 创建 Voxlink 实例
///
/// # 参数
/// - config_json: JSON 格式的音频配置，可以为 NULL（使用默认配置）
///
/// # 返回
/// - 成功返回 Handle 指针
/// - 失败返回 NULL
#[no_mangle]
pub extern "C" fn voxlink_create(config_json: *const c_char) -> *mut VoxlinkHandle {
    let config = if config_json.is_null() {
        AudioConfig::default()
    } else {
        let c_str = unsafe { CStr::from_ptr(config_json) };
        match c_str.to_str() {
            Ok(json) => match serde_json::from_str(json) {
                Ok(cfg) => cfg,
                Err(e) => {
                    tracing::error!("Failed to parse config JSON: {}", e);
                    return ptr::null_mut();
                }
            },
            Err(e) => {
                tracing::error!("Invalid UTF-8 in config: {}", e);
                return ptr::null_mut();
            }
        }
    };

    let AudioConfig {
        capture,
        playback,
        analyzer,
    } = config;

    let recorder = match Recorder::new(capture, analyzer.clone()) {
        Ok(recorder) => recorder,
        Err(e) => {
            tracing::error!("Failed to create Recorder: {}", e);
            return ptr::null_mut();
        }
    };
    let player = match Player::new(playback, analyzer) {
        Ok(player) => player,
        Err(e) => {
            tracing::error!("Failed to create Player: {}", e);
            return ptr::null_mut();
        }
    };

    Box::into_raw(Box::new(VoxlinkHandle {
        recorder: Mutex::new(recorder),
        player: Mutex::new(player),
    }))
}

/// 销毁 Voxlink 实例，释放所有设备
///
/// # 安全
/// - handle 必须是 `voxlink_create` 返回的有效指针
/// - 调用后 handle 不可再使用
#[no_mangle]
pub extern "C" fn voxlink_destroy(handle: *mut VoxlinkHandle) {
    if !handle.is_null() {
        unsafe {
            drop(Box::from_raw(handle));
        }
    }
}

/// 获取麦克风并进入暂停状态
///
/// # 返回
/// - 0: 成功
/// - -1: handle 无效
/// - -2: 设备不可用
#[no_mangle]
pub extern "C" fn voxlink_recorder_begin(handle: *mut VoxlinkHandle) -> i32 {
    if handle.is_null() {
        return -1;
    }

    let handle = unsafe { &*handle };

    match handle.recorder().begin() {
        Ok(_) => 0,
        Err(e) => {
            tracing::error!("Failed to begin recording session: {}", e);
            -2
        }
    }
}

/// 开始录音
///
/// # 参数
/// - handle: Voxlink 实例
/// - callback: 每个处理周期调用一次
/// - context: 传递给回调的用户上下文
///
/// # 返回
/// - 0: 成功
/// - -1: handle 无效
/// - -2: 未调用 begin 或已在录音
#[no_mangle]
pub extern "C" fn voxlink_recorder_record(
    handle: *mut VoxlinkHandle,
    callback: VoxlinkChunkCallback,
    context: *mut c_void,
) -> i32 {
    if handle.is_null() {
        return -1;
    }

    let handle = unsafe { &*handle };

    // context 指针转为 usize 以满足 Send 约束
    let context_usize = context as usize;

    let result = handle.recorder().record(move |chunk: AudioChunk| {
        let ctx = context_usize as *mut c_void;
        let samples = chunk.samples();
        callback(ctx, samples.as_ptr(), samples.len());
    });

    match result {
        Ok(_) => 0,
        Err(e) => {
            tracing::error!("Failed to start recording: {}", e);
            -2
        }
    }
}

/// 暂停录音
///
/// # 返回
/// - 0: 成功
/// - -1: handle 无效
/// - -2: 会话未开始
#[no_mangle]
pub extern "C" fn voxlink_recorder_pause(handle: *mut VoxlinkHandle) -> i32 {
    if handle.is_null() {
        return -1;
    }

    let handle = unsafe { &*handle };

    match handle.recorder().pause() {
        Ok(_) => 0,
        Err(e) => {
            tracing::error!("Failed to pause recording: {}", e);
            -2
        }
    }
}

/// 结束录音会话并释放麦克风
///
/// # 返回
/// - 0: 成功
/// - -1: handle 无效
/// - -2: 会话未开始
#[no_mangle]
pub extern "C" fn voxlink_recorder_end(handle: *mut VoxlinkHandle) -> i32 {
    if handle.is_null() {
        return -1;
    }

    let handle = unsafe { &*handle };

    match handle.recorder().end() {
        Ok(_) => 0,
        Err(e) => {
            tracing::error!("Failed to end recording session: {}", e);
            -2
        }
    }
}

/// 获取录音状态
///
/// # 返回
/// - 0: 已结束 (Ended)
/// - 1: 暂停 (Paused)
/// - 2: 录音中 (Recording)
/// - -1: handle 无效
#[no_mangle]
pub extern "C" fn voxlink_recorder_status(handle: *mut VoxlinkHandle) -> i32 {
    if handle.is_null() {
        return -1;
    }

    let handle = unsafe { &*handle };
    handle.recorder().status() as i32
}

/// 获取输出设备并启动播放循环
///
/// # 返回
/// - 0: 成功
/// - -1: handle 无效
/// - -2: 设备不可用
#[no_mangle]
pub extern "C" fn voxlink_player_connect(handle: *mut VoxlinkHandle) -> i32 {
    if handle.is_null() {
        return -1;
    }

    let handle = unsafe { &*handle };

    match handle.player().connect() {
        Ok(_) => 0,
        Err(e) => {
            tracing::error!("Failed to connect player: {}", e);
            -2
        }
    }
}

/// 追加一段 base64 编码的 16-bit PCM 到指定轨道
///
/// # 返回
/// - 0: 成功
/// - -1: handle 或参数无效
/// - -2: 未连接、数据无效或轨道已被打断
#[no_mangle]
pub extern "C" fn voxlink_player_add_pcm(
    handle: *mut VoxlinkHandle,
    base64: *const c_char,
    track_id: *const c_char,
) -> i32 {
    if handle.is_null() || base64.is_null() || track_id.is_null() {
        return -1;
    }

    let handle = unsafe { &*handle };

    let payload = match unsafe { CStr::from_ptr(base64) }.to_str() {
        Ok(s) => s,
        Err(_) => return -1,
    };
    let track_id = match unsafe { CStr::from_ptr(track_id) }.to_str() {
        Ok(s) => s,
        Err(_) => return -1,
    };

    match handle.player().add_16bit_pcm(payload, track_id) {
        Ok(_) => 0,
        Err(e) => {
            tracing::error!("Failed to queue audio for track {}: {}", track_id, e);
            -2
        }
    }
}

/// 打断当前轨道
///
/// # 参数
/// - out_offset: 可为 NULL；非 NULL 时写入已播放的采样数
///
/// # 返回
/// - 被打断的轨道 ID，需用 `voxlink_string_free` 释放
/// - 没有正在播放的轨道时返回 NULL
#[no_mangle]
pub extern "C" fn voxlink_player_interrupt(
    handle: *mut VoxlinkHandle,
    out_offset: *mut u64,
) -> *mut c_char {
    if handle.is_null() {
        return ptr::null_mut();
    }

    let handle = unsafe { &*handle };

    let Some(offset) = handle.player().interrupt() else {
        return ptr::null_mut();
    };

    if !out_offset.is_null() {
        unsafe {
            *out_offset = offset.offset;
        }
    }

    match CString::new(offset.track_id) {
        Ok(id) => id.into_raw(),
        Err(e) => {
            tracing::error!("Track id is not a valid C string: {}", e);
            ptr::null_mut()
        }
    }
}

/// 释放由 FFI 返回的字符串
///
/// # 安全
/// - 只能释放由本库返回的字符串
#[no_mangle]
pub extern "C" fn voxlink_string_free(s: *mut c_char) {
    if !s.is_null() {
        unsafe {
            drop(CString::from_raw(s));
        }
    }
}

/// 获取版本号
#[no_mangle]
pub extern "C" fn voxlink_version() -> *const c_char {
    static VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "\0");
    VERSION.as_ptr() as *const c_char
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_handle_is_rejected() {
        assert_eq!(voxlink_recorder_begin(ptr::null_mut()), -1);
        assert_eq!(voxlink_recorder_status(ptr::null_mut()), -1);
        assert_eq!(voxlink_player_connect(ptr::null_mut()), -1);
        assert!(voxlink_player_interrupt(ptr::null_mut(), ptr::null_mut()).is_null());
    }

    #[test]
    fn test_invalid_config_json() {
        let json = CString::new("{ not json").unwrap();
        assert!(voxlink_create(json.as_ptr()).is_null());
    }

    #[test]
    fn test_lifecycle_without_devices() {
        let handle = voxlink_create(ptr::null());
        assert!(!handle.is_null());
        assert_eq!(voxlink_recorder_status(handle), 0);
        assert_eq!(voxlink_recorder_pause(handle), -2, "pause before begin");

        let data = CString::new("AAA=").unwrap();
        let track = CString::new("a").unwrap();
        assert_eq!(
            voxlink_player_add_pcm(handle, data.as_ptr(), track.as_ptr()),
            -2,
            "add before connect"
        );
        assert!(voxlink_player_interrupt(handle, ptr::null_mut()).is_null());

        voxlink_destroy(handle);
    }

    #[test]
    fn test_version_is_c_string() {
        let version = unsafe { CStr::from_ptr(voxlink_version()) };
        assert_eq!(version.to_str().unwrap(), env!("CARGO_PKG_VERSION"));
    }
}
