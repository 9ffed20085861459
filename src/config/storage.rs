use std::fs;
use std::path::{Path, PathBuf};

use crate::config::settings::AudioConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config directory not found")]
    DirNotFound,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// 获取配置文件路径
fn get_config_path() -> Result<PathBuf, ConfigError> {
    let config_dir = dirs::config_dir().ok_or(ConfigError::DirNotFound)?;
    let app_dir = config_dir.join("voxlink");
    fs::create_dir_all(&app_dir)?;
    Ok(app_dir.join("audio.json"))
}

/// 加载配置
pub fn load_config() -> Result<AudioConfig, ConfigError> {
    load_config_from(&get_config_path()?)
}

/// 从指定路径加载配置，文件不存在时返回默认配置
pub fn load_config_from(path: &Path) -> Result<AudioConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!("No config at {:?}, using defaults", path);
        return Ok(AudioConfig::default());
    }

    let content = fs::read_to_string(path)?;
    let config: AudioConfig = serde_json::from_str(&content)?;

    Ok(config)
}

/// 保存配置
pub fn save_config(config: &AudioConfig) -> Result<(), ConfigError> {
    save_config_to(config, &get_config_path()?)
}

pub fn save_config_to(config: &AudioConfig, path: &Path) -> Result<(), ConfigError> {
    tracing::info!("Saving config to: {:?}", path);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(config)?;
    fs::write(path, &content)?;
    tracing::info!("Config saved successfully");
    Ok(())
}
