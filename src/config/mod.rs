// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::detector::DetectorKind;
use crate::device::DeviceId;
use crate::error::DetectorError;

#[derive(Debug, Deserialize, Clone, Serialize, Default, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, Serialize, PartialEq)]
#[serde(default)]
pub struct DetectorConfig {
    pub model_path: PathBuf,
    pub kind: DetectorKind,
    pub device_id: DeviceId,
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
    /// 每张图像保留的候选框上限
    pub max_objects: usize,
    /// 模型批次维为动态时使用的最大批大小
    pub max_batch_size: usize,
    /// 预处理等待资源池槽位的超时（毫秒）
    pub acquire_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone, Serialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub ansi: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/yolov5s.onnx"),
            kind: DetectorKind::V5,
            device_id: DeviceId(0),
            confidence_threshold: 0.25,
            nms_threshold: 0.5,
            max_objects: 1024,
            max_batch_size: 16,
            acquire_timeout_ms: 10_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            ansi: true,
        }
    }
}

impl DetectorConfig {
    pub fn validate(&self) -> Result<(), DetectorError> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(DetectorError::ConfigError(format!(
                "confidence_threshold must be within [0, 1], got {}",
                self.confidence_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.nms_threshold) {
            return Err(DetectorError::ConfigError(format!(
                "nms_threshold must be within [0, 1], got {}",
                self.nms_threshold
            )));
        }
        if self.max_objects == 0 {
            return Err(DetectorError::ConfigError(
                "max_objects must be greater than 0".to_string(),
            ));
        }
        if self.max_batch_size == 0 {
            return Err(DetectorError::ConfigError(
                "max_batch_size must be greater than 0".to_string(),
            ));
        }
        if !self.device_id.is_valid() {
            return Err(DetectorError::ConfigError(format!(
                "device_id {} is out of range",
                self.device_id
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
    env_prefix: String,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            config_path: None,
            env_prefix: "BATCHDET".to_string(),
        }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn with_env_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// 默认值 < 配置文件 < 环境变量
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        dotenvy::dotenv().ok();

        let defaults = DetectorConfig::default();
        let mut config = config::Config::builder();

        config = config.set_default(
            "detector.model_path",
            defaults.model_path.to_string_lossy().as_ref(),
        )?;
        config = config.set_default("detector.kind", defaults.kind.as_str())?;
        config = config.set_default("detector.device_id", defaults.device_id.0 as i64)?;
        config = config.set_default(
            "detector.confidence_threshold",
            defaults.confidence_threshold as f64,
        )?;
        config = config.set_default("detector.nms_threshold", defaults.nms_threshold as f64)?;
        config = config.set_default("detector.max_objects", defaults.max_objects as i64)?;
        config = config.set_default("detector.max_batch_size", defaults.max_batch_size as i64)?;
        config = config.set_default(
            "detector.acquire_timeout_ms",
            defaults.acquire_timeout_ms as i64,
        )?;

        config = config.set_default("logging.level", "info")?;
        config = config.set_default("logging.ansi", true)?;

        match &self.config_path {
            Some(path) if path.exists() => {
                config = config.add_source(config::File::from(path.as_path()));
            }
            Some(path) => {
                return Err(ConfigError::Message(format!(
                    "Config file not found: {:?}",
                    path
                )));
            }
            None => {
                let default_config = PathBuf::from("batchdet.toml");
                if default_config.exists() {
                    config = config.add_source(config::File::with_name("batchdet"));
                }
            }
        }

        config = config.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .prefix_separator("_")
                .separator("__")
                .ignore_empty(true),
        );

        config.build()?.try_deserialize().map_err(ConfigError::from)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Message(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Message(e.to_string())
    }
}

impl From<ConfigError> for DetectorError {
    fn from(e: ConfigError) -> Self {
        DetectorError::ConfigError(e.to_string())
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    pub fn load_with_path<P: Into<PathBuf>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::new().with_config_path(path).load()
    }

    /// 直接解析 TOML 文本（不叠加环境变量）
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    pub fn save_to_file<P: Into<PathBuf>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = self.to_toml_string().map_err(std::io::Error::other)?;
        std::fs::write(path.into(), content)
    }
}
