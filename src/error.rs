// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 错误类型与错误上报
//!
//! - `DetectorError`: 可恢复错误，通过 `Result` 返回
//! - `FatalError`: 不可恢复的环境错误（显存分配失败、流创建失败、前向推理被拒绝）
//! - `ErrorReporter`: 可注入的上报接口，默认实现记录日志后以 `FatalError` 为载荷 panic，
//!   宿主程序可以在顶层用 `catch_unwind` 捕获

use std::sync::{Arc, OnceLock};
use thiserror::Error;

use crate::device::DeviceId;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Model load error: {0}")]
    ModelLoadError(String),

    #[error("Unsupported detector kind: {0}")]
    UnsupportedKind(String),

    #[error("Inference error: {0}")]
    InferenceError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not ready: {0}")]
    NotReady(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// 内存所在的一侧
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemorySide {
    Host,
    Device,
}

impl std::fmt::Display for MemorySide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemorySide::Host => write!(f, "host"),
            MemorySide::Device => write!(f, "device"),
        }
    }
}

/// 不可恢复错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FatalError {
    #[error("Failed to allocate {bytes} bytes of {side} memory on device {device}")]
    Allocation {
        side: MemorySide,
        bytes: usize,
        device: DeviceId,
    },

    #[error("Failed to create stream on device {0}")]
    StreamCreation(DeviceId),

    #[error("Forward pass rejected: {0}")]
    ForwardRejected(String),
}

/// 错误上报接口
pub trait ErrorReporter: Send + Sync {
    /// 上报可恢复错误，调用方随后通过返回值继续处理
    fn recoverable(&self, error: &DetectorError);

    /// 上报不可恢复错误，不会返回
    fn fatal(&self, error: FatalError) -> !;
}

/// 默认上报器：tracing 日志 + panic
#[derive(Debug, Default)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn recoverable(&self, error: &DetectorError) {
        tracing::warn!("{}", error);
    }

    fn fatal(&self, error: FatalError) -> ! {
        tracing::error!("Fatal: {}", error);
        std::panic::panic_any(error)
    }
}

static REPORTER: OnceLock<Arc<dyn ErrorReporter>> = OnceLock::new();

/// 安装进程级上报器，只能安装一次；已安装时返回 false
pub fn install_reporter(reporter: Arc<dyn ErrorReporter>) -> bool {
    REPORTER.set(reporter).is_ok()
}

fn reporter() -> &'static Arc<dyn ErrorReporter> {
    REPORTER.get_or_init(|| Arc::new(TracingReporter))
}

/// 上报可恢复错误
pub fn report(error: &DetectorError) {
    reporter().recoverable(error);
}

/// 上报不可恢复错误
pub fn fatal(error: FatalError) -> ! {
    reporter().fatal(error)
}
