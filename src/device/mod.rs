// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 设备运行时
//!
//! 提供检测流水线所依赖的设备抽象：
//! - DeviceId / DeviceGuard: 线程级“当前设备”及其作用域获取与恢复
//! - Stream: 有序执行队列，同一流上的拷贝与核函数按提交顺序执行
//! - MixedMemory: 主机/设备混合内存块
//! - Tensor: 基于 MixedMemory 的形状视图
//! - MonopolyPool: 有界独占资源池

pub mod memory;
pub mod monopoly;
pub mod tensor;

pub use memory::MixedMemory;
pub use monopoly::{MonopolyPool, PoolSlot};
pub use tensor::{DataHead, Tensor};

use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::trace;

use crate::error::{FatalError, fatal};

/// 设备运行时可见的设备序号上限
pub const MAX_DEVICES: u32 = 16;

/// 设备序号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub u32);

impl DeviceId {
    pub fn is_valid(&self) -> bool {
        self.0 < MAX_DEVICES
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

thread_local! {
    static CURRENT_DEVICE: Cell<DeviceId> = const { Cell::new(DeviceId(0)) };
}

/// 获取当前线程的设备
pub fn current_device() -> DeviceId {
    CURRENT_DEVICE.with(|d| d.get())
}

/// 设置当前线程的设备（不恢复），worker 线程启动时使用
pub fn set_device(device: DeviceId) {
    CURRENT_DEVICE.with(|d| d.set(device));
}

/// 作用域设备守卫
///
/// 创建时切换到目标设备，Drop 时恢复调用方原来的设备，
/// 提前返回和错误路径同样会恢复。
#[must_use = "the previous device is restored when the guard is dropped"]
pub struct DeviceGuard {
    previous: DeviceId,
}

impl DeviceGuard {
    pub fn enter(device: DeviceId) -> Self {
        let previous = CURRENT_DEVICE.with(|d| d.replace(device));
        Self { previous }
    }

    pub fn previous(&self) -> DeviceId {
        self.previous
    }
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        CURRENT_DEVICE.with(|d| d.set(self.previous));
    }
}

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

struct StreamInner {
    id: u64,
    device: DeviceId,
    /// 已执行的操作数；锁本身保证同一流上的操作互斥且按获取顺序执行
    launched: Mutex<u64>,
}

/// 执行流
///
/// 主机设备运行时中，流上的工作在 `launch` 内联执行，
/// 流锁保证跨线程提交的操作按提交顺序逐个完成。
///
/// 限制：`launch` 在返回前持有流锁，因此提交线程的预处理会等待同一流上
/// worker 正在执行的解码与 NMS 完成。前向推理不经过流锁，仍与预处理重叠。
#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

impl Stream {
    /// 创建新的流，设备序号无效时为致命错误
    pub fn new(device: DeviceId) -> Self {
        if !device.is_valid() {
            fatal(FatalError::StreamCreation(device));
        }

        let id = NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed);
        trace!("Created stream {} on device {}", id, device);

        Self {
            inner: Arc::new(StreamInner {
                id,
                device,
                launched: Mutex::new(0),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn device(&self) -> DeviceId {
        self.inner.device
    }

    /// 在流上执行一个操作（拷贝或核函数）
    pub fn launch<R>(&self, op: impl FnOnce() -> R) -> R {
        let _device = DeviceGuard::enter(self.inner.device);
        let mut launched = self
            .inner
            .launched
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *launched += 1;
        op()
    }

    /// 等待流上已提交的操作全部完成
    pub fn synchronize(&self) {
        drop(
            self.inner
                .launched
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
    }

    /// 已执行的操作数
    pub fn launched(&self) -> u64 {
        *self
            .inner
            .launched
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl PartialEq for Stream {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Stream {}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.inner.id)
            .field("device", &self.inner.device)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_guard_restores_previous() {
        set_device(DeviceId(0));
        {
            let guard = DeviceGuard::enter(DeviceId(2));
            assert_eq!(guard.previous(), DeviceId(0));
            assert_eq!(current_device(), DeviceId(2));
            {
                let _inner = DeviceGuard::enter(DeviceId(5));
                assert_eq!(current_device(), DeviceId(5));
            }
            assert_eq!(current_device(), DeviceId(2));
        }
        assert_eq!(current_device(), DeviceId(0));
    }

    #[test]
    fn test_device_guard_restores_on_early_return() {
        fn fallible(device: DeviceId) -> Result<(), ()> {
            let _guard = DeviceGuard::enter(device);
            Err(())
        }

        set_device(DeviceId(1));
        assert!(fallible(DeviceId(7)).is_err());
        assert_eq!(current_device(), DeviceId(1));
    }

    #[test]
    fn test_stream_launch_runs_on_stream_device() {
        set_device(DeviceId(0));
        let stream = Stream::new(DeviceId(3));

        let seen = stream.launch(current_device);
        assert_eq!(seen, DeviceId(3));
        assert_eq!(current_device(), DeviceId(0));
        assert_eq!(stream.launched(), 1);
    }

    #[test]
    fn test_stream_equality_is_identity() {
        let a = Stream::new(DeviceId(0));
        let b = Stream::new(DeviceId(0));
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }

    #[test]
    fn test_invalid_device_stream_is_fatal() {
        let result = std::panic::catch_unwind(|| {
            let _ = Stream::new(DeviceId(MAX_DEVICES));
        });
        assert!(result.is_err());
    }
}
