// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::ptr::NonNull;
use tracing::{debug, trace};

use super::{DeviceGuard, DeviceId};
use crate::error::{FatalError, MemorySide, fatal};

/// 分配对齐（字节），满足页锁定内存和设备内存的对齐要求
pub const MEMORY_ALIGNMENT: usize = 256;

/// 自有分配，Drop 时释放
struct Allocation {
    ptr: NonNull<u8>,
    layout: Layout,
    len: usize,
}

impl Allocation {
    /// 分配并清零，失败为致命错误
    fn zeroed(len: usize, side: MemorySide, device: DeviceId) -> Self {
        let failure = || FatalError::Allocation {
            side,
            bytes: len,
            device,
        };

        let layout = Layout::from_size_align(len.max(1), MEMORY_ALIGNMENT)
            .unwrap_or_else(|_| fatal(failure()));

        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).unwrap_or_else(|| fatal(failure()));

        Self { ptr, layout, len }
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        // SAFETY: ptr was returned by alloc_zeroed with exactly this layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// 内存区域：未分配 / 自有 / 借用的外部缓冲区
///
/// 借用区域永远不会被释放，release 只会遗忘该引用。
enum Region {
    Empty,
    Owned(Allocation),
    Borrowed { ptr: NonNull<u8>, len: usize },
}

impl Region {
    fn capacity(&self) -> usize {
        match self {
            Region::Empty => 0,
            Region::Owned(allocation) => allocation.len,
            Region::Borrowed { len, .. } => *len,
        }
    }

    fn is_owned(&self) -> bool {
        !matches!(self, Region::Borrowed { .. })
    }

    fn as_slice(&self) -> &[u8] {
        match self {
            Region::Empty => &[],
            // SAFETY: the region is valid for `len` bytes while it is held.
            Region::Owned(allocation) => unsafe {
                std::slice::from_raw_parts(allocation.ptr.as_ptr(), allocation.len)
            },
            Region::Borrowed { ptr, len } => unsafe {
                std::slice::from_raw_parts(ptr.as_ptr(), *len)
            },
        }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Region::Empty => &mut [],
            // SAFETY: the region is valid for `len` bytes and `&mut self` is exclusive.
            Region::Owned(allocation) => unsafe {
                std::slice::from_raw_parts_mut(allocation.ptr.as_ptr(), allocation.len)
            },
            Region::Borrowed { ptr, len } => unsafe {
                std::slice::from_raw_parts_mut(ptr.as_ptr(), *len)
            },
        }
    }
}

/// 主机/设备混合内存块
///
/// 两侧各自按需增长：只有请求超过当前容量时才重新分配（新分配清零），
/// 从不隐式收缩。所有分配和释放都在本块所属设备上进行，结束后恢复调用方的设备。
pub struct MixedMemory {
    device_id: DeviceId,
    host: Region,
    device: Region,
}

// SAFETY: owned regions are plain heap allocations exclusively held by this block.
// Borrowed regions are only installed through `reference`, whose contract requires
// the caller to keep them valid and unaliased for as long as they are referenced.
unsafe impl Send for MixedMemory {}
unsafe impl Sync for MixedMemory {}

impl MixedMemory {
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            host: Region::Empty,
            device: Region::Empty,
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// 获取至少 `size` 字节的主机缓冲区
    pub fn host(&mut self, size: usize) -> &mut [u8] {
        if self.host.capacity() < size {
            let _device = DeviceGuard::enter(self.device_id);
            self.host = Region::Empty;
            self.host = Region::Owned(Allocation::zeroed(size, MemorySide::Host, self.device_id));
            trace!("Grew host memory to {} bytes on device {}", size, self.device_id);
        }
        &mut self.host.as_mut_slice()[..size]
    }

    /// 获取至少 `size` 字节的设备缓冲区
    pub fn device(&mut self, size: usize) -> &mut [u8] {
        if self.device.capacity() < size {
            let _device = DeviceGuard::enter(self.device_id);
            self.device = Region::Empty;
            self.device = Region::Owned(Allocation::zeroed(
                size,
                MemorySide::Device,
                self.device_id,
            ));
            trace!("Grew device memory to {} bytes on device {}", size, self.device_id);
        }
        &mut self.device.as_mut_slice()[..size]
    }

    /// 当前主机侧全部容量（不增长）
    pub fn host_slice(&self) -> &[u8] {
        self.host.as_slice()
    }

    /// 当前设备侧全部容量（不增长）
    pub fn device_slice(&self) -> &[u8] {
        self.device.as_slice()
    }

    pub fn host_capacity(&self) -> usize {
        self.host.capacity()
    }

    pub fn device_capacity(&self) -> usize {
        self.device.capacity()
    }

    pub fn owns_host(&self) -> bool {
        self.host.is_owned()
    }

    pub fn owns_device(&self) -> bool {
        self.device.is_owned()
    }

    /// 将主机侧前 `size` 字节拷贝到设备侧
    pub fn upload(&mut self, size: usize) {
        self.device(size);
        let src = &self.host.as_slice()[..size.min(self.host.capacity())];
        self.device.as_mut_slice()[..src.len()].copy_from_slice(src);
    }

    /// 将设备侧前 `size` 字节拷贝到主机侧
    pub fn download(&mut self, size: usize) {
        self.host(size);
        let src = &self.device.as_slice()[..size.min(self.device.capacity())];
        self.host.as_mut_slice()[..src.len()].copy_from_slice(src);
    }

    pub fn release_host(&mut self) {
        let _device = DeviceGuard::enter(self.device_id);
        self.host = Region::Empty;
    }

    pub fn release_device(&mut self) {
        let _device = DeviceGuard::enter(self.device_id);
        self.device = Region::Empty;
    }

    pub fn release_all(&mut self) {
        self.release_host();
        self.release_device();
    }

    /// 引用外部缓冲区
    ///
    /// 先释放两侧已有内存，再把提供的一侧（指针非空且大小非零）标记为借用。
    ///
    /// # Safety
    ///
    /// 每个提供的区域必须在被引用期间保持有效、可读写、按 4 字节对齐，
    /// 且不被其他代码同时访问。
    pub unsafe fn reference(
        &mut self,
        host: Option<(NonNull<u8>, usize)>,
        device: Option<(NonNull<u8>, usize)>,
    ) {
        self.release_all();

        if let Some((ptr, len)) = host
            && len > 0
        {
            self.host = Region::Borrowed { ptr, len };
        }

        if let Some((ptr, len)) = device
            && len > 0
        {
            self.device = Region::Borrowed { ptr, len };
        }

        debug!(
            "Referenced external memory on device {}: host={} bytes, device={} bytes",
            self.device_id,
            self.host.capacity(),
            self.device.capacity()
        );
    }
}

impl Drop for MixedMemory {
    fn drop(&mut self) {
        self.release_all();
    }
}

impl std::fmt::Debug for MixedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MixedMemory")
            .field("device_id", &self.device_id)
            .field("host_capacity", &self.host.capacity())
            .field("owns_host", &self.host.is_owned())
            .field("device_capacity", &self.device.capacity())
            .field("owns_device", &self.device.is_owned())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grows_only_when_needed() {
        let mut memory = MixedMemory::new(DeviceId(0));
        assert_eq!(memory.host_capacity(), 0);

        memory.host(64)[0] = 7;
        assert_eq!(memory.host_capacity(), 64);

        // 更小的请求不重新分配，数据保留
        assert_eq!(memory.host(16)[0], 7);
        assert_eq!(memory.host_capacity(), 64);

        // 更大的请求重新分配并清零
        assert!(memory.host(128).iter().all(|&b| b == 0));
        assert_eq!(memory.host_capacity(), 128);
    }

    #[test]
    fn test_allocation_is_aligned() {
        let mut memory = MixedMemory::new(DeviceId(0));
        let ptr = memory.device(10).as_ptr() as usize;
        assert_eq!(ptr % MEMORY_ALIGNMENT, 0);
    }

    #[test]
    fn test_upload_download() {
        let mut memory = MixedMemory::new(DeviceId(1));
        memory.host(4).copy_from_slice(&[1, 2, 3, 4]);
        memory.upload(4);
        assert_eq!(&memory.device_slice()[..4], &[1, 2, 3, 4]);

        memory.device(4)[0] = 9;
        memory.download(4);
        assert_eq!(&memory.host_slice()[..4], &[9, 2, 3, 4]);
    }

    #[test]
    fn test_reference_is_never_freed() {
        let mut external = vec![5u8; 32];
        let mut memory = MixedMemory::new(DeviceId(0));

        let ptr = NonNull::new(external.as_mut_ptr()).unwrap();
        unsafe { memory.reference(Some((ptr, external.len())), None) };

        assert!(!memory.owns_host());
        assert!(memory.owns_device());
        assert_eq!(memory.host_slice()[0], 5);

        memory.release_all();
        assert_eq!(memory.host_capacity(), 0);
        drop(memory);

        // 外部缓冲区仍然有效
        assert!(external.iter().all(|&b| b == 5));
    }

    #[test]
    fn test_borrowed_side_replaced_when_too_small() {
        let mut external = vec![1u8; 8];
        let mut memory = MixedMemory::new(DeviceId(0));

        let ptr = NonNull::new(external.as_mut_ptr()).unwrap();
        unsafe { memory.reference(None, Some((ptr, external.len()))) };
        assert!(!memory.owns_device());

        memory.device(64);
        assert!(memory.owns_device());
        assert_eq!(memory.device_capacity(), 64);
        assert!(external.iter().all(|&b| b == 1));
    }
}
