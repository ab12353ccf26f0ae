// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use half::f16;
use std::sync::{Arc, Mutex};
use tracing::{trace, warn};

use super::memory::MixedMemory;
use super::{DeviceGuard, DeviceId, Stream};
use crate::error::DetectorError;

const ELEMENT_SIZE: usize = std::mem::size_of::<f32>();

/// 数据当前的权威位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataHead {
    /// 尚未物化
    Init,
    Host,
    Device,
}

fn as_f32(bytes: &[u8]) -> &[f32] {
    if bytes.is_empty() {
        return &[];
    }
    bytemuck::cast_slice(bytes)
}

fn as_f32_mut(bytes: &mut [u8]) -> &mut [f32] {
    if bytes.is_empty() {
        return &mut [];
    }
    bytemuck::cast_slice_mut(bytes)
}

/// 在流上执行；没有流时在张量所属设备上内联执行
fn run_on<R>(stream: Option<&Stream>, device: DeviceId, op: impl FnOnce() -> R) -> R {
    match stream {
        Some(stream) => stream.launch(op),
        None => {
            let _device = DeviceGuard::enter(device);
            op()
        }
    }
}

/// f32 张量
///
/// 形状视图 + 自有 MixedMemory + 可选的共享工作区。
/// `head` 记录最近一次写入落在哪一侧，读取另一侧前必须先通过
/// `to_host` / `to_device` 物化。
pub struct Tensor {
    shape: Vec<usize>,
    /// 行主序步长（元素）
    strides: Vec<usize>,
    bytes: usize,
    head: DataHead,
    device: DeviceId,
    stream: Option<Stream>,
    data: MixedMemory,
    workspace: Option<Arc<Mutex<MixedMemory>>>,
}

impl Tensor {
    /// 创建空张量
    pub fn new(device: DeviceId) -> Self {
        Self {
            shape: Vec::new(),
            strides: Vec::new(),
            bytes: 0,
            head: DataHead::Init,
            device,
            stream: None,
            data: MixedMemory::new(device),
            workspace: None,
        }
    }

    /// 创建指定形状的张量（不分配内存，首次物化时分配）
    pub fn with_dims(dims: &[usize], device: DeviceId) -> Self {
        let mut tensor = Self::new(device);
        tensor.resize(dims);
        tensor
    }

    /// 从主机数据创建张量
    pub fn from_host(dims: &[usize], values: &[f32], device: DeviceId) -> Result<Self, DetectorError> {
        let mut tensor = Self::with_dims(dims, device);
        if tensor.count() != values.len() {
            return Err(DetectorError::InvalidInput(format!(
                "Tensor shape {:?} needs {} elements, got {}",
                dims,
                tensor.count(),
                values.len()
            )));
        }
        tensor.to_host(false).copy_from_slice(values);
        Ok(tensor)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn ndims(&self) -> usize {
        self.shape.len()
    }

    /// 指定维度的大小，越界返回 0
    pub fn size(&self, axis: usize) -> usize {
        self.shape.get(axis).copied().unwrap_or(0)
    }

    /// 元素总数，空形状为 0
    pub fn count(&self) -> usize {
        if self.shape.is_empty() {
            0
        } else {
            self.shape.iter().product()
        }
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn head(&self) -> DataHead {
        self.head
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn stream(&self) -> Option<&Stream> {
        self.stream.as_ref()
    }

    pub fn set_stream(&mut self, stream: Stream) -> &mut Self {
        self.stream = Some(stream);
        self
    }

    pub fn workspace(&self) -> Option<Arc<Mutex<MixedMemory>>> {
        self.workspace.clone()
    }

    pub fn set_workspace(&mut self, workspace: Arc<Mutex<MixedMemory>>) -> &mut Self {
        self.workspace = Some(workspace);
        self
    }

    /// 调整形状
    ///
    /// 新的字节数超过旧值时，权威位置回到 Init（需要重新物化）；
    /// 相等或更小时保留已有数据。
    pub fn resize(&mut self, dims: &[usize]) -> &mut Self {
        self.shape = dims.to_vec();
        self.strides = vec![1; dims.len()];
        for axis in (0..dims.len().saturating_sub(1)).rev() {
            self.strides[axis] = self.strides[axis + 1] * dims[axis + 1];
        }

        let needed = self.count() * ELEMENT_SIZE;
        if needed > self.bytes {
            self.head = DataHead::Init;
        }
        self.bytes = needed;
        self
    }

    /// 只调整一个维度，其余维度保持不变
    pub fn resize_single_dim(&mut self, axis: usize, size: usize) -> &mut Self {
        if axis >= self.shape.len() {
            warn!(
                "resize_single_dim: axis {} out of range for shape {:?}",
                axis, self.shape
            );
            return self;
        }

        let mut dims = self.shape.clone();
        dims[axis] = size;
        self.resize(&dims)
    }

    /// 多维下标对应的扁平元素偏移，未给出的尾部下标视为 0
    pub fn offset(&self, indices: &[usize]) -> usize {
        debug_assert!(
            indices.len() <= self.shape.len(),
            "too many indices for shape {:?}",
            self.shape
        );
        indices
            .iter()
            .zip(&self.strides)
            .map(|(index, stride)| index * stride)
            .sum()
    }

    /// 物化主机侧并返回主机数据
    ///
    /// `copy` 为 true 且设备侧持有有效数据时，在流上把设备数据拷回主机。
    pub fn to_host(&mut self, copy: bool) -> &mut [f32] {
        if self.head != DataHead::Host {
            let previous = self.head;
            self.head = DataHead::Host;
            self.data.host(self.bytes);

            if copy && previous == DataHead::Device {
                let bytes = self.bytes;
                let data = &mut self.data;
                run_on(self.stream.as_ref(), self.device, || data.download(bytes));
                trace!("Tensor copied {} bytes device -> host", bytes);
            }
        }

        as_f32_mut(self.data.host(self.bytes))
    }

    /// 物化设备侧并返回设备数据
    ///
    /// `copy` 为 true 且主机侧持有有效数据时，在流上把主机数据拷到设备。
    pub fn to_device(&mut self, copy: bool) -> &mut [f32] {
        if self.head != DataHead::Device {
            let previous = self.head;
            self.head = DataHead::Device;
            self.data.device(self.bytes);

            if copy && previous == DataHead::Host {
                let bytes = self.bytes;
                let data = &mut self.data;
                run_on(self.stream.as_ref(), self.device, || data.upload(bytes));
                trace!("Tensor copied {} bytes host -> device", bytes);
            }
        }

        as_f32_mut(self.data.device(self.bytes))
    }

    /// 主机侧为权威位置时返回主机数据
    pub fn host(&self) -> Option<&[f32]> {
        match self.head {
            DataHead::Host => Some(as_f32(&self.data.host_slice()[..self.bytes])),
            _ => None,
        }
    }

    /// 设备侧为权威位置时返回设备数据
    pub fn device_data(&self) -> Option<&[f32]> {
        match self.head {
            DataHead::Device => Some(as_f32(&self.data.device_slice()[..self.bytes])),
            _ => None,
        }
    }

    fn fits(&self, offset: usize, count: usize, operation: &str) -> bool {
        let offset_bytes = offset * ELEMENT_SIZE;
        let copy_bytes = count * ELEMENT_SIZE;

        if offset_bytes >= self.bytes {
            warn!(
                "{}: offset location [{}] >= bytes [{}], out of range",
                operation, offset_bytes, self.bytes
            );
            return false;
        }

        let remain = self.bytes.saturating_sub(offset_bytes);
        if copy_bytes > remain {
            warn!(
                "{}: copy bytes [{}] > remain bytes [{}], out of range",
                operation, copy_bytes, remain
            );
            return false;
        }

        true
    }

    /// 从设备数据拷贝到本张量 `offset` 处
    ///
    /// 写入当前权威一侧（Init 时先物化设备侧）；源设备与本张量设备不同时走 peer 拷贝。
    /// 越界时记录警告并跳过，返回 false。
    pub fn copy_from_device(&mut self, offset: usize, src: &[f32], src_device: DeviceId) -> bool {
        if src.is_empty() {
            return true;
        }

        if !self.fits(offset, src.len(), "copy_from_device") {
            return false;
        }

        if self.head == DataHead::Init {
            self.to_device(false);
        }

        let peer = src_device != self.device;
        let range = offset..offset + src.len();
        let bytes = self.bytes;
        let target = match self.head {
            DataHead::Host => as_f32_mut(self.data.host(bytes)),
            _ => as_f32_mut(self.data.device(bytes)),
        };

        run_on(self.stream.as_ref(), self.device, || {
            target[range].copy_from_slice(src);
        });

        if peer {
            trace!(
                "Peer copy of {} elements from device {} to device {}",
                src.len(),
                src_device,
                self.device
            );
        }
        true
    }

    /// 从主机数据拷贝到本张量 `offset` 处，越界时记录警告并跳过
    pub fn copy_from_host(&mut self, offset: usize, src: &[f32]) -> bool {
        if src.is_empty() {
            return true;
        }

        if !self.fits(offset, src.len(), "copy_from_host") {
            return false;
        }

        if self.head == DataHead::Init {
            self.to_host(false);
        }

        let range = offset..offset + src.len();
        let bytes = self.bytes;
        let target = match self.head {
            DataHead::Device => as_f32_mut(self.data.device(bytes)),
            _ => as_f32_mut(self.data.host(bytes)),
        };

        run_on(self.stream.as_ref(), self.device, || {
            target[range].copy_from_slice(src);
        });
        true
    }

    /// 半精度输出：物化主机侧后转换为 f16
    pub fn to_half(&mut self) -> Vec<f16> {
        self.to_host(true).iter().map(|&v| f16::from_f32(v)).collect()
    }

    /// 半精度输入：把 f16 数据转换为 f32 写入 `offset` 处
    pub fn copy_from_half(&mut self, offset: usize, src: &[f16]) -> bool {
        let values: Vec<f32> = src.iter().map(|v| v.to_f32()).collect();
        self.copy_from_host(offset, &values)
    }

    /// 等待本张量流上的操作完成
    pub fn synchronize(&self) {
        if let Some(stream) = &self.stream {
            stream.synchronize();
        }
    }

    /// 释放内存并清空形状
    pub fn release(&mut self) {
        self.data.release_all();
        self.shape.clear();
        self.strides.clear();
        self.bytes = 0;
        self.head = DataHead::Init;
    }

    pub fn describe(&self) -> String {
        format!(
            "Tensor{:?} head={:?} bytes={} device={}",
            self.shape, self.head, self.bytes, self.device
        )
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("head", &self.head)
            .field("bytes", &self.bytes)
            .field("device", &self.device)
            .field("stream", &self.stream)
            .finish()
    }
}
