// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

#[cfg(feature = "onnx")]
pub mod onnx_engine;

use std::path::Path;

use crate::device::{DeviceId, Stream, Tensor};
use crate::error::DetectorError;

/// 模型执行组件
///
/// 引擎拥有按名字索引的输入/输出张量，它们都绑定在引擎的流上；
/// 调用方把预处理结果写入输入张量的批次切片后调用 `forward`，
/// 引擎按输入的批大小调整输出张量的第 0 维并写入结果。
pub trait InferEngine: Send {
    fn input_names(&self) -> Vec<String>;

    fn output_names(&self) -> Vec<String>;

    fn input_mut(&mut self, index: usize) -> Option<&mut Tensor>;

    fn output_mut(&mut self, index: usize) -> Option<&mut Tensor>;

    /// 按名字查找输入或输出张量
    fn tensor_mut(&mut self, name: &str) -> Option<&mut Tensor>;

    fn max_batch_size(&self) -> usize;

    fn device(&self) -> DeviceId;

    /// 引擎的执行流，调用方的拷贝与核函数都提交到这个流上
    fn stream(&self) -> Stream;

    /// 执行一次前向推理，`sync` 为 true 时等待流上的工作完成
    fn forward(&mut self, sync: bool) -> Result<(), DetectorError>;

    fn describe(&self) -> String {
        format!(
            "inputs={:?} outputs={:?} max_batch_size={} device={}",
            self.input_names(),
            self.output_names(),
            self.max_batch_size(),
            self.device()
        )
    }
}

/// 在 worker 线程上构造引擎的闭包
pub type EngineLoader = Box<dyn FnOnce() -> Result<Box<dyn InferEngine>, DetectorError> + Send>;

/// 从模型文件加载引擎
pub fn load_engine(
    model_path: &Path,
    device: DeviceId,
    max_batch_size: usize,
) -> Result<Box<dyn InferEngine>, DetectorError> {
    if !model_path.is_file() {
        return Err(DetectorError::ModelLoadError(format!(
            "Model file not found: {:?}",
            model_path
        )));
    }

    #[cfg(feature = "onnx")]
    {
        let engine = onnx_engine::OnnxEngine::new(model_path, device, max_batch_size)?;
        Ok(Box::new(engine))
    }

    #[cfg(not(feature = "onnx"))]
    {
        let _ = (device, max_batch_size);
        Err(DetectorError::ModelLoadError(format!(
            "Cannot load {:?}: built without an inference runtime (enable the `onnx` feature)",
            model_path
        )))
    }
}
