// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use ndarray::{ArrayD, IxDyn};
use ort::session::{Session, builder::GraphOptimizationLevel};
use std::path::Path;

use super::InferEngine;
use crate::device::{DeviceId, Stream, Tensor};
use crate::error::DetectorError;

/// ONNX Runtime 引擎
///
/// 会话在主机上执行：前向前把输入张量物化到主机侧，结果写回输出张量，
/// 输出的权威位置因此在主机侧，调用方按需 `to_device`。
pub struct OnnxEngine {
    session: Session,
    input_names: Vec<String>,
    output_names: Vec<String>,
    inputs: Vec<Tensor>,
    outputs: Vec<Tensor>,
    max_batch_size: usize,
    device: DeviceId,
    stream: Stream,
}

impl OnnxEngine {
    pub fn new(
        model_path: &Path,
        device: DeviceId,
        max_batch_size: usize,
    ) -> Result<Self, DetectorError> {
        let num_threads = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(4);

        tracing::info!("Initializing ONNX Runtime session for {:?}", model_path);
        let session = Session::builder()
            .map_err(|e| DetectorError::ModelLoadError(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| DetectorError::ModelLoadError(e.to_string()))?
            .with_intra_threads(num_threads)
            .map_err(|e| DetectorError::ModelLoadError(e.to_string()))?;

        #[cfg(feature = "cuda")]
        let session = {
            tracing::info!("Configuring CUDA execution provider on device {}", device);
            let cuda_provider = ort::execution_providers::CUDAExecutionProvider::default()
                .with_device_id(device.0 as i32)
                .build();
            session
                .with_execution_providers([cuda_provider])
                .map_err(|e| DetectorError::ModelLoadError(e.to_string()))?
        };

        let session = session
            .commit_from_file(model_path)
            .map_err(|e| DetectorError::ModelLoadError(e.to_string()))?;

        if session.inputs.len() != 1 || session.outputs.is_empty() {
            return Err(DetectorError::ModelLoadError(format!(
                "Expected one input and at least one output, model has {} inputs and {} outputs",
                session.inputs.len(),
                session.outputs.len()
            )));
        }

        let stream = Stream::new(device);

        let mut input_names = Vec::new();
        let mut inputs = Vec::new();
        let mut batch_limit = max_batch_size.max(1);
        for input in &session.inputs {
            let dims = input.input_type.tensor_shape().ok_or_else(|| {
                DetectorError::ModelLoadError(format!("Input {} is not a tensor", input.name))
            })?;
            let dims: Vec<i64> = dims.iter().copied().collect();
            if let Some(&batch) = dims.first()
                && batch > 0
            {
                batch_limit = batch as usize;
            }
            let shape = resolve_shape(&input.name, &dims, batch_limit)?;

            let mut tensor = Tensor::with_dims(&shape, device);
            tensor.set_stream(stream.clone());
            input_names.push(input.name.clone());
            inputs.push(tensor);
        }

        let mut output_names = Vec::new();
        let mut outputs = Vec::new();
        for output in &session.outputs {
            let dims = output.output_type.tensor_shape().ok_or_else(|| {
                DetectorError::ModelLoadError(format!("Output {} is not a tensor", output.name))
            })?;
            let dims: Vec<i64> = dims.iter().copied().collect();
            let shape = resolve_shape(&output.name, &dims, batch_limit)?;

            let mut tensor = Tensor::with_dims(&shape, device);
            tensor.set_stream(stream.clone());
            output_names.push(output.name.clone());
            outputs.push(tensor);
        }

        let engine = Self {
            session,
            input_names,
            output_names,
            inputs,
            outputs,
            max_batch_size: batch_limit,
            device,
            stream,
        };
        tracing::info!("ONNX Engine initialized: {}", engine.describe());
        Ok(engine)
    }
}

/// 解析模型声明的形状，动态批次维取 `batch`，其余动态维不支持
fn resolve_shape(name: &str, dims: &[i64], batch: usize) -> Result<Vec<usize>, DetectorError> {
    dims.iter()
        .enumerate()
        .map(|(axis, &dim)| match (axis, dim) {
            (0, d) if d <= 0 => Ok(batch),
            (_, d) if d > 0 => Ok(d as usize),
            _ => Err(DetectorError::ModelLoadError(format!(
                "Tensor {} has dynamic axis {} ({:?}), only the batch axis may be dynamic",
                name, axis, dims
            ))),
        })
        .collect()
}

impl InferEngine for OnnxEngine {
    fn input_names(&self) -> Vec<String> {
        self.input_names.clone()
    }

    fn output_names(&self) -> Vec<String> {
        self.output_names.clone()
    }

    fn input_mut(&mut self, index: usize) -> Option<&mut Tensor> {
        self.inputs.get_mut(index)
    }

    fn output_mut(&mut self, index: usize) -> Option<&mut Tensor> {
        self.outputs.get_mut(index)
    }

    fn tensor_mut(&mut self, name: &str) -> Option<&mut Tensor> {
        if let Some(index) = self.input_names.iter().position(|n| n == name) {
            return self.inputs.get_mut(index);
        }
        let index = self.output_names.iter().position(|n| n == name)?;
        self.outputs.get_mut(index)
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    fn device(&self) -> DeviceId {
        self.device
    }

    fn stream(&self) -> Stream {
        self.stream.clone()
    }

    fn forward(&mut self, sync: bool) -> Result<(), DetectorError> {
        let input = &mut self.inputs[0];
        let batch = input.size(0);
        let dims = input.shape().to_vec();
        let data = input.to_host(true).to_vec();

        let array = ArrayD::from_shape_vec(IxDyn(&dims), data)
            .map_err(|e| DetectorError::InferenceError(e.to_string()))?;
        let value = ort::value::Tensor::from_array(array)
            .map_err(|e| DetectorError::InferenceError(e.to_string()))?;

        let outputs = self
            .session
            .run(ort::inputs![self.input_names[0].as_str() => value])
            .map_err(|e| DetectorError::InferenceError(e.to_string()))?;

        for (name, tensor) in self.output_names.iter().zip(self.outputs.iter_mut()) {
            let array = outputs[name.as_str()]
                .try_extract_array::<f32>()
                .map_err(|e| DetectorError::InferenceError(e.to_string()))?;
            tracing::trace!("ONNX output {} shape: {:?}", name, array.shape());

            let values: Vec<f32> = array.iter().copied().collect();
            tensor.resize(array.shape());
            if tensor.size(0) != batch {
                return Err(DetectorError::InferenceError(format!(
                    "Output {} batch {} does not match input batch {}",
                    name,
                    tensor.size(0),
                    batch
                )));
            }
            tensor.copy_from_host(0, &values);
        }

        if sync {
            self.stream.synchronize();
        }
        Ok(())
    }
}
