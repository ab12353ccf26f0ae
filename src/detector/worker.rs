// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::affine::AffineMatrix;
use super::image::Image;
use super::{BoxList, DetectionBox, DetectorKind};
use crate::config::DetectorConfig;
use crate::device::{DeviceId, MixedMemory, MonopolyPool, PoolSlot, Stream, Tensor, set_device};
use crate::engine::{EngineLoader, InferEngine};
use crate::error::{DetectorError, FatalError, fatal};
use crate::kernels::{NUM_BOX_ELEMENT, Norm, decode_kernel, nms_kernel, warp_affine_bilinear_normalize};
use crate::pipeline::{BatchStrategy, Job, JobQueue, StartupSignal};

/// letterbox 填充值
const PAD_VALUE: u8 = 114;
/// 仿射矩阵在工作区中占用的字节数（6 个 f32 补齐到 32 字节）
const MATRIX_BYTES: usize = 32;
/// 仿射批张量每行的元素数（32 字节）
const MATRIX_STRIDE: usize = MATRIX_BYTES / std::mem::size_of::<f32>();

/// 预处理产物：池化的输入张量 + 逆变换
#[derive(Default)]
pub struct YoloJob {
    pub affine: AffineMatrix,
    pub slot: Option<PoolSlot<Tensor>>,
}

/// worker 就绪后对提交线程可见的状态
struct Runtime {
    pool: Arc<MonopolyPool<Tensor>>,
    stream: Stream,
    device: DeviceId,
    input_width: usize,
    input_height: usize,
}

/// 模型输出的几何信息
struct OutputLayout {
    num_bboxes: usize,
    num_classes: usize,
}

impl OutputLayout {
    fn per_image(&self) -> usize {
        self.num_bboxes * (self.num_classes + 5)
    }
}

/// YOLO 检测策略
pub struct YoloStrategy {
    kind: DetectorKind,
    device: DeviceId,
    norm: Norm,
    confidence_threshold: f32,
    nms_threshold: f32,
    max_objects: usize,
    acquire_timeout: Duration,
    runtime: RwLock<Option<Runtime>>,
}

impl YoloStrategy {
    pub fn new(config: &DetectorConfig) -> Self {
        Self {
            kind: config.kind,
            device: config.device_id,
            norm: config.kind.norm(),
            confidence_threshold: config.confidence_threshold,
            nms_threshold: config.nms_threshold,
            max_objects: config.max_objects,
            acquire_timeout: Duration::from_millis(config.acquire_timeout_ms),
            runtime: RwLock::new(None),
        }
    }

    pub fn kind(&self) -> DetectorKind {
        self.kind
    }

    /// 网络输入尺寸 (width, height)，worker 未就绪时为 None
    pub fn input_size(&self) -> Option<(usize, usize)> {
        self.runtime
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(|rt| (rt.input_width, rt.input_height))
    }

    fn runtime_snapshot(&self) -> Option<(Arc<MonopolyPool<Tensor>>, Stream, DeviceId, usize, usize)> {
        self.runtime
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(|rt| {
                (
                    Arc::clone(&rt.pool),
                    rt.stream.clone(),
                    rt.device,
                    rt.input_width,
                    rt.input_height,
                )
            })
    }

    /// 读取引擎的输入输出形状
    fn inspect(
        engine: &mut dyn InferEngine,
    ) -> Result<(usize, usize, OutputLayout), DetectorError> {
        let input = engine
            .input_mut(0)
            .ok_or_else(|| DetectorError::ModelLoadError("Model has no input tensor".to_string()))?;
        let input_shape = input.shape().to_vec();
        if input_shape.len() != 4 || input_shape[1] != 3 {
            return Err(DetectorError::ModelLoadError(format!(
                "Expected input shape [batch, 3, height, width], got {:?}",
                input_shape
            )));
        }

        let output = engine
            .output_mut(0)
            .ok_or_else(|| DetectorError::ModelLoadError("Model has no output tensor".to_string()))?;
        let output_shape = output.shape().to_vec();
        if output_shape.len() != 3 || output_shape[2] <= 5 {
            return Err(DetectorError::ModelLoadError(format!(
                "Expected output shape [batch, boxes, 5 + classes], got {:?}",
                output_shape
            )));
        }

        Ok((
            input_shape[3],
            input_shape[2],
            OutputLayout {
                num_bboxes: output_shape[1],
                num_classes: output_shape[2] - 5,
            },
        ))
    }

    /// 处理一个批次：拼接输入、前向、解码 + NMS、回填结果
    fn run_batch(
        &self,
        engine: &mut dyn InferEngine,
        jobs: &mut [Job<BoxList, YoloJob>],
        layout: &OutputLayout,
        affine_batch: &mut Tensor,
        output_batch: &mut Tensor,
    ) {
        let batch = jobs.len();
        let stream = engine.stream();

        {
            let Some(input) = engine.input_mut(0) else {
                return;
            };
            input.resize_single_dim(0, batch);

            for (ibatch, job) in jobs.iter_mut().enumerate() {
                // 拷贝完成后立即归还槽位，下一批的预处理可以与本批推理重叠
                if let Some(slot) = job.additional.slot.take()
                    && let Some(tensor) = slot.data()
                    && let Some(src) = tensor.device_data()
                {
                    let offset = input.offset(&[ibatch]);
                    input.copy_from_device(offset, src, tensor.device());
                }
                let offset = affine_batch.offset(&[ibatch]);
                affine_batch.copy_from_host(offset, &job.additional.affine.d2i);
            }
        }

        if let Err(e) = engine.forward(false) {
            fatal(FatalError::ForwardRejected(e.to_string()));
        }

        let Some(output) = engine.output_mut(0) else {
            return;
        };
        let per_image = layout.per_image();
        let stride = output_batch.size(1);
        let predict = output.to_device(true);
        let d2i = affine_batch.to_device(true);
        let parray = output_batch.to_device(false);

        stream.launch(|| {
            for ibatch in 0..batch {
                let image_output = &mut parray[ibatch * stride..(ibatch + 1) * stride];
                image_output[0] = 0.0;

                let Some(image_predict) = predict.get(ibatch * per_image..(ibatch + 1) * per_image)
                else {
                    continue;
                };
                decode_kernel(
                    image_predict,
                    layout.num_bboxes,
                    layout.num_classes,
                    self.confidence_threshold,
                    &d2i[ibatch * MATRIX_STRIDE..ibatch * MATRIX_STRIDE + 6],
                    image_output,
                    self.max_objects,
                );
                nms_kernel(image_output, self.max_objects, self.nms_threshold);
            }
        });

        let parray = output_batch.to_host(true);
        for (ibatch, job) in jobs.iter_mut().enumerate() {
            let image_output = &parray[ibatch * stride..(ibatch + 1) * stride];
            job.fulfill(self.collect_boxes(image_output));
        }
    }

    fn collect_boxes(&self, image_output: &[f32]) -> BoxList {
        let candidates = image_output[0].max(0.0) as usize;
        if candidates > self.max_objects {
            warn!(
                "{} candidates exceed the per-image cap of {}, extra boxes dropped",
                candidates, self.max_objects
            );
        }

        image_output[1..]
            .chunks_exact(NUM_BOX_ELEMENT)
            .take(candidates.min(self.max_objects))
            .filter(|item| item[6] == 1.0)
            .map(|item| DetectionBox {
                left: item[0],
                top: item[1],
                right: item[2],
                bottom: item[3],
                confidence: item[4],
                class_label: item[5] as usize,
            })
            .collect()
    }
}

/// worker 退出（含 panic）时撤下运行时并停止资源池
struct RuntimeReset<'a>(&'a RwLock<Option<Runtime>>);

impl Drop for RuntimeReset<'_> {
    fn drop(&mut self) {
        let runtime = self
            .0
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(runtime) = runtime {
            runtime.pool.stop();
        }
    }
}

impl BatchStrategy for YoloStrategy {
    type Input = Image;
    type Output = BoxList;
    type StartParam = EngineLoader;
    type Additional = YoloJob;

    fn preprocess(&self, job: &mut Job<BoxList, YoloJob>, image: &Image) -> bool {
        let Some((pool, stream, device, input_width, input_height)) = self.runtime_snapshot() else {
            warn!("Detector is not ready, preprocess rejected");
            return false;
        };

        let Some(mut slot) = pool.acquire(self.acquire_timeout) else {
            warn!(
                "No preprocessing slot became available within {:?}",
                self.acquire_timeout
            );
            return false;
        };

        let affine = AffineMatrix::letterbox(
            (image.width(), image.height()),
            (input_width, input_height),
        );

        let tensor = slot.get_or_insert_with(|| {
            let mut tensor = Tensor::new(device);
            tensor.set_workspace(Arc::new(Mutex::new(MixedMemory::new(device))));
            tensor
        });
        tensor.set_stream(stream.clone());
        tensor.resize(&[1, 3, input_height, input_width]);

        let Some(workspace) = tensor.workspace() else {
            return false;
        };
        let mut workspace = workspace
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let image_bytes = image.data().len();
        let staged = MATRIX_BYTES + image_bytes;
        {
            let host = workspace.host(staged);
            host[..MATRIX_BYTES].fill(0);
            host[..6 * std::mem::size_of::<f32>()].copy_from_slice(bytemuck::cast_slice(&affine.d2i));
            host[MATRIX_BYTES..].copy_from_slice(image.data());
        }
        stream.launch(|| workspace.upload(staged));

        let scratch = &workspace.device_slice()[..staged];
        let Ok(d2i) = bytemuck::try_cast_slice::<u8, f32>(&scratch[..MATRIX_BYTES]) else {
            error!("Workspace scratch is misaligned");
            return false;
        };
        let src = &scratch[MATRIX_BYTES..];

        let dst = tensor.to_device(false);
        stream.launch(|| {
            warp_affine_bilinear_normalize(
                src,
                image.line_size(),
                image.width(),
                image.height(),
                dst,
                input_width,
                input_height,
                d2i,
                PAD_VALUE,
                &self.norm,
            )
        });
        drop(workspace);

        job.additional = YoloJob {
            affine,
            slot: Some(slot),
        };
        true
    }

    fn worker(
        &self,
        queue: &JobQueue<BoxList, YoloJob>,
        loader: EngineLoader,
        signal: StartupSignal,
    ) {
        // 先选定设备，引擎在该设备上加载
        set_device(self.device);
        let mut engine = match loader() {
            Ok(engine) => engine,
            Err(e) => {
                error!("Failed to load detection engine: {}", e);
                signal.fail(e);
                return;
            }
        };

        let device = engine.device();
        if device != self.device {
            warn!(
                "Engine loaded on device {} instead of configured device {}",
                device, self.device
            );
            set_device(device);
        }

        let (input_width, input_height, layout) = match Self::inspect(engine.as_mut()) {
            Ok(shapes) => shapes,
            Err(e) => {
                error!("Unsupported detection model: {}", e);
                signal.fail(e);
                return;
            }
        };

        let stream = engine.stream();
        let max_batch_size = engine.max_batch_size().max(1);
        let pool = MonopolyPool::new(max_batch_size * 2);

        let mut affine_batch = Tensor::with_dims(&[max_batch_size, MATRIX_STRIDE], device);
        affine_batch.set_stream(stream.clone());
        affine_batch.to_device(false);

        let mut output_batch = Tensor::with_dims(
            &[max_batch_size, 1 + self.max_objects * NUM_BOX_ELEMENT],
            device,
        );
        output_batch.set_stream(stream.clone());
        output_batch.to_device(false);

        *self
            .runtime
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Runtime {
            pool,
            stream,
            device,
            input_width,
            input_height,
        });
        let _reset = RuntimeReset(&self.runtime);

        info!(
            "{:?} detector ready: input={}x{}, classes={}, max_batch_size={}, engine: {}",
            self.kind,
            input_width,
            input_height,
            layout.num_classes,
            max_batch_size,
            engine.describe()
        );
        signal.ready();

        while let Some(mut jobs) = queue.get_jobs_and_wait(max_batch_size) {
            debug!("Running batch of {} images", jobs.len());
            self.run_batch(
                engine.as_mut(),
                &mut jobs,
                &layout,
                &mut affine_batch,
                &mut output_batch,
            );
        }

        info!("{:?} detector worker exiting", self.kind);
    }

    fn inflight_capacity(&self) -> usize {
        self.runtime
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(|rt| rt.pool.capacity())
            .unwrap_or(1)
    }
}
