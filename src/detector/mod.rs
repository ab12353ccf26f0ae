// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 目标检测器
//!
//! `Detector` 把通用调度器与 YOLO 策略组合起来：调用方线程负责预处理，
//! 唯一的 worker 线程负责批量推理与后处理。

pub mod affine;
pub mod image;
pub mod worker;

pub use affine::AffineMatrix;
pub use image::Image;
pub use worker::{YoloJob, YoloStrategy};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::config::DetectorConfig;
use crate::device::DeviceId;
use crate::engine::{self, EngineLoader};
use crate::error::{DetectorError, report};
use crate::kernels::{ChannelType, Norm, box_iou};
use crate::pipeline::{InferController, JobFuture};

/// 模型类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DetectorKind {
    #[default]
    #[serde(rename = "v5", alias = "yolov5", alias = "V5")]
    V5,
    #[serde(rename = "x", alias = "yolox", alias = "X")]
    X,
}

impl DetectorKind {
    /// 对应模型的预处理归一化
    pub fn norm(&self) -> Norm {
        match self {
            DetectorKind::V5 => Norm::alpha_beta(1.0 / 255.0, 0.0, ChannelType::Invert),
            DetectorKind::X => Norm::none(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DetectorKind::V5 => "v5",
            DetectorKind::X => "x",
        }
    }
}

impl fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DetectorKind {
    type Err = DetectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "v5" | "yolov5" => Ok(DetectorKind::V5),
            "x" | "yolox" => Ok(DetectorKind::X),
            _ => Err(DetectorError::UnsupportedKind(s.to_string())),
        }
    }
}

/// 一个检测框，坐标为原图像素坐标
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectionBox {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
    pub confidence: f32,
    pub class_label: usize,
}

impl DetectionBox {
    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }

    pub fn iou(&self, other: &DetectionBox) -> f32 {
        box_iou(
            &[self.left, self.top, self.right, self.bottom],
            &[other.left, other.top, other.right, other.bottom],
        )
    }
}

pub type BoxList = Vec<DetectionBox>;

/// 批处理目标检测器
pub struct Detector {
    controller: InferController<YoloStrategy>,
}

impl Detector {
    /// 用给定的引擎加载器创建检测器
    ///
    /// 加载器在 worker 线程上执行；加载或模型检查失败时返回错误，worker 随即退出。
    pub fn with_engine(config: &DetectorConfig, loader: EngineLoader) -> Result<Self, DetectorError> {
        config.validate()?;

        let controller = InferController::new(
            format!("yolo-{}", config.kind),
            YoloStrategy::new(config),
        );
        controller.startup(loader)?;
        Ok(Self { controller })
    }

    /// 按配置从模型文件创建检测器
    pub fn from_config(config: &DetectorConfig) -> Result<Self, DetectorError> {
        let model_path = config.model_path.clone();
        let device = config.device_id;
        let max_batch_size = config.max_batch_size;

        Self::with_engine(
            config,
            Box::new(move || engine::load_engine(&model_path, device, max_batch_size)),
        )
    }

    /// 提交一张图像，返回其检测结果
    ///
    /// 预处理失败（资源池超时、检测器已停止）与没有检测到目标一样返回空列表。
    pub fn submit(&self, image: &Image) -> JobFuture<BoxList> {
        self.controller.submit(image)
    }

    /// 批量提交，结果与输入一一对应
    pub fn submit_many(&self, images: &[Image]) -> Vec<JobFuture<BoxList>> {
        self.controller.submit_many(images)
    }

    /// 停止检测器，排队中的作业得到空结果；可重复调用
    pub fn stop(&self) {
        self.controller.stop();
    }

    pub fn kind(&self) -> DetectorKind {
        self.controller.strategy().kind()
    }

    /// 网络输入尺寸 (width, height)
    pub fn input_size(&self) -> Option<(usize, usize)> {
        self.controller.strategy().input_size()
    }

    pub fn is_running(&self) -> bool {
        self.controller.is_running()
    }
}

/// 创建检测器
///
/// 模型类型不受支持或模型加载失败时返回错误，错误同时交给已安装的上报器。
pub fn create_detector(
    model_file: impl AsRef<Path>,
    kind: &str,
    device_id: DeviceId,
    confidence_threshold: f32,
    nms_threshold: f32,
) -> Result<Detector, DetectorError> {
    kind.parse::<DetectorKind>()
        .and_then(|kind| {
            let config = DetectorConfig {
                model_path: model_file.as_ref().to_path_buf(),
                kind,
                device_id,
                confidence_threshold,
                nms_threshold,
                ..Default::default()
            };
            Detector::from_config(&config)
        })
        .inspect_err(report)
}
