// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 数据并行核函数
//!
//! - warp: 仿射双线性重采样 + 逐通道归一化（预处理）
//! - decode: 置信度过滤 + 原子压缩的框解码，以及按类别的并行 NMS（后处理）
//!
//! 每个核函数以“每个输出元素一个逻辑线程”的方式编写，由 rayon 并行执行，
//! 调用方负责把它们提交到对应的 Stream 上。

pub mod decode;
pub mod warp;

pub use decode::{NUM_BOX_ELEMENT, box_iou, decode_kernel, nms_kernel};
pub use warp::warp_affine_bilinear_normalize;

/// 通道顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelType {
    /// 保持原顺序
    #[default]
    None,
    /// 交换第 0 和第 2 通道（BGR <-> RGB）
    Invert,
}

/// 归一化方式
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum NormKind {
    #[default]
    None,
    /// (x * alpha - mean) / std
    MeanStd {
        mean: [f32; 3],
        std: [f32; 3],
        alpha: f32,
    },
    /// x * alpha + beta
    AlphaBeta { alpha: f32, beta: f32 },
}

/// 预处理归一化参数
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Norm {
    pub kind: NormKind,
    pub channel: ChannelType,
}

impl Norm {
    pub fn mean_std(mean: [f32; 3], std: [f32; 3], alpha: f32, channel: ChannelType) -> Self {
        Self {
            kind: NormKind::MeanStd { mean, std, alpha },
            channel,
        }
    }

    pub fn alpha_beta(alpha: f32, beta: f32, channel: ChannelType) -> Self {
        Self {
            kind: NormKind::AlphaBeta { alpha, beta },
            channel,
        }
    }

    pub fn none() -> Self {
        Self::default()
    }

    /// 对一个像素的三个通道应用通道顺序与归一化
    #[inline]
    pub fn apply(&self, mut pixel: [f32; 3]) -> [f32; 3] {
        if self.channel == ChannelType::Invert {
            pixel.swap(0, 2);
        }

        match self.kind {
            NormKind::None => pixel,
            NormKind::MeanStd { mean, std, alpha } => [
                (pixel[0] * alpha - mean[0]) / std[0],
                (pixel[1] * alpha - mean[1]) / std[1],
                (pixel[2] * alpha - mean[2]) / std[2],
            ],
            NormKind::AlphaBeta { alpha, beta } => [
                pixel[0] * alpha + beta,
                pixel[1] * alpha + beta,
                pixel[2] * alpha + beta,
            ],
        }
    }
}

/// 2x3 仿射矩阵作用于一个点
#[inline]
pub fn affine_project(matrix: &[f32], x: f32, y: f32) -> (f32, f32) {
    (
        matrix[0] * x + matrix[1] * y + matrix[2],
        matrix[3] * x + matrix[4] * y + matrix[5],
    )
}
