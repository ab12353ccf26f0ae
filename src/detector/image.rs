// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::error::DetectorError;

/// 8 位三通道交错图像（BGR 顺序）
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    width: usize,
    height: usize,
    data: Vec<u8>,
}

impl Image {
    /// 从 BGR 交错字节创建图像，长度必须等于 width * height * 3
    pub fn new(width: usize, height: usize, data: Vec<u8>) -> Result<Self, DetectorError> {
        if width == 0 || height == 0 {
            return Err(DetectorError::InvalidInput(format!(
                "Image dimensions must be positive, got {}x{}",
                width, height
            )));
        }

        let expected = width * height * 3;
        if data.len() != expected {
            return Err(DetectorError::InvalidInput(format!(
                "Image {}x{} needs {} bytes, got {}",
                width,
                height,
                expected,
                data.len()
            )));
        }

        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// 从 RGB 交错字节创建图像，转换为 BGR
    pub fn from_rgb8(width: usize, height: usize, mut data: Vec<u8>) -> Result<Self, DetectorError> {
        for pixel in data.chunks_exact_mut(3) {
            pixel.swap(0, 2);
        }
        Self::new(width, height, data)
    }

    /// 所有像素为同一 BGR 值的图像
    pub fn filled(width: usize, height: usize, bgr: [u8; 3]) -> Result<Self, DetectorError> {
        let data = bgr
            .iter()
            .copied()
            .cycle()
            .take(width * height * 3)
            .collect();
        Self::new(width, height, data)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// 每行字节数
    pub fn line_size(&self) -> usize {
        self.width * 3
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}
