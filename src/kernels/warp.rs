// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use rayon::prelude::*;

use super::{Norm, affine_project};

/// 仿射双线性重采样 + 归一化
///
/// `src` 为 8 位交错三通道图像，`dst` 为平面 CHW 输出（3 x dst_height x dst_width）。
/// 每个输出像素通过 `d2i`（目标到源的 2x3 矩阵）映射回源图，超出源图的邻域取 `const_value`。
#[allow(clippy::too_many_arguments)]
pub fn warp_affine_bilinear_normalize(
    src: &[u8],
    src_line_size: usize,
    src_width: usize,
    src_height: usize,
    dst: &mut [f32],
    dst_width: usize,
    dst_height: usize,
    d2i: &[f32],
    const_value: u8,
    norm: &Norm,
) {
    let area = dst_width * dst_height;
    if area == 0 || dst.len() < area * 3 {
        return;
    }

    let (plane0, rest) = dst[..area * 3].split_at_mut(area);
    let (plane1, plane2) = rest.split_at_mut(area);
    let fill = [const_value as f32; 3];

    plane0
        .par_chunks_mut(dst_width)
        .zip(plane1.par_chunks_mut(dst_width))
        .zip(plane2.par_chunks_mut(dst_width))
        .enumerate()
        .for_each(|(dy, ((row0, row1), row2))| {
            for dx in 0..dst_width {
                let (src_x, src_y) = affine_project(d2i, dx as f32, dy as f32);
                let pixel = sample_bilinear(
                    src,
                    src_line_size,
                    src_width,
                    src_height,
                    src_x,
                    src_y,
                    fill,
                );
                let [c0, c1, c2] = norm.apply(pixel);
                row0[dx] = c0;
                row1[dx] = c1;
                row2[dx] = c2;
            }
        });
}

#[inline]
fn sample_bilinear(
    src: &[u8],
    line_size: usize,
    width: usize,
    height: usize,
    x: f32,
    y: f32,
    fill: [f32; 3],
) -> [f32; 3] {
    if x <= -1.0 || x >= width as f32 || y <= -1.0 || y >= height as f32 {
        return fill;
    }

    let x_low = x.floor() as i64;
    let y_low = y.floor() as i64;
    let x_high = x_low + 1;
    let y_high = y_low + 1;

    let lx = x - x_low as f32;
    let ly = y - y_low as f32;
    let hx = 1.0 - lx;
    let hy = 1.0 - ly;
    let weights = [hy * hx, hy * lx, ly * hx, ly * lx];

    let fetch = |px: i64, py: i64| -> [f32; 3] {
        if px < 0 || py < 0 || px >= width as i64 || py >= height as i64 {
            return fill;
        }
        let at = py as usize * line_size + px as usize * 3;
        match src.get(at..at + 3) {
            Some(p) => [p[0] as f32, p[1] as f32, p[2] as f32],
            None => fill,
        }
    };

    let neighbours = [
        fetch(x_low, y_low),
        fetch(x_high, y_low),
        fetch(x_low, y_high),
        fetch(x_high, y_high),
    ];

    let mut pixel = [0.0f32; 3];
    for (channel, value) in pixel.iter_mut().enumerate() {
        let mixed: f32 = neighbours
            .iter()
            .zip(weights)
            .map(|(n, w)| n[channel] * w)
            .sum();
        *value = (mixed + 0.5).floor();
    }
    pixel
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::ChannelType;

    #[test]
    fn test_identity_warp_copies_pixels() {
        // 2x2 BGR 图像
        let src = [10u8, 20, 30, 40, 50, 60, 70, 80, 90, 100, 110, 120];
        let mut dst = vec![0.0f32; 12];
        let identity = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0];

        warp_affine_bilinear_normalize(&src, 6, 2, 2, &mut dst, 2, 2, &identity, 0, &Norm::none());

        assert_eq!(&dst[0..4], &[10.0, 40.0, 70.0, 100.0]);
        assert_eq!(&dst[4..8], &[20.0, 50.0, 80.0, 110.0]);
        assert_eq!(&dst[8..12], &[30.0, 60.0, 90.0, 120.0]);
    }

    #[test]
    fn test_outside_source_uses_const_value() {
        let src = [255u8; 3];
        let mut dst = vec![0.0f32; 3];
        let far_away = [1.0, 0.0, 100.0, 0.0, 1.0, 100.0];

        warp_affine_bilinear_normalize(&src, 3, 1, 1, &mut dst, 1, 1, &far_away, 114, &Norm::none());

        assert_eq!(dst, vec![114.0, 114.0, 114.0]);
    }

    #[test]
    fn test_normalize_and_invert() {
        let src = [0u8, 51, 255];
        let mut dst = vec![0.0f32; 3];
        let identity = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
        let norm = Norm::alpha_beta(1.0 / 255.0, 0.0, ChannelType::Invert);

        warp_affine_bilinear_normalize(&src, 3, 1, 1, &mut dst, 1, 1, &identity, 0, &norm);

        assert!((dst[0] - 1.0).abs() < 1e-6);
        assert!((dst[1] - 0.2).abs() < 1e-6);
        assert!(dst[2].abs() < 1e-6);
    }

    #[test]
    fn test_half_pixel_blends_neighbours() {
        // 1x2 灰度值 0 与 100
        let src = [0u8, 0, 0, 100, 100, 100];
        let mut dst = vec![0.0f32; 3];
        let half_step = [1.0, 0.0, 0.5, 0.0, 1.0, 0.0];

        warp_affine_bilinear_normalize(&src, 6, 2, 1, &mut dst, 1, 1, &half_step, 0, &Norm::none());

        assert_eq!(dst, vec![50.0, 50.0, 50.0]);
    }
}
