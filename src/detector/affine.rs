// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

/// 保持长宽比的缩放居中变换（letterbox）
///
/// `i2d` 把原图坐标映射到网络输入坐标，`d2i` 是它的逆，用于把检测框映射回原图。
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AffineMatrix {
    pub i2d: [f32; 6],
    pub d2i: [f32; 6],
}

impl AffineMatrix {
    pub fn letterbox(from: (usize, usize), to: (usize, usize)) -> Self {
        let (src_w, src_h) = (from.0 as f32, from.1 as f32);
        let (dst_w, dst_h) = (to.0 as f32, to.1 as f32);

        let scale = (dst_w / src_w).min(dst_h / src_h);
        let i2d = [
            scale,
            0.0,
            -scale * src_w * 0.5 + dst_w * 0.5 + scale * 0.5 - 0.5,
            0.0,
            scale,
            -scale * src_h * 0.5 + dst_h * 0.5 + scale * 0.5 - 0.5,
        ];

        Self {
            i2d,
            d2i: invert(&i2d),
        }
    }
}

/// 2x3 仿射矩阵求逆，奇异矩阵返回全零
fn invert(m: &[f32; 6]) -> [f32; 6] {
    let det = m[0] * m[4] - m[1] * m[3];
    if det == 0.0 {
        return [0.0; 6];
    }
    let inv = 1.0 / det;

    let a = m[4] * inv;
    let b = -m[1] * inv;
    let d = -m[3] * inv;
    let e = m[0] * inv;
    [
        a,
        b,
        -(a * m[2] + b * m[5]),
        d,
        e,
        -(d * m[2] + e * m[5]),
    ]
}
