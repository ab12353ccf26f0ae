// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 框解码与非极大值抑制
//!
//! 输出数组布局：`[count, box0(7), box1(7), ...]`，
//! 每个框为 `[left, top, right, bottom, confidence, class_label, keep]`。
//! `count` 是通过阈值的候选总数（可能超过容量），写入的框最多 `max_objects` 个。

use rayon::prelude::*;

use super::affine_project;

/// 每个框占用的浮点数
pub const NUM_BOX_ELEMENT: usize = 7;

const CONFIDENCE: usize = 4;
const CLASS_LABEL: usize = 5;
const KEEP_FLAG: usize = 6;

/// 解码一张图像的原始预测
///
/// `predict` 为 `num_bboxes` 行、每行 `5 + num_classes` 列：`[cx, cy, w, h, objectness, class_scores...]`。
/// 通过阈值的框映射回原图坐标后追加到 `parray`，`parray[0]` 按候选数累加（与原子计数一致）。
pub fn decode_kernel(
    predict: &[f32],
    num_bboxes: usize,
    num_classes: usize,
    confidence_threshold: f32,
    d2i: &[f32],
    parray: &mut [f32],
    max_objects: usize,
) {
    let row_len = 5 + num_classes;
    if num_classes == 0 || parray.is_empty() {
        return;
    }
    let rows = num_bboxes.min(predict.len() / row_len);

    let survivors: Vec<[f32; NUM_BOX_ELEMENT]> = predict[..rows * row_len]
        .par_chunks(row_len)
        .filter_map(|row| {
            let objectness = row[4];
            if objectness < confidence_threshold {
                return None;
            }

            let (label, class_score) = row[5..]
                .iter()
                .copied()
                .enumerate()
                .fold((0usize, f32::MIN), |best, (label, score)| {
                    if score > best.1 { (label, score) } else { best }
                });

            let confidence = objectness * class_score;
            if confidence < confidence_threshold {
                return None;
            }

            let (cx, cy, width, height) = (row[0], row[1], row[2], row[3]);
            let (left, top) = affine_project(d2i, cx - width * 0.5, cy - height * 0.5);
            let (right, bottom) = affine_project(d2i, cx + width * 0.5, cy + height * 0.5);

            Some([left, top, right, bottom, confidence, label as f32, 1.0])
        })
        .collect();

    let base = parray[0].max(0.0) as usize;
    parray[0] += survivors.len() as f32;

    let capacity = max_objects.min((parray.len() - 1) / NUM_BOX_ELEMENT);
    for (index, item) in survivors.iter().enumerate() {
        let position = base + index;
        if position >= capacity {
            break;
        }
        let start = 1 + position * NUM_BOX_ELEMENT;
        parray[start..start + NUM_BOX_ELEMENT].copy_from_slice(item);
    }
}

/// 两个框 `[left, top, right, bottom]` 的交并比，无交集时为 0
pub fn box_iou(a: &[f32], b: &[f32]) -> f32 {
    let cleft = a[0].max(b[0]);
    let ctop = a[1].max(b[1]);
    let cright = a[2].min(b[2]);
    let cbottom = a[3].min(b[3]);

    let c_area = (cright - cleft).max(0.0) * (cbottom - ctop).max(0.0);
    if c_area == 0.0 {
        return 0.0;
    }

    let a_area = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let b_area = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    c_area / (a_area + b_area - c_area)
}

/// 按类别的非极大值抑制
///
/// 只处理前 `min(count, max_objects)` 个框。一个框被抑制，当且仅当存在同类别的另一个框，
/// 其置信度更高（或相等且下标更小），并且两者 IoU 大于 `threshold`。
pub fn nms_kernel(parray: &mut [f32], max_objects: usize, threshold: f32) {
    if parray.is_empty() {
        return;
    }

    let capacity = max_objects.min((parray.len() - 1) / NUM_BOX_ELEMENT);
    let count = (parray[0].max(0.0) as usize).min(capacity);
    let boxes = &parray[1..1 + count * NUM_BOX_ELEMENT];

    let keep: Vec<bool> = (0..count)
        .into_par_iter()
        .map(|position| {
            let current = &boxes[position * NUM_BOX_ELEMENT..][..NUM_BOX_ELEMENT];
            !boxes
                .chunks_exact(NUM_BOX_ELEMENT)
                .enumerate()
                .any(|(index, other)| {
                    if index == position || other[CLASS_LABEL] != current[CLASS_LABEL] {
                        return false;
                    }
                    let dominates = other[CONFIDENCE] > current[CONFIDENCE]
                        || (other[CONFIDENCE] == current[CONFIDENCE] && index < position);
                    dominates && box_iou(current, other) > threshold
                })
        })
        .collect();

    for (position, kept) in keep.into_iter().enumerate() {
        if !kept {
            parray[1 + position * NUM_BOX_ELEMENT + KEEP_FLAG] = 0.0;
        }
    }
}
