//! Box math shared by the proposal, target-assignment and detection stages.
//!
//! Boxes are rows of `[y1, x1, y2, x2]` in an `Array2<f32>`, normalized to
//! `[0, 1]` image coordinates. Degenerate (zero-area) boxes are legal inputs
//! everywhere; they simply produce zero overlap.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

use crate::num::TotalF32;

/// Floor applied to box extents before taking logarithms in
/// [`encode_deltas`], so that zero-area reference boxes cannot produce
/// non-finite deltas.
pub const EXTENT_EPSILON: f32 = 1e-6;

/// Intersection over union of two boxes.
pub fn iou(a: ArrayView1<'_, f32>, b: ArrayView1<'_, f32>) -> f32 {
    let y1 = a[0].max(b[0]);
    let x1 = a[1].max(b[1]);
    let y2 = a[2].min(b[2]);
    let x2 = a[3].min(b[3]);
    let intersection = (y2 - y1).max(0.0) * (x2 - x1).max(0.0);
    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - intersection;
    if union <= 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// Computes the `[boxes.rows, query.rows]` IoU matrix between two box sets.
pub fn overlaps(boxes: ArrayView2<'_, f32>, query: ArrayView2<'_, f32>) -> Array2<f32> {
    let mut out = Array2::zeros((boxes.nrows(), query.nrows()));
    for (i, a) in boxes.outer_iter().enumerate() {
        for (j, b) in query.outer_iter().enumerate() {
            out[[i, j]] = iou(a, b);
        }
    }
    out
}

/// Encodes the transform from each reference box to the paired target box as
/// `[dy, dx, log(dh), log(dw)]` deltas.
///
/// Inverse of [`apply_deltas`] up to floating-point error. Reference extents
/// are floored at [`EXTENT_EPSILON`] so degenerate boxes stay finite.
pub fn encode_deltas(reference: ArrayView2<'_, f32>, target: ArrayView2<'_, f32>) -> Array2<f32> {
    assert_eq!(reference.nrows(), target.nrows());
    let mut out = Array2::zeros((reference.nrows(), 4));
    for (mut row, (r, t)) in out
        .outer_iter_mut()
        .zip(reference.outer_iter().zip(target.outer_iter()))
    {
        let rh = (r[2] - r[0]).max(EXTENT_EPSILON);
        let rw = (r[3] - r[1]).max(EXTENT_EPSILON);
        let th = (t[2] - t[0]).max(EXTENT_EPSILON);
        let tw = (t[3] - t[1]).max(EXTENT_EPSILON);
        let rcy = r[0] + rh * 0.5;
        let rcx = r[1] + rw * 0.5;
        let tcy = t[0] + th * 0.5;
        let tcx = t[1] + tw * 0.5;
        row[0] = (tcy - rcy) / rh;
        row[1] = (tcx - rcx) / rw;
        row[2] = (th / rh).ln();
        row[3] = (tw / rw).ln();
    }
    out
}

/// Applies `[dy, dx, log(dh), log(dw)]` deltas to the paired boxes.
pub fn apply_deltas(boxes: ArrayView2<'_, f32>, deltas: ArrayView2<'_, f32>) -> Array2<f32> {
    assert_eq!(boxes.nrows(), deltas.nrows());
    let mut out = Array2::zeros((boxes.nrows(), 4));
    for (mut row, (b, d)) in out
        .outer_iter_mut()
        .zip(boxes.outer_iter().zip(deltas.outer_iter()))
    {
        let h = b[2] - b[0];
        let w = b[3] - b[1];
        let cy = b[0] + h * 0.5 + d[0] * h;
        let cx = b[1] + w * 0.5 + d[1] * w;
        let h = h * d[2].exp();
        let w = w * d[3].exp();
        row[0] = cy - h * 0.5;
        row[1] = cx - w * 0.5;
        row[2] = cy + h * 0.5;
        row[3] = cx + w * 0.5;
    }
    out
}

/// Clamps every box to the window `[y1, x1, y2, x2]`.
pub fn clip_to_window(boxes: &mut Array2<f32>, window: [f32; 4]) {
    for mut b in boxes.outer_iter_mut() {
        b[0] = b[0].clamp(window[0], window[2]);
        b[1] = b[1].clamp(window[1], window[3]);
        b[2] = b[2].clamp(window[0], window[2]);
        b[3] = b[3].clamp(window[1], window[3]);
    }
}

/// Greedy non-maximum suppression.
///
/// Returns the indices of the retained boxes in descending score order,
/// keeping at most `max_out` of them. A box is removed when it overlaps an
/// already-retained box with IoU above `iou_threshold`.
pub fn nms(
    boxes: ArrayView2<'_, f32>,
    scores: &Array1<f32>,
    iou_threshold: f32,
    max_out: usize,
) -> Vec<usize> {
    assert_eq!(boxes.nrows(), scores.len());
    let mut order: Vec<usize> = (0..boxes.nrows()).collect();
    // Ascending sort, process highest score first by popping from the back.
    order.sort_unstable_by_key(|&i| TotalF32(scores[i]));

    let mut keep = Vec::new();
    while let Some(seed) = order.pop() {
        keep.push(seed);
        if keep.len() == max_out {
            break;
        }
        order.retain(|&other| iou(boxes.row(seed), boxes.row(other)) <= iou_threshold);
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let b = array![0.1, 0.1, 0.4, 0.5];
        assert_relative_eq!(iou(b.view(), b.view()), 1.0);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = array![0.0, 0.0, 0.2, 0.2];
        let b = array![0.5, 0.5, 0.9, 0.9];
        assert_eq!(iou(a.view(), b.view()), 0.0);
    }

    #[test]
    fn zero_area_box_has_zero_iou() {
        let degenerate = array![0.3, 0.3, 0.3, 0.3];
        let other = array![0.0, 0.0, 1.0, 1.0];
        assert_eq!(iou(degenerate.view(), other.view()), 0.0);
    }

    #[test]
    fn delta_round_trip_reproduces_box() {
        let anchors = array![[0.1, 0.1, 0.3, 0.3], [0.5, 0.2, 0.9, 0.8]];
        let gt = array![[0.12, 0.08, 0.35, 0.33], [0.4, 0.25, 0.8, 0.75]];
        let deltas = encode_deltas(anchors.view(), gt.view());
        let decoded = apply_deltas(anchors.view(), deltas.view());
        for (d, g) in decoded.iter().zip(gt.iter()) {
            assert_relative_eq!(d, g, epsilon = 1e-5);
        }
    }

    #[test]
    fn encode_keeps_degenerate_reference_finite() {
        let anchors = array![[0.2, 0.2, 0.2, 0.2]];
        let gt = array![[0.1, 0.1, 0.3, 0.3]];
        let deltas = encode_deltas(anchors.view(), gt.view());
        assert!(deltas.iter().all(|d| d.is_finite()));
    }

    #[test]
    fn clip_limits_boxes_to_window() {
        let mut boxes = array![[-0.1, 0.5, 1.3, 0.9], [0.2, -0.4, 0.4, 1.5]];
        clip_to_window(&mut boxes, [0.0, 0.0, 1.0, 1.0]);
        assert!(boxes.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn nms_suppresses_overlapping_lower_score() {
        let boxes = array![
            [0.0, 0.0, 0.5, 0.5],
            [0.01, 0.01, 0.5, 0.5],
            [0.6, 0.6, 0.9, 0.9],
        ];
        let scores = array![0.9, 0.95, 0.8];
        let keep = nms(boxes.view(), &scores, 0.5, 10);
        assert_eq!(keep, vec![1, 2]);
    }

    #[test]
    fn nms_respects_max_out() {
        let boxes = array![[0.0, 0.0, 0.1, 0.1], [0.5, 0.5, 0.6, 0.6], [0.8, 0.8, 0.9, 0.9]];
        let scores = array![0.5, 0.6, 0.7];
        let keep = nms(boxes.view(), &scores, 0.5, 2);
        assert_eq!(keep.len(), 2);
        assert_eq!(keep[0], 2);
    }
}
