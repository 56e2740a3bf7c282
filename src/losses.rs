//! Training losses.
//!
//! Every loss is a pure function of its inputs and returns the mean over the
//! entries that actually contribute; a term with no contributing entries is
//! 0 so an image without positives cannot poison a batch with NaN.

use log::warn;
use ndarray::{ArrayView2, ArrayView3, ArrayView4, ArrayView5};

use crate::num::{log_sum_exp, smooth_l1};

/// All five loss terms of one forward pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossReport {
    pub rpn_class: f32,
    pub rpn_box: f32,
    pub class: f32,
    pub bbox: f32,
    pub mask: f32,
}

impl LossReport {
    pub fn total(&self) -> f32 {
        self.rpn_class + self.rpn_box + self.class + self.bbox + self.mask
    }
}

/// Anchor objectness loss.
///
/// `rpn_match` is `[batch, anchors]` with 1 for positive anchors, -1 for
/// negative and 0 for neutral; neutral anchors do not contribute.
/// `logits` is `[batch, anchors, 2]` with background first.
pub fn rpn_class_loss(rpn_match: ArrayView2<'_, i8>, logits: ArrayView3<'_, f32>) -> f32 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for b in 0..rpn_match.nrows() {
        for a in 0..rpn_match.ncols() {
            let target = match rpn_match[[b, a]] {
                1 => 1,
                -1 => 0,
                _ => continue,
            };
            let pair = [logits[[b, a, 0]], logits[[b, a, 1]]];
            sum += log_sum_exp(&pair) - pair[target];
            count += 1;
        }
    }
    if count == 0 { 0.0 } else { sum / count as f32 }
}

/// Anchor box refinement loss over positive anchors.
///
/// `target_deltas` is `[batch, max_positive, 4]`, packed so that the i-th row
/// belongs to the i-th positive anchor of that image in anchor order.
pub fn rpn_box_loss(
    rpn_match: ArrayView2<'_, i8>,
    target_deltas: ArrayView3<'_, f32>,
    pred_deltas: ArrayView3<'_, f32>,
) -> f32 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for b in 0..rpn_match.nrows() {
        let mut slot = 0usize;
        for a in 0..rpn_match.ncols() {
            if rpn_match[[b, a]] != 1 {
                continue;
            }
            if slot >= target_deltas.dim().1 {
                warn!(
                    "image {b}: positive anchors exceed the {} packed delta rows, \
                     remaining anchors contribute no box loss",
                    target_deltas.dim().1
                );
                break;
            }
            for i in 0..4 {
                sum += smooth_l1(pred_deltas[[b, a, i]] - target_deltas[[b, slot, i]]);
                count += 1;
            }
            slot += 1;
        }
    }
    if count == 0 { 0.0 } else { sum / count as f32 }
}

/// ROI classification loss.
///
/// `active_class_ids` is `[batch, num_classes]` with 1 for classes present in
/// the image's source dataset. ROIs whose prediction lands on an inactive
/// class are excluded from the mean so datasets with disjoint label sets can
/// share a head.
pub fn head_class_loss(
    target_class_ids: ArrayView2<'_, u32>,
    logits: ArrayView3<'_, f32>,
    active_class_ids: ArrayView2<'_, f32>,
) -> f32 {
    let num_classes = logits.dim().2;
    let mut sum = 0.0;
    let mut weight = 0.0;
    for b in 0..target_class_ids.nrows() {
        for t in 0..target_class_ids.ncols() {
            let row: Vec<f32> = (0..num_classes).map(|k| logits[[b, t, k]]).collect();
            let predicted = row
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(k, _)| k)
                .unwrap_or(0);
            let active = active_class_ids[[b, predicted]];
            let target = target_class_ids[[b, t]] as usize;
            sum += (log_sum_exp(&row) - row[target]) * active;
            weight += active;
        }
    }
    if weight == 0.0 { 0.0 } else { sum / weight }
}

/// ROI box refinement loss over positive ROIs, taken at each ROI's target
/// class. `pred_deltas` is `[batch, rois, num_classes, 4]`.
pub fn head_box_loss(
    target_class_ids: ArrayView2<'_, u32>,
    target_deltas: ArrayView3<'_, f32>,
    pred_deltas: ArrayView4<'_, f32>,
) -> f32 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for b in 0..target_class_ids.nrows() {
        for t in 0..target_class_ids.ncols() {
            let class = target_class_ids[[b, t]] as usize;
            if class == 0 {
                continue;
            }
            for i in 0..4 {
                sum += smooth_l1(pred_deltas[[b, t, class, i]] - target_deltas[[b, t, i]]);
                count += 1;
            }
        }
    }
    if count == 0 { 0.0 } else { sum / count as f32 }
}

/// Per-pixel binary cross-entropy on the predicted mask of each positive
/// ROI's target class. `pred_masks` is `[batch, rois, h, w, num_classes]`.
pub fn mask_loss(
    target_class_ids: ArrayView2<'_, u32>,
    target_masks: ArrayView4<'_, f32>,
    pred_masks: ArrayView5<'_, f32>,
) -> f32 {
    let (_, _, h, w) = target_masks.dim();
    let mut sum = 0.0;
    let mut count = 0usize;
    for b in 0..target_class_ids.nrows() {
        for t in 0..target_class_ids.ncols() {
            let class = target_class_ids[[b, t]] as usize;
            if class == 0 {
                continue;
            }
            for y in 0..h {
                for x in 0..w {
                    let p = pred_masks[[b, t, y, x, class]].clamp(1e-7, 1.0 - 1e-7);
                    let target = target_masks[[b, t, y, x]];
                    sum -= target * p.ln() + (1.0 - target) * (1.0 - p).ln();
                    count += 1;
                }
            }
        }
    }
    if count == 0 { 0.0 } else { sum / count as f32 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{array, Array2, Array3, Array4, Array5};

    #[test]
    fn rpn_class_ignores_neutral_anchors() {
        let rpn_match = array![[1i8, 0, -1]];
        // Confident and correct on the contributing anchors.
        let logits = array![[[-10.0f32, 10.0], [50.0, 50.0], [10.0, -10.0]]];
        assert!(rpn_class_loss(rpn_match.view(), logits.view()) < 1e-3);

        // Flipping the positive anchor's logits makes the loss large.
        let wrong = array![[[10.0f32, -10.0], [50.0, 50.0], [10.0, -10.0]]];
        assert!(rpn_class_loss(rpn_match.view(), wrong.view()) > 5.0);
    }

    #[test]
    fn rpn_box_matches_packed_targets_in_order() {
        let rpn_match = array![[0i8, 1, 1]];
        let targets = array![[[0.5f32, 0.0, 0.0, 0.0], [0.0, 0.0, 0.0, 0.0]]];
        let mut preds = Array3::zeros((1, 3, 4));
        preds[[0, 1, 0]] = 0.5; // first positive anchor hits its target
        assert_relative_eq!(
            rpn_box_loss(rpn_match.view(), targets.view(), preds.view()),
            0.0
        );

        preds[[0, 2, 0]] = 2.0; // second positive anchor now misses
        assert!(rpn_box_loss(rpn_match.view(), targets.view(), preds.view()) > 0.0);
    }

    #[test]
    fn rpn_box_drops_positives_past_the_packed_rows() {
        // Three positives but room for only one packed target row.
        let rpn_match = array![[1i8, 1, 1]];
        let targets = array![[[0.5f32, 0.0, 0.0, 0.0]]];
        let mut preds = Array3::from_elem((1, 3, 4), 7.0);
        preds[[0, 0, 0]] = 0.5;
        preds[[0, 0, 1]] = 0.0;
        preds[[0, 0, 2]] = 0.0;
        preds[[0, 0, 3]] = 0.0;
        // Only the first anchor contributes, and it matches exactly.
        assert_relative_eq!(
            rpn_box_loss(rpn_match.view(), targets.view(), preds.view()),
            0.0
        );
    }

    #[test]
    fn head_class_loss_is_low_for_correct_logits() {
        let targets = array![[2u32, 0]];
        let mut logits = Array3::from_elem((1, 2, 3), -10.0f32);
        logits[[0, 0, 2]] = 10.0;
        logits[[0, 1, 0]] = 10.0;
        let active = Array2::ones((1, 3));
        assert!(head_class_loss(targets.view(), logits.view(), active.view()) < 1e-3);
    }

    #[test]
    fn head_box_loss_only_reads_target_class_slice() {
        let targets = array![[1u32, 0]];
        let target_deltas = array![[[0.1f32, 0.2, 0.3, 0.4], [0.0, 0.0, 0.0, 0.0]]];
        let mut preds = Array4::from_elem((1, 2, 3, 4), 99.0);
        for i in 0..4 {
            preds[[0, 0, 1, i]] = target_deltas[[0, 0, i]];
        }
        assert_relative_eq!(
            head_box_loss(targets.view(), target_deltas.view(), preds.view()),
            0.0
        );
    }

    #[test]
    fn mask_loss_skips_negative_rois() {
        let targets = array![[0u32]];
        let masks = Array4::ones((1, 1, 4, 4));
        let preds = Array5::from_elem((1, 1, 4, 4, 2), 0.01);
        assert_relative_eq!(mask_loss(targets.view(), masks.view(), preds.view()), 0.0);
    }

    #[test]
    fn mask_loss_penalizes_wrong_pixels() {
        let targets = array![[1u32]];
        let masks = Array4::ones((1, 1, 2, 2));
        let good = Array5::from_elem((1, 1, 2, 2, 2), 0.99);
        let bad = Array5::from_elem((1, 1, 2, 2, 2), 0.01);
        let low = mask_loss(targets.view(), masks.view(), good.view());
        let high = mask_loss(targets.view(), masks.view(), bad.view());
        assert!(low < 0.1);
        assert!(high > 2.0);
    }
}
