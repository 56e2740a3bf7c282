//! Training target assignment.
//!
//! Matches proposals against ground-truth boxes and produces the fixed-size,
//! subsampled set of ROIs the heads train on, together with their class,
//! box-delta and mask targets. Padding rows everywhere are all-zero.

use ndarray::{s, Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, Axis};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::boxes;
use crate::config::Config;

/// Per-image head training targets, zero-padded to `train_rois_per_image`.
pub struct TrainingTargets {
    /// Sampled proposals, normalized coordinates. `[T, 4]`
    pub rois: Array2<f32>,
    /// Class id per ROI; 0 marks negatives and padding. `[T]`
    pub class_ids: Array1<u32>,
    /// Box refinement per positive ROI, divided by the delta std dev. `[T, 4]`
    pub deltas: Array2<f32>,
    /// Binary mask target per positive ROI. `[T, mask_h, mask_w]`
    pub masks: Array3<f32>,
}

pub struct TargetAssigner {
    train_rois: usize,
    positive_ratio: f32,
    positive_iou: f32,
    negative_iou: f32,
    delta_std: [f32; 4],
    mask_shape: [usize; 2],
}

impl TargetAssigner {
    pub fn from_config(config: &Config) -> Self {
        Self {
            train_rois: config.train_rois_per_image,
            positive_ratio: config.roi_positive_ratio,
            positive_iou: config.roi_positive_iou,
            negative_iou: config.roi_negative_iou,
            delta_std: config.bbox_std_dev,
            mask_shape: config.mask_shape,
        }
    }

    /// Assigns targets for one image.
    ///
    /// `proposals` is `[P, 4]` and may contain zero padding rows, which are
    /// dropped. `gt_masks` is `[H, W, G]` at image resolution. Ground-truth
    /// entries with class id 0 are treated as padding too; an image without
    /// any ground truth yields all-padding targets.
    pub fn assign<R: Rng + ?Sized>(
        &self,
        proposals: ArrayView2<'_, f32>,
        gt_class_ids: ArrayView1<'_, u32>,
        gt_boxes: ArrayView2<'_, f32>,
        gt_masks: ArrayView3<'_, f32>,
        rng: &mut R,
    ) -> TrainingTargets {
        let proposals = trim_zero_rows(proposals);
        let gt_count = gt_class_ids.iter().take_while(|&&id| id != 0).count();
        let gt_boxes = gt_boxes.slice(s![..gt_count, ..]);

        let mut rois = Array2::zeros((self.train_rois, 4));
        let mut class_ids = Array1::zeros(self.train_rois);
        let mut deltas = Array2::zeros((self.train_rois, 4));
        let mut masks = Array3::zeros((self.train_rois, self.mask_shape[0], self.mask_shape[1]));

        if proposals.is_empty() || gt_count == 0 {
            return TrainingTargets { rois, class_ids, deltas, masks };
        }

        let overlaps = boxes::overlaps(proposals.view(), gt_boxes);

        let mut positives = Vec::new();
        let mut negatives = Vec::new();
        for (p, row) in overlaps.outer_iter().enumerate() {
            let best = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            if best >= self.positive_iou {
                positives.push(p);
            } else if best < self.negative_iou {
                negatives.push(p);
            }
        }

        positives.shuffle(rng);
        negatives.shuffle(rng);
        let positive_count =
            positives.len().min((self.train_rois as f32 * self.positive_ratio).round() as usize);
        positives.truncate(positive_count);
        // Keep the overall positive fraction at the configured ratio.
        let negative_count = if positive_count > 0 {
            (positive_count as f32 / self.positive_ratio) as usize - positive_count
        } else {
            negatives.len()
        };
        negatives.truncate(negative_count.min(self.train_rois - positive_count));

        for (t, &p) in positives.iter().enumerate() {
            let roi = proposals.row(p);
            let gt = overlaps
                .row(p)
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(g, _)| g)
                .unwrap_or(0);

            rois.row_mut(t).assign(&roi);
            class_ids[t] = gt_class_ids[gt];

            let delta = boxes::encode_deltas(
                roi.insert_axis(Axis(0)),
                gt_boxes.row(gt).insert_axis(Axis(0)),
            );
            for i in 0..4 {
                deltas[[t, i]] = delta[[0, i]] / self.delta_std[i];
            }

            let gt_mask = gt_masks.index_axis(Axis(2), gt);
            crop_mask(
                gt_mask,
                [roi[0], roi[1], roi[2], roi[3]],
                masks.index_axis_mut(Axis(0), t),
            );
        }
        for (t, &p) in negatives.iter().enumerate() {
            rois.row_mut(positive_count + t).assign(&proposals.row(p));
        }

        TrainingTargets { rois, class_ids, deltas, masks }
    }
}

fn trim_zero_rows(boxes: ArrayView2<'_, f32>) -> Array2<f32> {
    let keep: Vec<usize> = boxes
        .outer_iter()
        .enumerate()
        .filter(|(_, row)| row.iter().any(|&v| v != 0.0))
        .map(|(i, _)| i)
        .collect();
    boxes.select(Axis(0), &keep)
}

/// Bilinearly resamples the part of `mask` under the normalized box into
/// `out`, rounding to a binary target.
fn crop_mask(
    mask: ndarray::ArrayView2<'_, f32>,
    roi: [f32; 4],
    mut out: ndarray::ArrayViewMut2<'_, f32>,
) {
    let (mh, mw) = mask.dim();
    let (oh, ow) = out.dim();
    for oy in 0..oh {
        let ty = if oh > 1 { oy as f32 / (oh - 1) as f32 } else { 0.5 };
        let y = ((roi[0] + (roi[2] - roi[0]) * ty) * (mh - 1) as f32).clamp(0.0, (mh - 1) as f32);
        let y0 = y.floor() as usize;
        let y1 = (y0 + 1).min(mh - 1);
        let fy = y - y0 as f32;
        for ox in 0..ow {
            let tx = if ow > 1 { ox as f32 / (ow - 1) as f32 } else { 0.5 };
            let x =
                ((roi[1] + (roi[3] - roi[1]) * tx) * (mw - 1) as f32).clamp(0.0, (mw - 1) as f32);
            let x0 = x.floor() as usize;
            let x1 = (x0 + 1).min(mw - 1);
            let fx = x - x0 as f32;

            let top = mask[[y0, x0]] * (1.0 - fx) + mask[[y0, x1]] * fx;
            let bottom = mask[[y1, x0]] * (1.0 - fx) + mask[[y1, x1]] * fx;
            out[[oy, ox]] = (top * (1.0 - fy) + bottom * fy).round();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;
    use rand::SeedableRng;

    fn assigner() -> TargetAssigner {
        TargetAssigner {
            train_rois: 8,
            positive_ratio: 0.33,
            positive_iou: 0.5,
            negative_iou: 0.5,
            delta_std: [0.1, 0.1, 0.2, 0.2],
            mask_shape: [14, 14],
        }
    }

    fn rng() -> rand::rngs::StdRng {
        rand::rngs::StdRng::seed_from_u64(7)
    }

    #[test]
    fn no_ground_truth_yields_padding_only() {
        let proposals = array![[0.1, 0.1, 0.4, 0.4], [0.5, 0.5, 0.9, 0.9]];
        let gt_ids = Array1::zeros(0);
        let gt_boxes = Array2::zeros((0, 4));
        let gt_masks = Array3::zeros((32, 32, 0));

        let targets = assigner().assign(
            proposals.view(),
            gt_ids.view(),
            gt_boxes.view(),
            gt_masks.view(),
            &mut rng(),
        );
        assert_eq!(targets.rois.dim(), (8, 4));
        assert!(targets.class_ids.iter().all(|&id| id == 0));
        assert!(targets.rois.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn exact_match_gets_class_and_zero_delta() {
        let proposals = array![[0.25, 0.25, 0.75, 0.75], [0.0, 0.0, 0.05, 0.05]];
        let gt_ids = array![3u32];
        let gt_boxes = array![[0.25, 0.25, 0.75, 0.75]];
        let mut gt_masks = Array3::zeros((32, 32, 1));
        gt_masks.slice_mut(s![8..24, 8..24, 0]).fill(1.0);

        let targets = assigner().assign(
            proposals.view(),
            gt_ids.view(),
            gt_boxes.view(),
            gt_masks.view(),
            &mut rng(),
        );
        assert_eq!(targets.class_ids[0], 3);
        for i in 0..4 {
            assert_relative_eq!(targets.deltas[[0, i]], 0.0, epsilon = 1e-5);
        }
        // The ROI covers exactly the mask's solid square, so the resampled
        // target is mostly ones.
        let filled: f32 = targets.masks.index_axis(Axis(0), 0).sum();
        assert!(filled > 0.5 * 14.0 * 14.0, "mask target too sparse: {filled}");
    }

    #[test]
    fn positives_capped_by_ratio() {
        // 6 perfect matches, but 33% of 8 rois rounds to 3 positives.
        let gt_boxes = array![[0.2, 0.2, 0.6, 0.6]];
        let gt_ids = array![1u32];
        let gt_masks = Array3::ones((16, 16, 1));
        let proposals = Array2::from_shape_fn((6, 4), |(_, j)| gt_boxes[[0, j]]);

        let targets = assigner().assign(
            proposals.view(),
            gt_ids.view(),
            gt_boxes.view(),
            gt_masks.view(),
            &mut rng(),
        );
        let positives = targets.class_ids.iter().filter(|&&id| id != 0).count();
        assert_eq!(positives, 3);
    }

    #[test]
    fn negatives_fill_after_positives() {
        let gt_boxes = array![[0.0, 0.0, 0.5, 0.5]];
        let gt_ids = array![2u32];
        let gt_masks = Array3::ones((16, 16, 1));
        let proposals = array![
            [0.0, 0.0, 0.5, 0.5],   // positive
            [0.6, 0.6, 0.9, 0.9],   // negative
            [0.55, 0.55, 1.0, 1.0], // negative
        ];

        let targets = assigner().assign(
            proposals.view(),
            gt_ids.view(),
            gt_boxes.view(),
            gt_masks.view(),
            &mut rng(),
        );
        assert_eq!(targets.class_ids[0], 2);
        // Negatives keep their boxes but carry class 0 and zero deltas.
        assert_eq!(targets.class_ids[1], 0);
        assert!(targets.rois.row(1).iter().any(|&v| v != 0.0));
        assert!(targets.deltas.row(1).iter().all(|&v| v == 0.0));
    }
}
