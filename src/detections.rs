//! Inference-time detection decoding.
//!
//! Turns per-proposal class probabilities and box refinements into the final
//! list of detections: refine, clip to the image window, drop background and
//! low-confidence rows, then per-class non-maximum suppression.

use ndarray::{Array1, Array2, ArrayView2, ArrayView3, Axis};

use crate::boxes;
use crate::config::Config;

/// One decoded object instance, in normalized image coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// `[y1, x1, y2, x2]`
    pub bbox: [f32; 4],
    /// Never 0; background rows are dropped during decoding.
    pub class_id: u32,
    pub score: f32,
}

/// Stacks detection boxes into `[n, 4]` for mask extraction.
pub fn detection_boxes(detections: &[Detection]) -> Array2<f32> {
    let mut out = Array2::zeros((detections.len(), 4));
    for (mut row, det) in out.outer_iter_mut().zip(detections) {
        for i in 0..4 {
            row[i] = det.bbox[i];
        }
    }
    out
}

pub struct DetectionDecoder {
    max_instances: usize,
    min_confidence: f32,
    nms_threshold: f32,
    delta_std: [f32; 4],
}

impl DetectionDecoder {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_instances: config.detection_max_instances,
            min_confidence: config.detection_min_confidence,
            nms_threshold: config.detection_nms_threshold,
            delta_std: config.bbox_std_dev,
        }
    }

    /// Decodes one image's proposals.
    ///
    /// `class_probs` is `[P, num_classes]`, `deltas` is `[P, num_classes, 4]`
    /// and `window` is the normalized region of the image holding real
    /// pixels. The result is sorted by descending score and holds at most
    /// `detection_max_instances` entries.
    pub fn decode(
        &self,
        proposals: ArrayView2<'_, f32>,
        class_probs: ArrayView2<'_, f32>,
        deltas: ArrayView3<'_, f32>,
        window: [f32; 4],
    ) -> Vec<Detection> {
        let mut candidates: Vec<Detection> = Vec::new();

        for (p, probs) in class_probs.outer_iter().enumerate() {
            let (class_id, &score) = probs
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .unwrap_or((0, &0.0));
            if class_id == 0 || score < self.min_confidence {
                continue;
            }
            if proposals.row(p).iter().all(|&v| v == 0.0) {
                continue;
            }

            let mut delta = Array2::zeros((1, 4));
            for i in 0..4 {
                delta[[0, i]] = deltas[[p, class_id, i]] * self.delta_std[i];
            }
            let mut refined =
                boxes::apply_deltas(proposals.row(p).insert_axis(Axis(0)), delta.view());
            boxes::clip_to_window(&mut refined, window);

            candidates.push(Detection {
                bbox: [refined[[0, 0]], refined[[0, 1]], refined[[0, 2]], refined[[0, 3]]],
                class_id: class_id as u32,
                score,
            });
        }

        // NMS runs independently per class so overlapping instances of
        // different classes survive.
        let mut kept: Vec<Detection> = Vec::new();
        let mut class_ids: Vec<u32> = candidates.iter().map(|d| d.class_id).collect();
        class_ids.sort_unstable();
        class_ids.dedup();
        for class_id in class_ids {
            let members: Vec<usize> = (0..candidates.len())
                .filter(|&i| candidates[i].class_id == class_id)
                .collect();
            let class_boxes = Array2::from_shape_fn((members.len(), 4), |(i, j)| {
                candidates[members[i]].bbox[j]
            });
            let scores = Array1::from_iter(members.iter().map(|&i| candidates[i].score));
            for idx in boxes::nms(
                class_boxes.view(),
                &scores,
                self.nms_threshold,
                self.max_instances,
            ) {
                kept.push(candidates[members[idx]].clone());
            }
        }

        kept.sort_unstable_by(|a, b| b.score.total_cmp(&a.score));
        kept.truncate(self.max_instances);
        kept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{array, Array3};

    fn decoder() -> DetectionDecoder {
        DetectionDecoder {
            max_instances: 10,
            min_confidence: 0.7,
            nms_threshold: 0.3,
            delta_std: [0.1, 0.1, 0.2, 0.2],
        }
    }

    #[test]
    fn background_and_low_confidence_rows_are_dropped() {
        let proposals = array![[0.1, 0.1, 0.5, 0.5], [0.5, 0.5, 0.9, 0.9]];
        // First row is background, second is below the confidence floor.
        let probs = array![[0.9f32, 0.1], [0.4, 0.6]];
        let deltas = Array3::zeros((2, 2, 4));
        let dets = decoder().decode(proposals.view(), probs.view(), deltas.view(), [0.0; 4]);
        assert!(dets.is_empty());
    }

    #[test]
    fn zero_deltas_keep_the_proposal_box() {
        let proposals = array![[0.1, 0.2, 0.5, 0.6]];
        let probs = array![[0.05f32, 0.95]];
        let deltas = Array3::zeros((1, 2, 4));
        let dets =
            decoder().decode(proposals.view(), probs.view(), deltas.view(), [0.0, 0.0, 1.0, 1.0]);
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].class_id, 1);
        assert_relative_eq!(dets[0].score, 0.95);
        for (got, want) in dets[0].bbox.iter().zip([0.1, 0.2, 0.5, 0.6]) {
            assert_relative_eq!(*got, want, epsilon = 1e-5);
        }
    }

    #[test]
    fn per_class_nms_keeps_overlaps_across_classes() {
        let proposals = array![
            [0.1, 0.1, 0.5, 0.5],
            [0.1, 0.1, 0.5, 0.5],
            [0.12, 0.12, 0.5, 0.5],
        ];
        // Rows 0 and 2 share class 1 and overlap heavily; row 1 is class 2 on
        // the same box.
        let probs = array![[0.0f32, 0.9, 0.1], [0.0, 0.1, 0.9], [0.0, 0.8, 0.2]];
        let deltas = Array3::zeros((3, 3, 4));
        let dets =
            decoder().decode(proposals.view(), probs.view(), deltas.view(), [0.0, 0.0, 1.0, 1.0]);
        assert_eq!(dets.len(), 2);
        let mut classes: Vec<u32> = dets.iter().map(|d| d.class_id).collect();
        classes.sort_unstable();
        assert_eq!(classes, vec![1, 2]);
    }

    #[test]
    fn detections_are_clipped_to_the_window() {
        let proposals = array![[0.0, 0.0, 1.0, 1.0]];
        let probs = array![[0.0f32, 1.0]];
        let deltas = Array3::zeros((1, 2, 4));
        let window = [0.1, 0.1, 0.9, 0.9];
        let dets = decoder().decode(proposals.view(), probs.view(), deltas.view(), window);
        assert_relative_eq!(dets[0].bbox[0], 0.1);
        assert_relative_eq!(dets[0].bbox[3], 0.9);
    }
}
