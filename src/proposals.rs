//! Proposal filtering: turns raw RPN output into a fixed-size ROI set.
//!
//! Decodes RPN box deltas against the anchor set, prunes to the top-scoring
//! anchors to bound NMS cost, clips to the image window and suppresses
//! overlaps, then pads with zero-boxes up to the configured proposal count.

use itertools::Itertools;
use log::trace;
use ndarray::{s, Array1, Array2, Array3, ArrayView1, ArrayView2, Axis};

use crate::boxes;
use crate::config::Config;
use crate::num::TotalF32;
use crate::rpn::RpnOutput;

pub struct ProposalFilter {
    proposal_count: usize,
    nms_threshold: f32,
    pre_nms_limit: usize,
    delta_std: [f32; 4],
}

impl ProposalFilter {
    /// Training keeps more proposals than inference so that target sampling
    /// sees a diverse positive/negative pool.
    pub fn from_config(config: &Config, training: bool) -> Self {
        Self {
            proposal_count: if training {
                config.post_nms_rois_training
            } else {
                config.post_nms_rois_inference
            },
            nms_threshold: config.rpn_nms_threshold,
            pre_nms_limit: config.pre_nms_limit,
            delta_std: config.rpn_bbox_std_dev,
        }
    }

    pub fn proposal_count(&self) -> usize {
        self.proposal_count
    }

    /// Filters one image's RPN output.
    ///
    /// `fg_scores` is the foreground-class probability per anchor, `deltas`
    /// the normalized box deltas, `anchors` the matching anchor set. Returns
    /// exactly `proposal_count` boxes, zero-padded at the tail when fewer
    /// survive.
    pub fn apply(
        &self,
        fg_scores: ArrayView1<'_, f32>,
        deltas: ArrayView2<'_, f32>,
        anchors: ArrayView2<'_, f32>,
    ) -> Array2<f32> {
        assert_eq!(fg_scores.len(), anchors.nrows());
        assert_eq!(deltas.nrows(), anchors.nrows());

        // Top-K by foreground score to bound the NMS working set.
        let keep: Vec<usize> = (0..anchors.nrows())
            .sorted_unstable_by_key(|&i| std::cmp::Reverse(TotalF32(fg_scores[i])))
            .take(self.pre_nms_limit)
            .collect();

        let pre_anchors = anchors.select(Axis(0), &keep);
        let mut pre_deltas = deltas.select(Axis(0), &keep);
        for mut row in pre_deltas.outer_iter_mut() {
            for (v, std) in row.iter_mut().zip(self.delta_std) {
                *v *= std;
            }
        }
        let scores = Array1::from_iter(keep.iter().map(|&i| fg_scores[i]));

        let mut decoded = boxes::apply_deltas(pre_anchors.view(), pre_deltas.view());
        boxes::clip_to_window(&mut decoded, [0.0, 0.0, 1.0, 1.0]);

        let survivors = boxes::nms(
            decoded.view(),
            &scores,
            self.nms_threshold,
            self.proposal_count,
        );
        trace!(
            "proposal filter: {} anchors -> {} pre-NMS -> {} proposals",
            anchors.nrows(),
            keep.len(),
            survivors.len()
        );

        let mut out = Array2::zeros((self.proposal_count, 4));
        for (row, &idx) in survivors.iter().enumerate() {
            out.row_mut(row).assign(&decoded.row(idx));
        }
        out
    }

    /// Filters a whole batch, returning `[batch, proposal_count, 4]`.
    pub fn apply_batch(&self, rpn: &RpnOutput, anchors: ArrayView2<'_, f32>) -> Array3<f32> {
        let batch = rpn.class_probs.dim().0;
        let mut out = Array3::zeros((batch, self.proposal_count, 4));
        for b in 0..batch {
            let fg = rpn.class_probs.slice(s![b, .., 1]);
            let deltas = rpn.deltas.index_axis(Axis(0), b);
            out.index_axis_mut(Axis(0), b)
                .assign(&self.apply(fg, deltas, anchors));
        }
        out
    }
}
