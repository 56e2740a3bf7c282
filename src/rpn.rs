//! Region proposal network head.
//!
//! One small convolutional head shared across all pyramid levels: a 3×3
//! convolution followed by two parallel 1×1 convolutions for
//! foreground/background logits and box deltas. Per-level outputs are
//! flattened and concatenated finest-to-coarsest, so row `i` of the output
//! corresponds to row `i` of the pyramid anchor set.

use ndarray::{concatenate, Array3, Array4, Axis};

use crate::checkpoint::{ImportLog, WeightStore, Weights};
use crate::nn::{relu, Conv2d, Initializer, Padding};
use crate::num::softmax;

/// Flat per-image RPN predictions; the leading axis is the batch, the second
/// the anchor index across all levels.
pub struct RpnOutput {
    /// `[batch, anchors, 2]` raw background/foreground logits.
    pub class_logits: Array3<f32>,
    /// `[batch, anchors, 2]` softmax probabilities.
    pub class_probs: Array3<f32>,
    /// `[batch, anchors, 4]` box deltas, normalized by `RPN_BBOX_STD_DEV`.
    pub deltas: Array3<f32>,
}

pub struct RpnHead {
    shared: Conv2d,
    class_conv: Conv2d,
    delta_conv: Conv2d,
    anchors_per_location: usize,
}

impl RpnHead {
    /// `depth` is the pyramid channel count; `anchor_stride` subsamples the
    /// positions at which the head is evaluated.
    pub fn new(
        depth: usize,
        anchors_per_location: usize,
        anchor_stride: usize,
        init: &mut Initializer,
    ) -> Self {
        Self {
            shared: Conv2d::new(depth, 512, (3, 3), anchor_stride, Padding::Same, init),
            class_conv: Conv2d::new(512, 2 * anchors_per_location, (1, 1), 1, Padding::Valid, init),
            delta_conv: Conv2d::new(512, 4 * anchors_per_location, (1, 1), 1, Padding::Valid, init),
            anchors_per_location,
        }
    }

    /// Applies the head to every pyramid level and concatenates the results
    /// in level order.
    pub fn forward(&self, levels: &[&Array4<f32>]) -> RpnOutput {
        let mut logits_per_level = Vec::with_capacity(levels.len());
        let mut deltas_per_level = Vec::with_capacity(levels.len());

        for &level in levels {
            let shared = relu(self.shared.forward(level));
            let (n, h, w, _) = shared.dim();
            let cells = h * w * self.anchors_per_location;

            let logits = self
                .class_conv
                .forward(&shared)
                .into_shape((n, cells, 2))
                .expect("conv output is standard layout");
            let deltas = self
                .delta_conv
                .forward(&shared)
                .into_shape((n, cells, 4))
                .expect("conv output is standard layout");
            logits_per_level.push(logits);
            deltas_per_level.push(deltas);
        }

        let views: Vec<_> = logits_per_level.iter().map(|a| a.view()).collect();
        let class_logits = concatenate(Axis(1), &views).expect("uniform trailing axes");
        let views: Vec<_> = deltas_per_level.iter().map(|a| a.view()).collect();
        let deltas = concatenate(Axis(1), &views).expect("uniform trailing axes");

        let mut class_probs = class_logits.clone();
        for mut lane in class_probs.lanes_mut(Axis(2)) {
            let p = softmax(&[lane[0], lane[1]]);
            lane[0] = p[0];
            lane[1] = p[1];
        }

        RpnOutput {
            class_logits,
            class_probs,
            deltas,
        }
    }
}

impl Weights for RpnHead {
    fn export(&self, prefix: &str, store: &mut WeightStore) {
        self.shared.export(&format!("{prefix}/shared"), store);
        self.class_conv.export(&format!("{prefix}/class"), store);
        self.delta_conv.export(&format!("{prefix}/delta"), store);
    }

    fn import(&mut self, prefix: &str, store: &WeightStore, log: &mut ImportLog) {
        self.shared.import(&format!("{prefix}/shared"), store, log);
        self.class_conv.import(&format!("{prefix}/class"), store, log);
        self.delta_conv.import(&format!("{prefix}/delta"), store, log);
    }
}
