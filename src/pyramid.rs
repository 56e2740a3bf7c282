//! Feature pyramid network (FPN) on top of the backbone.
//!
//! Turns C2..C5 into the uniform-depth pyramid P2..P6. Each level combines a
//! 1×1 projection of its backbone level with the 2×-upsampled coarser level,
//! then smooths with a 3×3 convolution; P6 is P5 subsampled by stride-2
//! pooling. Because image sides are multiples of 64, every 2× upsample lands
//! exactly on the finer level's grid with no rounding loss.

use ndarray::Array4;

use crate::backbone::BackboneFeatures;
use crate::checkpoint::{ImportLog, WeightStore, Weights};
use crate::nn::{max_pool2d, upsample_nearest_2x, Conv2d, Initializer, Padding};

/// The P2..P6 pyramid of one forward pass. P2..P5 feed ROI alignment; all
/// five levels feed the RPN.
pub struct PyramidFeatures {
    pub p2: Array4<f32>,
    pub p3: Array4<f32>,
    pub p4: Array4<f32>,
    pub p5: Array4<f32>,
    pub p6: Array4<f32>,
}

impl PyramidFeatures {
    /// Levels in RPN order, finest to coarsest.
    pub fn rpn_levels(&self) -> [&Array4<f32>; 5] {
        [&self.p2, &self.p3, &self.p4, &self.p5, &self.p6]
    }

    /// Levels available to ROI alignment (P6 is pooling-only and excluded).
    pub fn roi_levels(&self) -> [&Array4<f32>; 4] {
        [&self.p2, &self.p3, &self.p4, &self.p5]
    }
}

/// The top-down, laterally connected pyramid network.
pub struct FeaturePyramid {
    lateral_c2: Conv2d,
    lateral_c3: Conv2d,
    lateral_c4: Conv2d,
    lateral_c5: Conv2d,
    smooth_p2: Conv2d,
    smooth_p3: Conv2d,
    smooth_p4: Conv2d,
    smooth_p5: Conv2d,
}

impl FeaturePyramid {
    /// Builds the pyramid with `depth` output channels per level
    /// (`TOP_DOWN_PYRAMID_SIZE`).
    pub fn new(depth: usize, init: &mut Initializer) -> Self {
        let lateral = |cin, init: &mut Initializer| {
            Conv2d::new(cin, depth, (1, 1), 1, Padding::Valid, init)
        };
        let smooth =
            |init: &mut Initializer| Conv2d::new(depth, depth, (3, 3), 1, Padding::Same, init);
        Self {
            lateral_c2: lateral(256, init),
            lateral_c3: lateral(512, init),
            lateral_c4: lateral(1024, init),
            lateral_c5: lateral(2048, init),
            smooth_p2: smooth(init),
            smooth_p3: smooth(init),
            smooth_p4: smooth(init),
            smooth_p5: smooth(init),
        }
    }

    pub fn forward(&self, features: &BackboneFeatures) -> PyramidFeatures {
        let p5 = self.lateral_c5.forward(&features.c5);
        let p4 = upsample_nearest_2x(&p5) + self.lateral_c4.forward(&features.c4);
        let p3 = upsample_nearest_2x(&p4) + self.lateral_c3.forward(&features.c3);
        let p2 = upsample_nearest_2x(&p3) + self.lateral_c2.forward(&features.c2);

        let p2 = self.smooth_p2.forward(&p2);
        let p3 = self.smooth_p3.forward(&p3);
        let p4 = self.smooth_p4.forward(&p4);
        let p5 = self.smooth_p5.forward(&p5);
        let p6 = max_pool2d(&p5, 1, 2, Padding::Valid);

        PyramidFeatures { p2, p3, p4, p5, p6 }
    }
}

impl Weights for FeaturePyramid {
    fn export(&self, prefix: &str, store: &mut WeightStore) {
        self.lateral_c2.export(&format!("{prefix}/lateral_c2"), store);
        self.lateral_c3.export(&format!("{prefix}/lateral_c3"), store);
        self.lateral_c4.export(&format!("{prefix}/lateral_c4"), store);
        self.lateral_c5.export(&format!("{prefix}/lateral_c5"), store);
        self.smooth_p2.export(&format!("{prefix}/smooth_p2"), store);
        self.smooth_p3.export(&format!("{prefix}/smooth_p3"), store);
        self.smooth_p4.export(&format!("{prefix}/smooth_p4"), store);
        self.smooth_p5.export(&format!("{prefix}/smooth_p5"), store);
    }

    fn import(&mut self, prefix: &str, store: &WeightStore, log: &mut ImportLog) {
        self.lateral_c2.import(&format!("{prefix}/lateral_c2"), store, log);
        self.lateral_c3.import(&format!("{prefix}/lateral_c3"), store, log);
        self.lateral_c4.import(&format!("{prefix}/lateral_c4"), store, log);
        self.lateral_c5.import(&format!("{prefix}/lateral_c5"), store, log);
        self.smooth_p2.import(&format!("{prefix}/smooth_p2"), store, log);
        self.smooth_p3.import(&format!("{prefix}/smooth_p3"), store, log);
        self.smooth_p4.import(&format!("{prefix}/smooth_p4"), store, log);
        self.smooth_p5.import(&format!("{prefix}/smooth_p5"), store, log);
    }
}
