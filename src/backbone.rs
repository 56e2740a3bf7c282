//! ResNet-50 feature extractor.
//!
//! Produces the five feature maps C1..C5 at strides 4, 4, 8, 16, 32 relative
//! to the input image. C1 is the pre-stage output (initial convolution plus
//! max-pool); each of the four residual stages starts with a projection block
//! (learned shortcut, optionally strided) followed by identity blocks.
//!
//! Built by composition rather than subclassing: the backbone is a plain
//! struct of layers exposing one pure function from image batch to feature
//! maps.

use ndarray::Array4;

use crate::checkpoint::{ImportLog, WeightStore, Weights};
use crate::nn::{max_pool2d, relu, BatchNorm, Conv2d, Initializer, Padding};

/// Bottleneck channel configuration of the four residual stages.
const STAGE_FILTERS: [[usize; 3]; 4] = [
    [64, 64, 256],
    [128, 128, 512],
    [256, 256, 1024],
    [512, 512, 2048],
];

/// Identity blocks following the projection block of each stage.
/// ResNet-101 would use 22 identity blocks in stage 4 instead of 5.
const STAGE_IDENTITY_BLOCKS: [usize; 4] = [2, 3, 5, 2];

/// Stage 2 keeps the stride of the max-pooled stem; later stages halve.
const STAGE_STRIDES: [usize; 4] = [1, 2, 2, 2];

/// The C1..C5 feature hierarchy of one forward pass.
pub struct BackboneFeatures {
    pub c1: Array4<f32>,
    pub c2: Array4<f32>,
    pub c3: Array4<f32>,
    pub c4: Array4<f32>,
    pub c5: Array4<f32>,
}

/// Bottleneck block with a learned 1×1 shortcut; changes channel depth and,
/// when `stride > 1`, halves resolution.
struct ProjectionBlock {
    conv1: Conv2d,
    bn1: BatchNorm,
    conv2: Conv2d,
    bn2: BatchNorm,
    conv3: Conv2d,
    bn3: BatchNorm,
    shortcut: Conv2d,
    shortcut_bn: BatchNorm,
}

impl ProjectionBlock {
    fn new(
        cin: usize,
        filters: [usize; 3],
        kernel: usize,
        stride: usize,
        trainable: bool,
        init: &mut Initializer,
    ) -> Self {
        let [f1, f2, f3] = filters;
        Self {
            conv1: Conv2d::new(cin, f1, (1, 1), stride, Padding::Valid, init),
            bn1: BatchNorm::new(f1, trainable, init),
            conv2: Conv2d::new(f1, f2, (kernel, kernel), 1, Padding::Same, init),
            bn2: BatchNorm::new(f2, trainable, init),
            conv3: Conv2d::new(f2, f3, (1, 1), 1, Padding::Valid, init),
            bn3: BatchNorm::new(f3, trainable, init),
            shortcut: Conv2d::new(cin, f3, (1, 1), stride, Padding::Valid, init),
            shortcut_bn: BatchNorm::new(f3, trainable, init),
        }
    }

    fn forward(&self, x: &Array4<f32>, training: bool) -> Array4<f32> {
        let mut y = relu(self.bn1.forward(&self.conv1.forward(x), training));
        y = relu(self.bn2.forward(&self.conv2.forward(&y), training));
        y = self.bn3.forward(&self.conv3.forward(&y), training);
        let shortcut = self.shortcut_bn.forward(&self.shortcut.forward(x), training);
        relu(y + shortcut)
    }
}

/// Bottleneck block with an identity shortcut; preserves shape.
struct IdentityBlock {
    conv1: Conv2d,
    bn1: BatchNorm,
    conv2: Conv2d,
    bn2: BatchNorm,
    conv3: Conv2d,
    bn3: BatchNorm,
}

impl IdentityBlock {
    fn new(filters: [usize; 3], kernel: usize, trainable: bool, init: &mut Initializer) -> Self {
        let [f1, f2, f3] = filters;
        Self {
            conv1: Conv2d::new(f3, f1, (1, 1), 1, Padding::Valid, init),
            bn1: BatchNorm::new(f1, trainable, init),
            conv2: Conv2d::new(f1, f2, (kernel, kernel), 1, Padding::Same, init),
            bn2: BatchNorm::new(f2, trainable, init),
            conv3: Conv2d::new(f2, f3, (1, 1), 1, Padding::Valid, init),
            bn3: BatchNorm::new(f3, trainable, init),
        }
    }

    fn forward(&self, x: &Array4<f32>, training: bool) -> Array4<f32> {
        let mut y = relu(self.bn1.forward(&self.conv1.forward(x), training));
        y = relu(self.bn2.forward(&self.conv2.forward(&y), training));
        y = self.bn3.forward(&self.conv3.forward(&y), training);
        relu(y + x)
    }
}

struct Stage {
    projection: ProjectionBlock,
    identities: Vec<IdentityBlock>,
}

impl Stage {
    fn forward(&self, x: &Array4<f32>, training: bool) -> Array4<f32> {
        let mut y = self.projection.forward(x, training);
        for block in &self.identities {
            y = block.forward(&y, training);
        }
        y
    }
}

/// The ResNet-50 backbone.
pub struct Backbone {
    conv1: Conv2d,
    bn1: BatchNorm,
    stages: Vec<Stage>,
}

impl Backbone {
    /// Builds the backbone for `channels`-channel input images. `trainable`
    /// is forwarded to every batch-norm layer (see [`BatchNorm`]).
    pub fn new(channels: usize, trainable: bool, init: &mut Initializer) -> Self {
        let conv1 = Conv2d::new(channels, 64, (7, 7), 2, Padding::Same, init);
        let bn1 = BatchNorm::new(64, trainable, init);

        let mut cin = 64;
        let mut stages = Vec::with_capacity(4);
        for (i, filters) in STAGE_FILTERS.iter().enumerate() {
            let projection =
                ProjectionBlock::new(cin, *filters, 3, STAGE_STRIDES[i], trainable, init);
            let identities = (0..STAGE_IDENTITY_BLOCKS[i])
                .map(|_| IdentityBlock::new(*filters, 3, trainable, init))
                .collect();
            cin = filters[2];
            stages.push(Stage {
                projection,
                identities,
            });
        }

        Self { conv1, bn1, stages }
    }

    /// Runs the batch through the network, producing the C1..C5 hierarchy.
    pub fn forward(&self, images: &Array4<f32>, training: bool) -> BackboneFeatures {
        let x = relu(self.bn1.forward(&self.conv1.forward(images), training));
        let c1 = max_pool2d(&x, 3, 2, Padding::Same);
        let c2 = self.stages[0].forward(&c1, training);
        let c3 = self.stages[1].forward(&c2, training);
        let c4 = self.stages[2].forward(&c3, training);
        let c5 = self.stages[3].forward(&c4, training);
        BackboneFeatures { c1, c2, c3, c4, c5 }
    }
}

impl Weights for ProjectionBlock {
    fn export(&self, prefix: &str, store: &mut WeightStore) {
        self.conv1.export(&format!("{prefix}/conv1"), store);
        self.bn1.export(&format!("{prefix}/bn1"), store);
        self.conv2.export(&format!("{prefix}/conv2"), store);
        self.bn2.export(&format!("{prefix}/bn2"), store);
        self.conv3.export(&format!("{prefix}/conv3"), store);
        self.bn3.export(&format!("{prefix}/bn3"), store);
        self.shortcut.export(&format!("{prefix}/shortcut/conv"), store);
        self.shortcut_bn.export(&format!("{prefix}/shortcut/bn"), store);
    }

    fn import(&mut self, prefix: &str, store: &WeightStore, log: &mut ImportLog) {
        self.conv1.import(&format!("{prefix}/conv1"), store, log);
        self.bn1.import(&format!("{prefix}/bn1"), store, log);
        self.conv2.import(&format!("{prefix}/conv2"), store, log);
        self.bn2.import(&format!("{prefix}/bn2"), store, log);
        self.conv3.import(&format!("{prefix}/conv3"), store, log);
        self.bn3.import(&format!("{prefix}/bn3"), store, log);
        self.shortcut.import(&format!("{prefix}/shortcut/conv"), store, log);
        self.shortcut_bn.import(&format!("{prefix}/shortcut/bn"), store, log);
    }
}

impl Weights for IdentityBlock {
    fn export(&self, prefix: &str, store: &mut WeightStore) {
        self.conv1.export(&format!("{prefix}/conv1"), store);
        self.bn1.export(&format!("{prefix}/bn1"), store);
        self.conv2.export(&format!("{prefix}/conv2"), store);
        self.bn2.export(&format!("{prefix}/bn2"), store);
        self.conv3.export(&format!("{prefix}/conv3"), store);
        self.bn3.export(&format!("{prefix}/bn3"), store);
    }

    fn import(&mut self, prefix: &str, store: &WeightStore, log: &mut ImportLog) {
        self.conv1.import(&format!("{prefix}/conv1"), store, log);
        self.bn1.import(&format!("{prefix}/bn1"), store, log);
        self.conv2.import(&format!("{prefix}/conv2"), store, log);
        self.bn2.import(&format!("{prefix}/bn2"), store, log);
        self.conv3.import(&format!("{prefix}/conv3"), store, log);
        self.bn3.import(&format!("{prefix}/bn3"), store, log);
    }
}

impl Weights for Backbone {
    fn export(&self, prefix: &str, store: &mut WeightStore) {
        self.conv1.export(&format!("{prefix}/conv1"), store);
        self.bn1.export(&format!("{prefix}/bn1"), store);
        for (i, stage) in self.stages.iter().enumerate() {
            let stage_prefix = format!("{prefix}/stage{}", i + 2);
            stage.projection.export(&format!("{stage_prefix}/block0"), store);
            for (j, block) in stage.identities.iter().enumerate() {
                block.export(&format!("{stage_prefix}/block{}", j + 1), store);
            }
        }
    }

    fn import(&mut self, prefix: &str, store: &WeightStore, log: &mut ImportLog) {
        self.conv1.import(&format!("{prefix}/conv1"), store, log);
        self.bn1.import(&format!("{prefix}/bn1"), store, log);
        for (i, stage) in self.stages.iter_mut().enumerate() {
            let stage_prefix = format!("{prefix}/stage{}", i + 2);
            stage
                .projection
                .import(&format!("{stage_prefix}/block0"), store, log);
            for (j, block) in stage.identities.iter_mut().enumerate() {
                block.import(&format!("{stage_prefix}/block{}", j + 1), store, log);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_hierarchy_shapes() {
        let mut init = Initializer::new(0);
        let backbone = Backbone::new(3, false, &mut init);
        let images = Array4::<f32>::zeros((1, 64, 64, 3));
        let f = backbone.forward(&images, false);
        assert_eq!(f.c1.dim(), (1, 16, 16, 64));
        assert_eq!(f.c2.dim(), (1, 16, 16, 256));
        assert_eq!(f.c3.dim(), (1, 8, 8, 512));
        assert_eq!(f.c4.dim(), (1, 4, 4, 1024));
        assert_eq!(f.c5.dim(), (1, 2, 2, 2048));
    }

    #[test]
    fn weight_export_is_complete() {
        let mut init = Initializer::new(0);
        let backbone = Backbone::new(3, false, &mut init);
        let mut store = WeightStore::new();
        backbone.export("backbone", &mut store);
        // stem conv+bn plus 16 bottleneck blocks.
        assert!(store.len() > 100);
        assert!(store.names().any(|n| n == "backbone/stage5/block0/shortcut/conv/kernel"));
    }
}
