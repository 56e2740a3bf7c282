//! Classification and mask heads.
//!
//! Both heads consume pyramid-aligned ROI patches. The classifier head
//! produces per-class scores and per-class box refinements from two fully
//! connected layers (realized as convolutions over the pooled patch); the
//! mask head runs a small FCN and predicts one sigmoid mask per class.

use ndarray::{Array2, Array3, Array4};

use crate::checkpoint::{ImportLog, WeightStore, Weights};
use crate::nn::{relu, BatchNorm, Conv2d, ConvTranspose2d, Dense, Initializer, Padding};
use crate::num;

pub struct ClassifierOutput {
    /// `[rois, num_classes]`
    pub class_logits: Array2<f32>,
    /// Softmax of the logits. `[rois, num_classes]`
    pub class_probs: Array2<f32>,
    /// Box refinement per class. `[rois, num_classes, 4]`
    pub deltas: Array3<f32>,
}

pub struct ClassifierHead {
    conv1: Conv2d,
    bn1: BatchNorm,
    conv2: Conv2d,
    bn2: BatchNorm,
    class_dense: Dense,
    delta_dense: Dense,
    num_classes: usize,
}

impl ClassifierHead {
    pub fn new(
        channels: usize,
        pool_size: usize,
        fc_size: usize,
        num_classes: usize,
        trainable: bool,
        init: &mut Initializer,
    ) -> Self {
        Self {
            // A valid convolution over the whole patch acts as the first FC
            // layer while keeping the weight layout convolutional.
            conv1: Conv2d::new(channels, fc_size, (pool_size, pool_size), 1, Padding::Valid, init),
            bn1: BatchNorm::new(fc_size, trainable, init),
            conv2: Conv2d::new(fc_size, fc_size, (1, 1), 1, Padding::Valid, init),
            bn2: BatchNorm::new(fc_size, trainable, init),
            class_dense: Dense::new(fc_size, num_classes, init),
            delta_dense: Dense::new(fc_size, num_classes * 4, init),
            num_classes,
        }
    }

    /// `pooled` is `[rois, pool, pool, channels]`.
    pub fn forward(&self, pooled: &Array4<f32>, training: bool) -> ClassifierOutput {
        let rois = pooled.dim().0;
        let x = relu(self.bn1.forward(&self.conv1.forward(pooled), training));
        let x = relu(self.bn2.forward(&self.conv2.forward(&x), training));
        let fc = x.dim().3;
        let shared = x.into_shape((rois, fc)).unwrap();

        let class_logits = self.class_dense.forward(&shared);
        let mut class_probs = class_logits.clone();
        for mut row in class_probs.outer_iter_mut() {
            let soft = num::softmax(row.as_slice().unwrap());
            row.assign(&ndarray::ArrayView1::from(&soft));
        }
        let deltas = self
            .delta_dense
            .forward(&shared)
            .into_shape((rois, self.num_classes, 4))
            .unwrap();

        ClassifierOutput { class_logits, class_probs, deltas }
    }
}

impl Weights for ClassifierHead {
    fn export(&self, prefix: &str, store: &mut WeightStore) {
        self.conv1.export(&format!("{prefix}/conv1"), store);
        self.bn1.export(&format!("{prefix}/bn1"), store);
        self.conv2.export(&format!("{prefix}/conv2"), store);
        self.bn2.export(&format!("{prefix}/bn2"), store);
        self.class_dense.export(&format!("{prefix}/class"), store);
        self.delta_dense.export(&format!("{prefix}/delta"), store);
    }

    fn import(&mut self, prefix: &str, store: &WeightStore, log: &mut ImportLog) {
        self.conv1.import(&format!("{prefix}/conv1"), store, log);
        self.bn1.import(&format!("{prefix}/bn1"), store, log);
        self.conv2.import(&format!("{prefix}/conv2"), store, log);
        self.bn2.import(&format!("{prefix}/bn2"), store, log);
        self.class_dense.import(&format!("{prefix}/class"), store, log);
        self.delta_dense.import(&format!("{prefix}/delta"), store, log);
    }
}

pub struct MaskHead {
    convs: Vec<(Conv2d, BatchNorm)>,
    deconv: ConvTranspose2d,
    mask_conv: Conv2d,
}

impl MaskHead {
    pub fn new(channels: usize, num_classes: usize, trainable: bool, init: &mut Initializer) -> Self {
        let convs = (0..4)
            .map(|_| {
                (
                    Conv2d::new(channels, channels, (3, 3), 1, Padding::Same, init),
                    BatchNorm::new(channels, trainable, init),
                )
            })
            .collect();
        Self {
            convs,
            deconv: ConvTranspose2d::new(channels, channels, 2, 2, init),
            mask_conv: Conv2d::new(channels, num_classes, (1, 1), 1, Padding::Valid, init),
        }
    }

    /// `pooled` is `[rois, pool, pool, channels]`; the output doubles the
    /// spatial size and holds one sigmoid mask per class,
    /// `[rois, 2*pool, 2*pool, num_classes]`.
    pub fn forward(&self, pooled: &Array4<f32>, training: bool) -> Array4<f32> {
        let mut x = pooled.clone();
        for (conv, bn) in &self.convs {
            x = relu(bn.forward(&conv.forward(&x), training));
        }
        let x = relu(self.deconv.forward(&x));
        self.mask_conv.forward(&x).mapv_into(num::sigmoid)
    }
}

impl Weights for MaskHead {
    fn export(&self, prefix: &str, store: &mut WeightStore) {
        for (i, (conv, bn)) in self.convs.iter().enumerate() {
            conv.export(&format!("{prefix}/conv{i}"), store);
            bn.export(&format!("{prefix}/bn{i}"), store);
        }
        self.deconv.export(&format!("{prefix}/deconv"), store);
        self.mask_conv.export(&format!("{prefix}/mask"), store);
    }

    fn import(&mut self, prefix: &str, store: &WeightStore, log: &mut ImportLog) {
        for (i, (conv, bn)) in self.convs.iter_mut().enumerate() {
            conv.import(&format!("{prefix}/conv{i}"), store, log);
            bn.import(&format!("{prefix}/bn{i}"), store, log);
        }
        self.deconv.import(&format!("{prefix}/deconv"), store, log);
        self.mask_conv.import(&format!("{prefix}/mask"), store, log);
    }
}
