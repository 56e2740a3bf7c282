//! Pipeline configuration.
//!
//! All knobs of the detection pipeline live in a single [`Config`] value that
//! is validated once and then treated as immutable by every stage. Graph
//! construction fails fast on an invalid configuration; nothing is validated
//! again during forward passes.

use anyhow::{ensure, Result};

/// Configuration of the full detection/segmentation pipeline.
///
/// Constructed via [`Config::default`] and adjusted with struct update
/// syntax, then checked with [`Config::validate`] (the model builders do this
/// for you).
#[derive(Debug, Clone)]
pub struct Config {
    /// Human-readable configuration name, used to tag checkpoints.
    pub name: String,
    /// Input image shape `[height, width, channels]`. Height and width must
    /// each be divisible by 64 so that six rounds of 2× down/upscaling stay
    /// lossless.
    pub image_shape: [usize; 3],
    /// Number of images per forward pass.
    pub batch_size: usize,
    /// Number of object classes, *including* the background class 0.
    pub num_classes: usize,
    /// Anchor side length in pixels, one entry per pyramid level (P2..P6).
    pub rpn_anchor_scales: Vec<f32>,
    /// Anchor width/height aspect ratios, shared by all levels.
    pub rpn_anchor_ratios: Vec<f32>,
    /// Spatial sampling density of anchors on each feature map. 1 places
    /// anchors on every cell, 2 on every other cell, and so on.
    pub rpn_anchor_stride: usize,
    /// Feature map stride of each pyramid level relative to the input image.
    pub backbone_strides: Vec<usize>,
    /// Channel depth of every pyramid level.
    pub top_down_pyramid_size: usize,
    /// Proposals kept after NMS when building the training graph.
    pub post_nms_rois_training: usize,
    /// Proposals kept after NMS when building the inference graph.
    pub post_nms_rois_inference: usize,
    /// IoU threshold for proposal NMS.
    pub rpn_nms_threshold: f32,
    /// Anchors kept (by score) before NMS, to bound its cost.
    pub pre_nms_limit: usize,
    /// Normalization applied to RPN box deltas before decoding, matching the
    /// normalization of the RPN training targets.
    pub rpn_bbox_std_dev: [f32; 4],
    /// Normalization applied to head box deltas.
    pub bbox_std_dev: [f32; 4],
    /// Output size of ROI alignment for the classifier head.
    pub pool_size: usize,
    /// Output size of ROI alignment for the mask head.
    pub mask_pool_size: usize,
    /// Resolution of ground-truth mask crops; must equal twice
    /// `mask_pool_size` per side (the mask head upsamples once).
    pub mask_shape: [usize; 2],
    /// Width of the two fully-connected layers in the classifier head.
    pub fpn_fc_layers_size: usize,
    /// ROIs sampled per image during target assignment.
    pub train_rois_per_image: usize,
    /// Fraction of sampled ROIs that may be positive.
    pub roi_positive_ratio: f32,
    /// Minimum IoU against a ground-truth box for a proposal to be positive.
    pub roi_positive_iou: f32,
    /// Proposals whose best IoU is below this are negatives; anything between
    /// the two thresholds is ignored by the losses.
    pub roi_negative_iou: f32,
    /// Upper bound on decoded detections per image.
    pub detection_max_instances: usize,
    /// Minimum class probability for a decoded detection.
    pub detection_min_confidence: f32,
    /// IoU threshold of the per-class NMS in the detection decoder.
    pub detection_nms_threshold: f32,
    /// Trainable flag handed to every batch-norm layer. Freezing the layers
    /// (``false``) keeps their moving statistics fixed, which helps on small
    /// fine-tuning datasets.
    pub trainable: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "mask_rcnn".into(),
            image_shape: [1024, 1024, 3],
            batch_size: 1,
            num_classes: 2,
            rpn_anchor_scales: vec![32.0, 64.0, 128.0, 256.0, 512.0],
            rpn_anchor_ratios: vec![0.5, 1.0, 2.0],
            rpn_anchor_stride: 1,
            backbone_strides: vec![4, 8, 16, 32, 64],
            top_down_pyramid_size: 256,
            post_nms_rois_training: 2000,
            post_nms_rois_inference: 1000,
            rpn_nms_threshold: 0.7,
            pre_nms_limit: 6000,
            rpn_bbox_std_dev: [0.1, 0.1, 0.2, 0.2],
            bbox_std_dev: [0.1, 0.1, 0.2, 0.2],
            pool_size: 7,
            mask_pool_size: 14,
            mask_shape: [28, 28],
            fpn_fc_layers_size: 1024,
            train_rois_per_image: 200,
            roi_positive_ratio: 0.33,
            roi_positive_iou: 0.5,
            roi_negative_iou: 0.5,
            detection_max_instances: 100,
            detection_min_confidence: 0.7,
            detection_nms_threshold: 0.3,
            trainable: true,
        }
    }
}

impl Config {
    /// Checks the configuration for inconsistencies.
    ///
    /// Called by the model builders before any layer is constructed, so an
    /// invalid configuration never yields a partial graph.
    pub fn validate(&self) -> Result<()> {
        let [h, w, c] = self.image_shape;
        ensure!(
            h % 64 == 0 && w % 64 == 0 && h > 0 && w > 0,
            "image size must be a multiple of 64 to allow up and downscaling, got {}x{}",
            h,
            w
        );
        ensure!(c > 0, "image must have at least one channel");
        ensure!(self.batch_size > 0, "batch size must be non-zero");
        ensure!(
            self.num_classes >= 2,
            "need at least background plus one object class"
        );
        ensure!(
            self.rpn_anchor_scales.len() == self.backbone_strides.len(),
            "one anchor scale per pyramid level expected ({} scales, {} strides)",
            self.rpn_anchor_scales.len(),
            self.backbone_strides.len()
        );
        ensure!(
            !self.rpn_anchor_ratios.is_empty(),
            "need at least one anchor aspect ratio"
        );
        ensure!(self.rpn_anchor_stride > 0, "anchor stride must be non-zero");
        ensure!(
            self.mask_shape == [self.mask_pool_size * 2, self.mask_pool_size * 2],
            "mask shape {:?} must be twice the mask pool size {}",
            self.mask_shape,
            self.mask_pool_size
        );
        ensure!(
            self.roi_positive_ratio > 0.0 && self.roi_positive_ratio < 1.0,
            "ROI positive ratio must lie in (0, 1)"
        );
        ensure!(
            self.roi_negative_iou <= self.roi_positive_iou,
            "negative IoU threshold may not exceed the positive one"
        );
        for t in [
            self.rpn_nms_threshold,
            self.detection_nms_threshold,
            self.detection_min_confidence,
        ] {
            ensure!((0.0..=1.0).contains(&t), "threshold {} outside [0, 1]", t);
        }
        ensure!(
            self.post_nms_rois_training > 0 && self.post_nms_rois_inference > 0,
            "proposal counts must be non-zero"
        );
        ensure!(
            self.train_rois_per_image > 0,
            "must sample at least one training ROI per image"
        );
        Ok(())
    }

    /// Number of anchors per feature map cell.
    pub fn anchors_per_location(&self) -> usize {
        self.rpn_anchor_ratios.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_non_divisible_image_shape() {
        let config = Config {
            image_shape: [1000, 1024, 3],
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_mismatched_scales() {
        let config = Config {
            rpn_anchor_scales: vec![32.0, 64.0],
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
