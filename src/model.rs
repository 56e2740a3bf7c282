//! Model assembly.
//!
//! [`MaskRCnn`] wires the backbone, pyramid, RPN, proposal filter, heads and
//! decoder together. The two modes are separate constructors rather than a
//! runtime flag threaded through graph construction: a training model owns a
//! target assigner and produces losses, an inference model owns a detection
//! decoder and produces [`Detection`]s with masks. Optimization itself is a
//! collaborator's job; the model only runs forward passes.

use std::path::Path;

use anyhow::{ensure, Result};
use log::debug;
use ndarray::{aview1, Array2, Array3, Array4, Array5, ArrayView2, ArrayView3, ArrayView4, Axis};
use rand::Rng;

use crate::anchors::AnchorCache;
use crate::backbone::Backbone;
use crate::checkpoint::{excluded, ImportLog, WeightStore, Weights};
use crate::config::Config;
use crate::detections::{detection_boxes, Detection, DetectionDecoder};
use crate::heads::{ClassifierHead, MaskHead};
use crate::losses::{self, LossReport};
use crate::meta::ImageMeta;
use crate::nn::Initializer;
use crate::proposals::ProposalFilter;
use crate::pyramid::{FeaturePyramid, PyramidFeatures};
use crate::roi_align::pyramid_roi_align;
use crate::rpn::{RpnHead, RpnOutput};
use crate::targets::TargetAssigner;

enum Mode {
    Training(TargetAssigner),
    Inference(DetectionDecoder),
}

const INIT_SEED: u64 = 0x6d61_736b;

pub struct MaskRCnn {
    config: Config,
    backbone: Backbone,
    pyramid: FeaturePyramid,
    rpn: RpnHead,
    classifier: ClassifierHead,
    mask_head: MaskHead,
    proposal_filter: ProposalFilter,
    anchor_cache: AnchorCache,
    mode: Mode,
}

/// One training step's ground truth, batched and zero-padded.
pub struct TrainInputs<'a> {
    /// `[batch, h, w, channels]` matching the configured image shape.
    pub images: &'a Array4<f32>,
    pub metas: &'a [ImageMeta],
    /// `[batch, anchors]`; 1 positive, -1 negative, 0 neutral.
    pub rpn_match: ArrayView2<'a, i8>,
    /// `[batch, max_positive_anchors, 4]`, packed in anchor order and
    /// normalized by `rpn_bbox_std_dev`.
    pub rpn_deltas: ArrayView3<'a, f32>,
    /// `[batch, max_gt]`, zero-padded.
    pub gt_class_ids: ArrayView2<'a, u32>,
    /// `[batch, max_gt, 4]` in normalized coordinates, zero-padded.
    pub gt_boxes: ArrayView3<'a, f32>,
    /// `[batch, h, w, max_gt]` binary masks at image resolution.
    pub gt_masks: ArrayView4<'a, f32>,
}

/// Forward-pass results of one training step.
pub struct TrainOutputs {
    pub losses: LossReport,
    /// Raw RPN predictions, for monitoring.
    pub rpn: RpnOutput,
    /// `[batch, post_nms_rois_training, 4]`, zero-padded.
    pub proposals: Array3<f32>,
}

/// Decoded instances of one image.
pub struct ImageDetections {
    pub detections: Vec<Detection>,
    /// `[instances, mask_h, mask_w]`, aligned with `detections` and already
    /// reduced to each detection's class.
    pub masks: Array3<f32>,
}

/// Forward-pass results of one inference batch.
pub struct InferenceOutputs {
    pub images: Vec<ImageDetections>,
    pub rpn: RpnOutput,
    /// `[batch, post_nms_rois_inference, 4]`, zero-padded.
    pub proposals: Array3<f32>,
}

impl MaskRCnn {
    /// Builds a training-mode model with freshly initialized weights.
    pub fn training(config: Config) -> Result<Self> {
        let assigner = TargetAssigner::from_config(&config);
        Self::build(config, true, Mode::Training(assigner))
    }

    /// Builds an inference-mode model with freshly initialized weights; load
    /// a checkpoint before calling [`MaskRCnn::detect`] for useful results.
    pub fn inference(config: Config) -> Result<Self> {
        let decoder = DetectionDecoder::from_config(&config);
        Self::build(config, false, Mode::Inference(decoder))
    }

    fn build(config: Config, training: bool, mode: Mode) -> Result<Self> {
        config.validate()?;
        let mut init = Initializer::new(INIT_SEED);
        let depth = config.top_down_pyramid_size;

        let backbone = Backbone::new(config.image_shape[2], config.trainable, &mut init);
        let pyramid = FeaturePyramid::new(depth, &mut init);
        let rpn = RpnHead::new(
            depth,
            config.anchors_per_location(),
            config.rpn_anchor_stride,
            &mut init,
        );
        let classifier = ClassifierHead::new(
            depth,
            config.pool_size,
            config.fpn_fc_layers_size,
            config.num_classes,
            config.trainable,
            &mut init,
        );
        let mask_head = MaskHead::new(depth, config.num_classes, config.trainable, &mut init);
        let proposal_filter = ProposalFilter::from_config(&config, training);

        Ok(Self {
            config,
            backbone,
            pyramid,
            rpn,
            classifier,
            mask_head,
            proposal_filter,
            anchor_cache: AnchorCache::new(),
            mode,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_training(&self) -> bool {
        matches!(self.mode, Mode::Training(_))
    }

    /// Anchors for the configured image shape, shared via the cache.
    pub fn anchors(&self) -> std::sync::Arc<Array2<f32>> {
        let [h, w, _] = self.config.image_shape;
        self.anchor_cache.get_or_compute(&self.config, (h, w))
    }

    /// Runs the shared trunk: backbone, pyramid, RPN and proposal filter.
    fn propose(
        &self,
        images: &Array4<f32>,
    ) -> Result<(PyramidFeatures, RpnOutput, Array3<f32>)> {
        let (n, h, w, c) = images.dim();
        let [ch, cw, cc] = self.config.image_shape;
        ensure!(
            h == ch && w == cw && c == cc,
            "input batch is {h}x{w}x{c}, configured for {ch}x{cw}x{cc}"
        );
        ensure!(n == self.config.batch_size, "batch of {n} images, configured for {}", self.config.batch_size);

        let training = self.is_training();
        let features = self.backbone.forward(images, training);
        let pyramid = self.pyramid.forward(&features);
        let rpn = self.rpn.forward(&pyramid.rpn_levels());
        let anchors = self.anchors();
        let proposals = self.proposal_filter.apply_batch(&rpn, anchors.view());
        debug!(
            "proposed {} regions per image from {} anchors",
            proposals.dim().1,
            anchors.nrows()
        );
        Ok((pyramid, rpn, proposals))
    }

    /// One training forward pass: proposes regions, assigns targets, runs
    /// both heads on the sampled ROIs and assembles the five losses.
    ///
    /// Panics when called on an inference-mode model.
    pub fn train_forward<R: Rng + ?Sized>(
        &self,
        inputs: TrainInputs<'_>,
        rng: &mut R,
    ) -> Result<TrainOutputs> {
        let Mode::Training(assigner) = &self.mode else {
            panic!("train_forward called on an inference-mode model");
        };

        let (pyramid, rpn, proposals) = self.propose(inputs.images)?;
        let batch = inputs.images.dim().0;
        ensure!(
            inputs.metas.len() == batch,
            "{} metadata entries for a batch of {batch}",
            inputs.metas.len()
        );
        ensure!(
            inputs.rpn_match.dim() == (batch, rpn.class_logits.dim().1),
            "anchor match matrix is {:?}, predictions cover {} anchors",
            inputs.rpn_match.dim(),
            rpn.class_logits.dim().1
        );

        let rois = self.config.train_rois_per_image;
        let classes = self.config.num_classes;
        let [mask_h, mask_w] = self.config.mask_shape;
        let [img_h, img_w, _] = self.config.image_shape;

        let mut target_class_ids = Array2::zeros((batch, rois));
        let mut target_deltas = Array3::zeros((batch, rois, 4));
        let mut target_masks = Array4::zeros((batch, rois, mask_h, mask_w));
        let mut class_logits = Array3::zeros((batch, rois, classes));
        let mut pred_deltas = Array4::zeros((batch, rois, classes, 4));
        let mut pred_masks = Array5::zeros((batch, rois, mask_h, mask_w, classes));
        let mut active = Array2::zeros((batch, classes));

        for b in 0..batch {
            let targets = assigner.assign(
                proposals.index_axis(Axis(0), b),
                inputs.gt_class_ids.index_axis(Axis(0), b),
                inputs.gt_boxes.index_axis(Axis(0), b),
                inputs.gt_masks.index_axis(Axis(0), b),
                rng,
            );

            let pooled = pyramid_roi_align(
                targets.rois.view(),
                &pyramid.roi_levels(),
                b,
                self.config.pool_size,
                (img_h, img_w),
            );
            let cls = self.classifier.forward(&pooled, true);

            let mask_pooled = pyramid_roi_align(
                targets.rois.view(),
                &pyramid.roi_levels(),
                b,
                self.config.mask_pool_size,
                (img_h, img_w),
            );
            let masks = self.mask_head.forward(&mask_pooled, true);

            target_class_ids.row_mut(b).assign(&targets.class_ids);
            target_deltas.index_axis_mut(Axis(0), b).assign(&targets.deltas);
            target_masks.index_axis_mut(Axis(0), b).assign(&targets.masks);
            class_logits.index_axis_mut(Axis(0), b).assign(&cls.class_logits);
            pred_deltas.index_axis_mut(Axis(0), b).assign(&cls.deltas);
            pred_masks.index_axis_mut(Axis(0), b).assign(&masks);
            let flags = &inputs.metas[b].active_class_ids;
            ensure!(
                flags.len() == classes,
                "image {b} carries {} active class flags for {classes} classes",
                flags.len()
            );
            active.row_mut(b).assign(&aview1(flags));
        }

        let losses = LossReport {
            rpn_class: losses::rpn_class_loss(inputs.rpn_match, rpn.class_logits.view()),
            rpn_box: losses::rpn_box_loss(inputs.rpn_match, inputs.rpn_deltas, rpn.deltas.view()),
            class: losses::head_class_loss(
                target_class_ids.view(),
                class_logits.view(),
                active.view(),
            ),
            bbox: losses::head_box_loss(
                target_class_ids.view(),
                target_deltas.view(),
                pred_deltas.view(),
            ),
            mask: losses::mask_loss(
                target_class_ids.view(),
                target_masks.view(),
                pred_masks.view(),
            ),
        };
        debug!("forward losses: total {:.4}", losses.total());

        Ok(TrainOutputs { losses, rpn, proposals })
    }

    /// One inference pass: proposes regions, classifies and refines them,
    /// decodes detections and extracts a mask per surviving instance.
    ///
    /// Panics when called on a training-mode model.
    pub fn detect(&self, images: &Array4<f32>, metas: &[ImageMeta]) -> Result<InferenceOutputs> {
        let Mode::Inference(decoder) = &self.mode else {
            panic!("detect called on a training-mode model");
        };

        let (pyramid, rpn, proposals) = self.propose(images)?;
        let batch = images.dim().0;
        ensure!(
            metas.len() == batch,
            "{} metadata entries for a batch of {batch}",
            metas.len()
        );

        let [img_h, img_w, _] = self.config.image_shape;
        let [mask_h, mask_w] = self.config.mask_shape;
        let mut results = Vec::with_capacity(batch);

        for b in 0..batch {
            let image_proposals = proposals.index_axis(Axis(0), b);
            let pooled = pyramid_roi_align(
                image_proposals,
                &pyramid.roi_levels(),
                b,
                self.config.pool_size,
                (img_h, img_w),
            );
            let cls = self.classifier.forward(&pooled, false);
            let detections = decoder.decode(
                image_proposals,
                cls.class_probs.view(),
                cls.deltas.view(),
                metas[b].normalized_window(),
            );
            debug!("image {}: {} instances", metas[b].image_id, detections.len());

            // Masks are sampled from the refined boxes, not the proposals.
            let boxes = detection_boxes(&detections);
            let mask_pooled = pyramid_roi_align(
                boxes.view(),
                &pyramid.roi_levels(),
                b,
                self.config.mask_pool_size,
                (img_h, img_w),
            );
            let all_masks = self.mask_head.forward(&mask_pooled, false);
            let mut masks = Array3::zeros((detections.len(), mask_h, mask_w));
            for (i, det) in detections.iter().enumerate() {
                masks.index_axis_mut(Axis(0), i).assign(
                    &all_masks
                        .index_axis(Axis(0), i)
                        .index_axis(Axis(2), det.class_id as usize),
                );
            }

            results.push(ImageDetections { detections, masks });
        }

        Ok(InferenceOutputs { images: results, rpn, proposals })
    }

    /// Writes every weight group to an `.npz` archive.
    pub fn save_weights(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut store = WeightStore::new();
        self.export("", &mut store);
        debug!("saving {} checkpoint", self.config.name);
        store.save(path)
    }

    /// Loads weights from an `.npz` archive.
    ///
    /// Groups whose top-level name appears in `exclude` keep their current
    /// values; use this to reuse a trunk while retraining the heads, e.g.
    /// `exclude = &["classifier", "mask"]` after changing `num_classes`.
    pub fn load_weights(&mut self, path: impl AsRef<Path>, exclude: &[&str]) -> Result<()> {
        let store = WeightStore::load(path)?;
        let mut log = ImportLog::default();
        for (name, part) in self.parts_mut() {
            if excluded(name, exclude) {
                debug!("skipping weight group {name}");
                continue;
            }
            part.import(name, &store, &mut log);
        }
        log.finish()
    }

    fn parts_mut(&mut self) -> [(&'static str, &mut dyn Weights); 5] {
        [
            ("backbone", &mut self.backbone),
            ("fpn", &mut self.pyramid),
            ("rpn", &mut self.rpn),
            ("classifier", &mut self.classifier),
            ("mask", &mut self.mask_head),
        ]
    }
}

impl Weights for MaskRCnn {
    fn export(&self, _prefix: &str, store: &mut WeightStore) {
        self.backbone.export("backbone", store);
        self.pyramid.export("fpn", store);
        self.rpn.export("rpn", store);
        self.classifier.export("classifier", store);
        self.mask_head.export("mask", store);
    }

    fn import(&mut self, _prefix: &str, store: &WeightStore, log: &mut ImportLog) {
        for (name, part) in self.parts_mut() {
            part.import(name, store, log);
        }
    }
}

/// Running mean of the loss terms over an epoch.
#[derive(Debug, Default)]
pub struct EpochMetrics {
    sums: [f32; 5],
    steps: usize,
}

impl EpochMetrics {
    pub fn record(&mut self, losses: &LossReport) {
        for (sum, term) in self.sums.iter_mut().zip([
            losses.rpn_class,
            losses.rpn_box,
            losses.class,
            losses.bbox,
            losses.mask,
        ]) {
            *sum += term;
        }
        self.steps += 1;
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn mean(&self) -> LossReport {
        let n = self.steps.max(1) as f32;
        LossReport {
            rpn_class: self.sums[0] / n,
            rpn_box: self.sums[1] / n,
            class: self.sums[2] / n,
            bbox: self.sums[3] / n,
            mask: self.sums[4] / n,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_metrics_average_over_steps() {
        let mut metrics = EpochMetrics::default();
        for scale in [1.0, 3.0] {
            metrics.record(&LossReport {
                rpn_class: scale,
                rpn_box: scale,
                class: scale,
                bbox: scale,
                mask: scale,
            });
        }
        assert_eq!(metrics.steps(), 2);
        let mean = metrics.mean();
        assert_eq!(mean.rpn_class, 2.0);
        assert_eq!(mean.total(), 10.0);
    }

    #[test]
    fn empty_epoch_reports_zero() {
        let metrics = EpochMetrics::default();
        assert_eq!(metrics.mean().total(), 0.0);
    }

    #[test]
    fn builders_reject_invalid_config() {
        let config = Config {
            image_shape: [100, 100, 3],
            ..Config::default()
        };
        assert!(MaskRCnn::inference(config).is_err());
    }
}
