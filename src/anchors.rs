//! Anchor enumeration for the region proposal network.
//!
//! Anchors depend only on the image shape and the anchor configuration, never
//! on image content, so the full pyramid anchor set is computed once per
//! distinct image shape and cached for the lifetime of the process.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use log::debug;
use ndarray::{concatenate, Array2, Axis};

use crate::config::Config;

/// Enumerates the anchors of a single pyramid level.
///
/// Anchors are centered on a regular grid with spacing `anchor_stride` cells
/// on the level's feature map. Each center carries one box per aspect ratio,
/// `scale * sqrt(ratio)` wide and `scale / sqrt(ratio)` tall (in pixels),
/// normalized to `[0, 1]` by the image height/width.
pub fn level_anchors(
    scale: f32,
    ratios: &[f32],
    feature_shape: (usize, usize),
    feature_stride: usize,
    anchor_stride: usize,
    image_shape: (usize, usize),
) -> Array2<f32> {
    let (fh, fw) = feature_shape;
    let (ih, iw) = (image_shape.0 as f32, image_shape.1 as f32);

    let count = fh.div_ceil(anchor_stride) * fw.div_ceil(anchor_stride) * ratios.len();
    let mut anchors = Array2::zeros((count, 4));

    let mut row = 0;
    for y in (0..fh).step_by(anchor_stride) {
        let cy = (y * feature_stride) as f32;
        for x in (0..fw).step_by(anchor_stride) {
            let cx = (x * feature_stride) as f32;
            for &ratio in ratios {
                let w = scale * ratio.sqrt();
                let h = scale / ratio.sqrt();
                anchors[[row, 0]] = (cy - h * 0.5) / ih;
                anchors[[row, 1]] = (cx - w * 0.5) / iw;
                anchors[[row, 2]] = (cy + h * 0.5) / ih;
                anchors[[row, 3]] = (cx + w * 0.5) / iw;
                row += 1;
            }
        }
    }
    debug_assert_eq!(row, count);
    anchors
}

/// Enumerates anchors for every pyramid level, concatenated finest (P2) to
/// coarsest (P6), matching the order in which the RPN emits its predictions.
pub fn pyramid_anchors(config: &Config, image_shape: (usize, usize)) -> Array2<f32> {
    let per_level: Vec<Array2<f32>> = config
        .rpn_anchor_scales
        .iter()
        .zip(&config.backbone_strides)
        .map(|(&scale, &stride)| {
            let feature_shape = (
                image_shape.0.div_ceil(stride),
                image_shape.1.div_ceil(stride),
            );
            level_anchors(
                scale,
                &config.rpn_anchor_ratios,
                feature_shape,
                stride,
                config.rpn_anchor_stride,
                image_shape,
            )
        })
        .collect();

    let views: Vec<_> = per_level.iter().map(|a| a.view()).collect();
    concatenate(Axis(0), &views).expect("per-level anchor arrays all have 4 columns")
}

/// Process-lifetime cache of pyramid anchor sets, keyed by image shape.
///
/// Population is pure and idempotent, so concurrent misses for the same shape
/// may race harmlessly; the last writer stores a value identical to every
/// other contender's. Reads only take the lock long enough to clone an
/// [`Arc`].
#[derive(Debug, Default)]
pub struct AnchorCache {
    inner: RwLock<HashMap<(usize, usize), Arc<Array2<f32>>>>,
}

impl AnchorCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached anchor set for `image_shape`, computing and storing
    /// it on first use.
    pub fn get_or_compute(&self, config: &Config, image_shape: (usize, usize)) -> Arc<Array2<f32>> {
        if let Some(anchors) = self.inner.read().unwrap().get(&image_shape) {
            return anchors.clone();
        }

        let anchors = Arc::new(pyramid_anchors(config, image_shape));
        debug!(
            "generated {} anchors for image shape {}x{}",
            anchors.nrows(),
            image_shape.0,
            image_shape.1
        );
        self.inner
            .write()
            .unwrap()
            .entry(image_shape)
            .or_insert(anchors)
            .clone()
    }
}
