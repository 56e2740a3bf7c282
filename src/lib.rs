//! Two-stage object detection and instance segmentation (Mask R-CNN).
//!
//! The crate is organized as a set of composable pipeline stages: a ResNet-50
//! [`backbone`], a feature [`pyramid`] (FPN) on top of it, a region proposal
//! network ([`rpn`]) with cached [`anchors`], proposal filtering
//! ([`proposals`]), training target assignment ([`targets`]), pyramid ROI
//! alignment ([`roi_align`]), the classifier/box/mask [`heads`], the
//! five-term loss assembly ([`losses`]) and the inference-time detection
//! decoder ([`detections`]). [`model`] wires these together into a training
//! or an inference graph; [`checkpoint`] persists named weight groups.
//!
//! All tensors are `f32` in NHWC layout with a leading batch axis. Box
//! coordinates are `[y1, x1, y2, x2]`, normalized to `[0, 1]` image space
//! unless a function says otherwise.

use log::LevelFilter;

pub mod anchors;
pub mod backbone;
pub mod boxes;
pub mod checkpoint;
pub mod config;
pub mod detections;
pub mod heads;
pub mod losses;
pub mod meta;
pub mod model;
pub mod nn;
pub mod num;
pub mod proposals;
pub mod pyramid;
pub mod roi_align;
pub mod rpn;
pub mod targets;

/// macro-use only, not part of public API.
#[doc(hidden)]
pub fn init_logger(calling_crate: &'static str) {
    let log_level = if cfg!(debug_assertions) {
        LevelFilter::Trace
    } else {
        LevelFilter::Debug
    };
    env_logger::Builder::new()
        .filter(Some(calling_crate), log_level)
        .filter(Some(env!("CARGO_PKG_NAME")), log_level)
        .parse_default_env()
        .try_init()
        .ok();
}

/// Initializes logging to *stderr*.
///
/// If `cfg!(debug_assertions)` is enabled, the calling crate and this library
/// will log at *trace* level. Otherwise, they will log at *debug* level.
///
/// If a global logger is already registered, this macro will do nothing.
#[macro_export]
macro_rules! init_logger {
    () => {
        $crate::init_logger(env!("CARGO_CRATE_NAME"))
    };
}
