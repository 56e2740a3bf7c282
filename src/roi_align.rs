//! Pyramid ROI alignment.
//!
//! Extracts a fixed `pool × pool` feature patch per proposal by bilinearly
//! sampling the pyramid level whose resolution best matches the proposal's
//! size: a box covering ~224² image pixels samples P4, larger boxes route
//! coarser, smaller boxes finer. Downstream heads therefore never see the
//! proposal's original size.

use ndarray::{Array3, Array4, ArrayView2, ArrayView3, Axis};
use rayon::prelude::*;

/// Selects the pyramid level (2..=5, as an index 0..=3 into P2..P5) for a
/// normalized box, following the `4 + log2(sqrt(area)/224)` heuristic.
fn roi_level(roi: &[f32], image_shape: (usize, usize), num_levels: usize) -> usize {
    let h = (roi[2] - roi[0]).max(0.0);
    let w = (roi[3] - roi[1]).max(0.0);
    let image_scale = ((image_shape.0 * image_shape.1) as f32).sqrt();
    let pixel_extent = (h * w).sqrt() * image_scale;
    if pixel_extent <= 0.0 {
        return 0;
    }
    let level = 4.0 + (pixel_extent / 224.0).log2();
    (level.round() as i64).clamp(2, 2 + num_levels as i64 - 1) as usize - 2
}

/// Bilinearly samples one `pool × pool` patch from `features` (`[H, W, C]`)
/// inside the normalized box, with crop-and-resize corner alignment.
fn sample_patch(features: ArrayView3<'_, f32>, roi: &[f32], pool: usize) -> Array3<f32> {
    let (fh, fw, c) = features.dim();
    let mut out = Array3::zeros((pool, pool, c));

    let grid = |lo: f32, hi: f32, steps: usize, extent: usize, i: usize| -> f32 {
        let max = (extent - 1) as f32;
        if steps > 1 {
            lo * max + (hi - lo) * max * i as f32 / (steps - 1) as f32
        } else {
            (lo + hi) * 0.5 * max
        }
    };

    for py in 0..pool {
        let y = grid(roi[0], roi[2], pool, fh, py).clamp(0.0, (fh - 1) as f32);
        let y0 = y.floor() as usize;
        let y1 = (y0 + 1).min(fh - 1);
        let fy = y - y0 as f32;
        for px in 0..pool {
            let x = grid(roi[1], roi[3], pool, fw, px).clamp(0.0, (fw - 1) as f32);
            let x0 = x.floor() as usize;
            let x1 = (x0 + 1).min(fw - 1);
            let fx = x - x0 as f32;

            for ch in 0..c {
                let top = features[[y0, x0, ch]] * (1.0 - fx) + features[[y0, x1, ch]] * fx;
                let bottom = features[[y1, x0, ch]] * (1.0 - fx) + features[[y1, x1, ch]] * fx;
                out[[py, px, ch]] = top * (1.0 - fy) + bottom * fy;
            }
        }
    }
    out
}

/// Extracts aligned feature patches for every proposal of one image.
///
/// `levels` are the P2..P5 feature maps (batch axis included), `batch` the
/// image's index within them. The output shape is
/// `[rois, pool, pool, channels]` regardless of the input box sizes.
pub fn pyramid_roi_align(
    rois: ArrayView2<'_, f32>,
    levels: &[&Array4<f32>],
    batch: usize,
    pool: usize,
    image_shape: (usize, usize),
) -> Array4<f32> {
    assert!(!levels.is_empty());
    let channels = levels[0].dim().3;

    let patches: Vec<Array3<f32>> = (0..rois.nrows())
        .into_par_iter()
        .map(|r| {
            let roi = [rois[[r, 0]], rois[[r, 1]], rois[[r, 2]], rois[[r, 3]]];
            let level = roi_level(&roi, image_shape, levels.len());
            let features = levels[level].index_axis(Axis(0), batch);
            sample_patch(features, &roi, pool)
        })
        .collect();

    let mut out = Array4::zeros((rois.nrows(), pool, pool, channels));
    for (r, patch) in patches.into_iter().enumerate() {
        out.index_axis_mut(Axis(0), r).assign(&patch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn output_shape_is_fixed() {
        let p2 = Array4::<f32>::zeros((1, 16, 16, 8));
        let p3 = Array4::<f32>::zeros((1, 8, 8, 8));
        let p4 = Array4::<f32>::zeros((1, 4, 4, 8));
        let p5 = Array4::<f32>::zeros((1, 2, 2, 8));
        let rois = array![
            [0.0, 0.0, 1.0, 1.0],
            [0.2, 0.2, 0.25, 0.25],
            [0.0, 0.0, 0.0, 0.0],
        ];
        let out = pyramid_roi_align(rois.view(), &[&p2, &p3, &p4, &p5], 0, 7, (1024, 1024));
        assert_eq!(out.dim(), (3, 7, 7, 8));
    }

    #[test]
    fn constant_features_sample_constant() {
        let level = Array4::from_elem((1, 8, 8, 2), 3.5);
        let rois = array![[0.1, 0.3, 0.6, 0.9]];
        let out = pyramid_roi_align(rois.view(), &[&level], 0, 4, (64, 64));
        for v in out.iter() {
            assert_relative_eq!(*v, 3.5);
        }
    }

    #[test]
    fn large_boxes_route_to_coarse_level() {
        // Distinguish levels by constant fill value.
        let p2 = Array4::from_elem((1, 16, 16, 1), 2.0);
        let p3 = Array4::from_elem((1, 8, 8, 1), 3.0);
        let p4 = Array4::from_elem((1, 4, 4, 1), 4.0);
        let p5 = Array4::from_elem((1, 2, 2, 1), 5.0);
        let levels = [&p2, &p3, &p4, &p5];

        let full = array![[0.0, 0.0, 1.0, 1.0]];
        let out = pyramid_roi_align(full.view(), &levels, 0, 2, (1024, 1024));
        assert_relative_eq!(out[[0, 0, 0, 0]], 5.0);

        let tiny = array![[0.0, 0.0, 0.03, 0.03]];
        let out = pyramid_roi_align(tiny.view(), &levels, 0, 2, (1024, 1024));
        assert_relative_eq!(out[[0, 0, 0, 0]], 2.0);
    }

    #[test]
    fn bilinear_interpolates_between_cells() {
        let mut level = Array4::<f32>::zeros((1, 2, 2, 1));
        level[[0, 0, 0, 0]] = 0.0;
        level[[0, 0, 1, 0]] = 1.0;
        level[[0, 1, 0, 0]] = 0.0;
        level[[0, 1, 1, 0]] = 1.0;
        // The box spans the full map; a 3-wide grid hits x = 0, 0.5, 1.
        let rois = array![[0.0, 0.0, 1.0, 1.0]];
        let out = pyramid_roi_align(rois.view(), &[&level], 0, 3, (8, 8));
        assert_relative_eq!(out[[0, 0, 0, 0]], 0.0);
        assert_relative_eq!(out[[0, 1, 1, 0]], 0.5);
        assert_relative_eq!(out[[0, 2, 2, 0]], 1.0);
    }
}
