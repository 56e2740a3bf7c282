//! Stateless tensor ops.

use ndarray::{Array, Array4, Dimension};

use super::Padding;

/// Rectified linear unit, any dimensionality.
pub fn relu<D: Dimension>(x: Array<f32, D>) -> Array<f32, D> {
    x.mapv_into(|v| v.max(0.0))
}

/// 2-D max pooling over NHWC input.
///
/// With [`Padding::Same`], cells outside the input are ignored rather than
/// treated as zeros, so border maxima are taken over the valid window only.
pub fn max_pool2d(x: &Array4<f32>, kernel: usize, stride: usize, padding: Padding) -> Array4<f32> {
    let (n, h, w, c) = x.dim();
    let (oh, pad_y) = padding.dim(h, kernel, stride);
    let (ow, pad_x) = padding.dim(w, kernel, stride);

    let mut out = Array4::from_elem((n, oh, ow, c), f32::NEG_INFINITY);
    for b in 0..n {
        for oy in 0..oh {
            for ox in 0..ow {
                for ky in 0..kernel {
                    let iy = match (oy * stride + ky).checked_sub(pad_y) {
                        Some(iy) if iy < h => iy,
                        _ => continue,
                    };
                    for kx in 0..kernel {
                        let ix = match (ox * stride + kx).checked_sub(pad_x) {
                            Some(ix) if ix < w => ix,
                            _ => continue,
                        };
                        for ch in 0..c {
                            let v = x[[b, iy, ix, ch]];
                            if v > out[[b, oy, ox, ch]] {
                                out[[b, oy, ox, ch]] = v;
                            }
                        }
                    }
                }
            }
        }
    }
    out
}

/// Nearest-neighbor 2× spatial upsampling of NHWC input.
pub fn upsample_nearest_2x(x: &Array4<f32>) -> Array4<f32> {
    let (n, h, w, c) = x.dim();
    Array4::from_shape_fn((n, h * 2, w * 2, c), |(b, y, xx, ch)| {
        x[[b, y / 2, xx / 2, ch]]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    #[test]
    fn max_pool_halves_resolution() {
        let x = Array4::from_shape_fn((1, 4, 4, 1), |(_, y, xx, _)| (y * 4 + xx) as f32);
        let out = max_pool2d(&x, 2, 2, Padding::Valid);
        assert_eq!(out.dim(), (1, 2, 2, 1));
        assert_eq!(out[[0, 0, 0, 0]], 5.0);
        assert_eq!(out[[0, 1, 1, 0]], 15.0);
    }

    #[test]
    fn max_pool_same_keeps_ceil_shape() {
        let x = Array4::<f32>::ones((1, 5, 5, 2));
        let out = max_pool2d(&x, 3, 2, Padding::Same);
        assert_eq!(out.dim(), (1, 3, 3, 2));
        // Border windows only see valid cells, so the max stays 1.
        assert!(out.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn stride_two_kernel_one_pool_subsamples() {
        let x = Array4::from_shape_fn((1, 4, 4, 1), |(_, y, xx, _)| (y * 4 + xx) as f32);
        let out = max_pool2d(&x, 1, 2, Padding::Valid);
        assert_eq!(out.dim(), (1, 2, 2, 1));
        assert_eq!(out[[0, 0, 0, 0]], 0.0);
        assert_eq!(out[[0, 1, 1, 0]], 10.0);
    }

    #[test]
    fn upsample_repeats_cells() {
        let x = Array4::from_shape_fn((1, 2, 2, 1), |(_, y, xx, _)| (y * 2 + xx) as f32);
        let out = upsample_nearest_2x(&x);
        assert_eq!(out.dim(), (1, 4, 4, 1));
        assert_eq!(out[[0, 0, 1, 0]], 0.0);
        assert_eq!(out[[0, 2, 2, 0]], 3.0);
        assert_eq!(out[[0, 3, 3, 0]], 3.0);
    }

    #[test]
    fn relu_zeroes_negatives() {
        let x = ndarray::arr1(&[-1.0, 0.5]).into_dyn();
        let out = relu(x);
        assert_eq!(out.as_slice().unwrap(), &[0.0, 0.5]);
    }
}
