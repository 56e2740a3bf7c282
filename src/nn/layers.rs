//! Weight-carrying layers.

use ndarray::{s, Array1, Array2, Array3, Array4, Axis};
use rayon::prelude::*;

use super::{Initializer, Padding};
use crate::checkpoint::{ImportLog, WeightStore, Weights};

/// 2-D convolution over NHWC input, kernel layout `[kh, kw, cin, cout]`.
///
/// The forward pass lowers each image to a column matrix and runs a single
/// matrix product per image (images processed in parallel), which keeps the
/// deep backbone usable without a GPU backend.
pub struct Conv2d {
    kernel: Array4<f32>,
    bias: Array1<f32>,
    stride: usize,
    padding: Padding,
}

impl Conv2d {
    pub fn new(
        cin: usize,
        cout: usize,
        kernel: (usize, usize),
        stride: usize,
        padding: Padding,
        init: &mut Initializer,
    ) -> Self {
        Self {
            kernel: init.conv_kernel(kernel.0, kernel.1, cin, cout),
            bias: init.zeros(cout),
            stride,
            padding,
        }
    }

    pub fn forward(&self, x: &Array4<f32>) -> Array4<f32> {
        let (n, h, w, cin) = x.dim();
        let (kh, kw, wcin, cout) = self.kernel.dim();
        assert_eq!(
            cin, wcin,
            "channel mismatch: input has {cin}, kernel expects {wcin}"
        );
        let (oh, pad_y) = self.padding.dim(h, kh, self.stride);
        let (ow, pad_x) = self.padding.dim(w, kw, self.stride);
        let kmat = self
            .kernel
            .view()
            .into_shape((kh * kw * cin, cout))
            .expect("kernel is standard layout");

        let per_image: Vec<Array3<f32>> = (0..n)
            .into_par_iter()
            .map(|b| {
                let img = x.index_axis(Axis(0), b);
                let mut cols = Array2::<f32>::zeros((oh * ow, kh * kw * cin));
                for oy in 0..oh {
                    for ox in 0..ow {
                        let mut col = cols.row_mut(oy * ow + ox);
                        for ky in 0..kh {
                            let iy = match (oy * self.stride + ky).checked_sub(pad_y) {
                                Some(iy) if iy < h => iy,
                                _ => continue,
                            };
                            for kx in 0..kw {
                                let ix = match (ox * self.stride + kx).checked_sub(pad_x) {
                                    Some(ix) if ix < w => ix,
                                    _ => continue,
                                };
                                let offset = (ky * kw + kx) * cin;
                                col.slice_mut(s![offset..offset + cin])
                                    .assign(&img.slice(s![iy, ix, ..]));
                            }
                        }
                    }
                }
                let out = cols.dot(&kmat) + &self.bias;
                out.into_shape((oh, ow, cout))
                    .expect("matmul output is standard layout")
            })
            .collect();

        let mut out = Array4::zeros((n, oh, ow, cout));
        for (b, img) in per_image.into_iter().enumerate() {
            out.index_axis_mut(Axis(0), b).assign(&img);
        }
        out
    }
}

/// Transposed convolution with non-overlapping kernel (stride equals kernel
/// size), the only form the mask head needs for its 2× upsampling step.
pub struct ConvTranspose2d {
    kernel: Array4<f32>,
    bias: Array1<f32>,
    stride: usize,
}

impl ConvTranspose2d {
    pub fn new(
        cin: usize,
        cout: usize,
        kernel: usize,
        stride: usize,
        init: &mut Initializer,
    ) -> Self {
        assert_eq!(
            kernel, stride,
            "only non-overlapping transposed convolutions are supported"
        );
        Self {
            kernel: init.conv_kernel(kernel, kernel, cin, cout),
            bias: init.zeros(cout),
            stride,
        }
    }

    pub fn forward(&self, x: &Array4<f32>) -> Array4<f32> {
        let (n, h, w, cin) = x.dim();
        let (kh, kw, wcin, cout) = self.kernel.dim();
        assert_eq!(cin, wcin);
        let s = self.stride;
        let mut out = Array4::zeros((n, h * s, w * s, cout));
        for b in 0..n {
            for y in 0..h {
                for xx in 0..w {
                    for ky in 0..kh {
                        for kx in 0..kw {
                            for co in 0..cout {
                                // Non-overlapping stride writes each output cell once.
                                let mut acc = self.bias[co];
                                for ci in 0..cin {
                                    acc += x[[b, y, xx, ci]] * self.kernel[[ky, kx, ci, co]];
                                }
                                out[[b, y * s + ky, xx * s + kx, co]] = acc;
                            }
                        }
                    }
                }
            }
        }
        out
    }
}

/// Batch normalization over the channel axis of NHWC input.
///
/// `trainable` is decoupled from whatever surrounds the layer: a frozen layer
/// normalizes with its moving statistics even during training, which keeps
/// the statistics stable when fine-tuning on small datasets.
pub struct BatchNorm {
    gamma: Array1<f32>,
    beta: Array1<f32>,
    moving_mean: Array1<f32>,
    moving_var: Array1<f32>,
    eps: f32,
    trainable: bool,
}

impl BatchNorm {
    pub fn new(channels: usize, trainable: bool, init: &mut Initializer) -> Self {
        Self {
            gamma: init.ones(channels),
            beta: init.zeros(channels),
            moving_mean: init.zeros(channels),
            moving_var: init.ones(channels),
            eps: 1e-3,
            trainable,
        }
    }

    pub fn forward(&self, x: &Array4<f32>, training: bool) -> Array4<f32> {
        let (mean, var) = if training && self.trainable {
            Self::batch_stats(x)
        } else {
            (self.moving_mean.clone(), self.moving_var.clone())
        };
        let scale = &self.gamma / (var + self.eps).mapv(f32::sqrt);
        let shift = &self.beta - &(&mean * &scale);
        x * &scale + &shift
    }

    fn batch_stats(x: &Array4<f32>) -> (Array1<f32>, Array1<f32>) {
        let c = x.dim().3;
        let count = (x.len() / c) as f32;
        let mut mean = Array1::zeros(c);
        let mut var = Array1::zeros(c);
        for lane in x.lanes(Axis(3)) {
            mean += &lane;
        }
        mean /= count;
        for lane in x.lanes(Axis(3)) {
            let d = &lane - &mean;
            var += &(&d * &d);
        }
        var /= count;
        (mean, var)
    }
}

/// Fully-connected layer, kernel layout `[input, output]`.
pub struct Dense {
    kernel: Array2<f32>,
    bias: Array1<f32>,
}

impl Dense {
    pub fn new(input: usize, output: usize, init: &mut Initializer) -> Self {
        Self {
            kernel: init.dense_kernel(input, output),
            bias: init.zeros(output),
        }
    }

    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        x.dot(&self.kernel) + &self.bias
    }
}

impl Weights for Conv2d {
    fn export(&self, prefix: &str, store: &mut WeightStore) {
        store.put(format!("{prefix}/kernel"), self.kernel.clone());
        store.put(format!("{prefix}/bias"), self.bias.clone());
    }

    fn import(&mut self, prefix: &str, store: &WeightStore, log: &mut ImportLog) {
        store.take_into(
            &format!("{prefix}/kernel"),
            self.kernel.view_mut().into_dyn(),
            log,
        );
        store.take_into(
            &format!("{prefix}/bias"),
            self.bias.view_mut().into_dyn(),
            log,
        );
    }
}

impl Weights for ConvTranspose2d {
    fn export(&self, prefix: &str, store: &mut WeightStore) {
        store.put(format!("{prefix}/kernel"), self.kernel.clone());
        store.put(format!("{prefix}/bias"), self.bias.clone());
    }

    fn import(&mut self, prefix: &str, store: &WeightStore, log: &mut ImportLog) {
        store.take_into(
            &format!("{prefix}/kernel"),
            self.kernel.view_mut().into_dyn(),
            log,
        );
        store.take_into(
            &format!("{prefix}/bias"),
            self.bias.view_mut().into_dyn(),
            log,
        );
    }
}

impl Weights for BatchNorm {
    fn export(&self, prefix: &str, store: &mut WeightStore) {
        store.put(format!("{prefix}/gamma"), self.gamma.clone());
        store.put(format!("{prefix}/beta"), self.beta.clone());
        store.put(format!("{prefix}/moving_mean"), self.moving_mean.clone());
        store.put(format!("{prefix}/moving_var"), self.moving_var.clone());
    }

    fn import(&mut self, prefix: &str, store: &WeightStore, log: &mut ImportLog) {
        store.take_into(
            &format!("{prefix}/gamma"),
            self.gamma.view_mut().into_dyn(),
            log,
        );
        store.take_into(
            &format!("{prefix}/beta"),
            self.beta.view_mut().into_dyn(),
            log,
        );
        store.take_into(
            &format!("{prefix}/moving_mean"),
            self.moving_mean.view_mut().into_dyn(),
            log,
        );
        store.take_into(
            &format!("{prefix}/moving_var"),
            self.moving_var.view_mut().into_dyn(),
            log,
        );
    }
}

impl Weights for Dense {
    fn export(&self, prefix: &str, store: &mut WeightStore) {
        store.put(format!("{prefix}/kernel"), self.kernel.clone());
        store.put(format!("{prefix}/bias"), self.bias.clone());
    }

    fn import(&mut self, prefix: &str, store: &WeightStore, log: &mut ImportLog) {
        store.take_into(
            &format!("{prefix}/kernel"),
            self.kernel.view_mut().into_dyn(),
            log,
        );
        store.take_into(
            &format!("{prefix}/bias"),
            self.bias.view_mut().into_dyn(),
            log,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn conv_shapes_same_and_valid() {
        let mut init = Initializer::new(0);
        let x = Array4::<f32>::ones((2, 8, 8, 3));

        let same = Conv2d::new(3, 5, (3, 3), 1, Padding::Same, &mut init);
        assert_eq!(same.forward(&x).dim(), (2, 8, 8, 5));

        let strided = Conv2d::new(3, 5, (3, 3), 2, Padding::Same, &mut init);
        assert_eq!(strided.forward(&x).dim(), (2, 4, 4, 5));

        let valid = Conv2d::new(3, 5, (3, 3), 1, Padding::Valid, &mut init);
        assert_eq!(valid.forward(&x).dim(), (2, 6, 6, 5));
    }

    #[test]
    fn conv_computes_known_sum() {
        let mut init = Initializer::new(0);
        let mut conv = Conv2d::new(1, 1, (3, 3), 1, Padding::Valid, &mut init);
        conv.kernel.fill(1.0);
        conv.bias.fill(0.5);
        let x = Array4::<f32>::ones((1, 3, 3, 1));
        let y = conv.forward(&x);
        assert_eq!(y.dim(), (1, 1, 1, 1));
        assert_relative_eq!(y[[0, 0, 0, 0]], 9.5);
    }

    #[test]
    fn deconv_doubles_resolution() {
        let mut init = Initializer::new(0);
        let deconv = ConvTranspose2d::new(4, 2, 2, 2, &mut init);
        let x = Array4::<f32>::ones((1, 7, 7, 4));
        assert_eq!(deconv.forward(&x).dim(), (1, 14, 14, 2));
    }

    #[test]
    fn frozen_batchnorm_ignores_batch_stats() {
        let mut init = Initializer::new(0);
        let bn = BatchNorm::new(2, false, &mut init);
        let x = Array4::from_shape_fn((1, 2, 2, 2), |(_, y, xx, c)| (y + xx + c) as f32 * 10.0);
        // Moving stats are identity (mean 0, var 1), so a frozen layer passes
        // values through up to epsilon.
        let y = bn.forward(&x, true);
        for (a, b) in y.iter().zip(x.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-2);
        }
    }

    #[test]
    fn trainable_batchnorm_centers_batch() {
        let mut init = Initializer::new(0);
        let bn = BatchNorm::new(1, true, &mut init);
        let x = Array4::from_shape_fn((1, 2, 2, 1), |(_, y, xx, _)| (y * 2 + xx) as f32);
        let y = bn.forward(&x, true);
        let mean = y.mean().unwrap();
        assert_relative_eq!(mean, 0.0, epsilon = 1e-5);
    }

    #[test]
    fn dense_matches_manual_product() {
        let mut init = Initializer::new(0);
        let mut dense = Dense::new(2, 1, &mut init);
        dense.kernel.assign(&ndarray::arr2(&[[2.0], [3.0]]));
        dense.bias.fill(1.0);
        let x = ndarray::arr2(&[[1.0, 1.0]]);
        let y = dense.forward(&x);
        assert_relative_eq!(y[[0, 0]], 6.0);
    }

    #[test]
    fn conv_weights_round_trip_through_store() {
        let mut init = Initializer::new(1);
        let conv = Conv2d::new(2, 3, (1, 1), 1, Padding::Valid, &mut init);
        let mut store = WeightStore::new();
        conv.export("layer", &mut store);

        let mut other = Conv2d::new(2, 3, (1, 1), 1, Padding::Valid, &mut Initializer::new(2));
        let mut log = ImportLog::default();
        other.import("layer", &store, &mut log);
        log.finish().unwrap();
        assert_eq!(conv.kernel, other.kernel);
        assert_eq!(conv.bias, other.bias);
    }
}
