//! Weight initialization.

use ndarray::{Array1, Array2, Array4};
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Deterministic weight initializer shared by all layers of one graph.
///
/// He-normal initialization for convolution/dense kernels, zeros for biases.
/// Seeded so that two graphs built from the same configuration and seed carry
/// identical initial weights.
pub struct Initializer {
    rng: StdRng,
}

impl Initializer {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Convolution kernel `[kh, kw, cin, cout]`, He-normal scaled by fan-in.
    pub fn conv_kernel(&mut self, kh: usize, kw: usize, cin: usize, cout: usize) -> Array4<f32> {
        let fan_in = (kh * kw * cin) as f32;
        let std = (2.0 / fan_in).sqrt();
        let dist = Normal::new(0.0, std).expect("std is finite and positive");
        Array4::random_using((kh, kw, cin, cout), dist, &mut self.rng)
    }

    /// Dense kernel `[input, output]`, He-normal scaled by fan-in.
    pub fn dense_kernel(&mut self, input: usize, output: usize) -> Array2<f32> {
        let std = (2.0 / input as f32).sqrt();
        let dist = Normal::new(0.0, std).expect("std is finite and positive");
        Array2::random_using((input, output), dist, &mut self.rng)
    }

    pub fn zeros(&mut self, len: usize) -> Array1<f32> {
        Array1::zeros(len)
    }

    pub fn ones(&mut self, len: usize) -> Array1<f32> {
        Array1::ones(len)
    }
}
