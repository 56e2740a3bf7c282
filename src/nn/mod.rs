//! The tensor layers and ops the detection graph is assembled from.
//!
//! Everything operates on `f32` [`ndarray`] arrays in NHWC layout
//! (`[batch, height, width, channels]`). Layers own their weights and expose
//! a pure `forward`; there is no implicit global state, and switching between
//! training and inference behavior (batch norm) is an explicit argument, not
//! hidden mode flipping.

pub mod init;
pub mod layers;
pub mod ops;

pub use init::Initializer;
pub use layers::{BatchNorm, Conv2d, ConvTranspose2d, Dense};
pub use ops::{max_pool2d, relu, upsample_nearest_2x};

/// Spatial padding policy of convolution and pooling ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Padding {
    /// Output has `ceil(input / stride)` cells per spatial dim; the input is
    /// zero-padded evenly (extra cell at the bottom/right when odd).
    Same,
    /// No padding; the kernel must fit entirely inside the input.
    Valid,
}

impl Padding {
    /// Computes `(out_extent, leading_pad)` for one spatial dimension.
    pub(crate) fn dim(
        self,
        input: usize,
        kernel: usize,
        stride: usize,
    ) -> (usize, usize) {
        match self {
            Padding::Same => {
                let out = input.div_ceil(stride);
                let needed = ((out - 1) * stride + kernel).saturating_sub(input);
                (out, needed / 2)
            }
            Padding::Valid => {
                assert!(
                    input >= kernel,
                    "valid-padded op needs input ({input}) >= kernel ({kernel})"
                );
                ((input - kernel) / stride + 1, 0)
            }
        }
    }
}
