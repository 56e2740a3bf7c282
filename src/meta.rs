//! Image metadata vector.
//!
//! Per-image attributes travel through the network as one flat f32 vector so
//! they can sit next to the tensors in a batch. The layout is fixed: image
//! id, original shape, resized shape, window, scale, then one active flag
//! per class.

use anyhow::{ensure, Result};
use ndarray::{Array1, ArrayView1};

/// Decoded form of the metadata vector.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageMeta {
    pub image_id: u32,
    /// Shape before resizing, `[h, w, channels]`.
    pub original_shape: [usize; 3],
    /// Shape after resizing and padding, `[h, w, channels]`.
    pub image_shape: [usize; 3],
    /// Pixel region of `image_shape` holding real image data (the rest is
    /// padding), `[y1, x1, y2, x2]`.
    pub window: [usize; 4],
    /// Resize factor from original to padded shape.
    pub scale: f32,
    /// One entry per class; 1.0 if the class exists in the image's source
    /// dataset.
    pub active_class_ids: Vec<f32>,
}

impl ImageMeta {
    /// Length of the encoded vector for a model with `num_classes` classes.
    pub fn encoded_len(num_classes: usize) -> usize {
        1 + 3 + 3 + 4 + 1 + num_classes
    }

    /// The window in normalized coordinates relative to `image_shape`.
    pub fn normalized_window(&self) -> [f32; 4] {
        let h = self.image_shape[0] as f32;
        let w = self.image_shape[1] as f32;
        [
            self.window[0] as f32 / h,
            self.window[1] as f32 / w,
            self.window[2] as f32 / h,
            self.window[3] as f32 / w,
        ]
    }

    pub fn encode(&self) -> Array1<f32> {
        let mut out = Vec::with_capacity(Self::encoded_len(self.active_class_ids.len()));
        out.push(self.image_id as f32);
        out.extend(self.original_shape.iter().map(|&v| v as f32));
        out.extend(self.image_shape.iter().map(|&v| v as f32));
        out.extend(self.window.iter().map(|&v| v as f32));
        out.push(self.scale);
        out.extend_from_slice(&self.active_class_ids);
        Array1::from_vec(out)
    }

    pub fn decode(meta: ArrayView1<'_, f32>, num_classes: usize) -> Result<Self> {
        ensure!(
            meta.len() == Self::encoded_len(num_classes),
            "image meta has {} entries, expected {} for {} classes",
            meta.len(),
            Self::encoded_len(num_classes),
            num_classes,
        );
        Ok(Self {
            image_id: meta[0] as u32,
            original_shape: [meta[1] as usize, meta[2] as usize, meta[3] as usize],
            image_shape: [meta[4] as usize, meta[5] as usize, meta[6] as usize],
            window: [meta[7] as usize, meta[8] as usize, meta[9] as usize, meta[10] as usize],
            scale: meta[11],
            active_class_ids: meta.iter().skip(12).copied().collect(),
        })
    }

    /// Metadata for an image used at its native size, with all classes
    /// active.
    pub fn full_image(image_id: u32, shape: [usize; 3], num_classes: usize) -> Self {
        Self {
            image_id,
            original_shape: shape,
            image_shape: shape,
            window: [0, 0, shape[0], shape[1]],
            scale: 1.0,
            active_class_ids: vec![1.0; num_classes],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn encode_decode_round_trip() {
        let meta = ImageMeta {
            image_id: 42,
            original_shape: [480, 640, 3],
            image_shape: [512, 512, 3],
            window: [16, 0, 496, 512],
            scale: 0.8,
            active_class_ids: vec![1.0, 0.0, 1.0],
        };
        let encoded = meta.encode();
        assert_eq!(encoded.len(), ImageMeta::encoded_len(3));
        let decoded = ImageMeta::decode(encoded.view(), 3).unwrap();
        assert_eq!(decoded, meta);
    }

    #[test]
    fn decode_rejects_wrong_length() {
        let encoded = Array1::zeros(10);
        assert!(ImageMeta::decode(encoded.view(), 3).is_err());
    }

    #[test]
    fn normalized_window_divides_by_image_shape() {
        let meta = ImageMeta {
            image_id: 0,
            original_shape: [100, 200, 3],
            image_shape: [128, 256, 3],
            window: [0, 64, 128, 192],
            scale: 1.0,
            active_class_ids: vec![1.0],
        };
        let w = meta.normalized_window();
        assert_relative_eq!(w[0], 0.0);
        assert_relative_eq!(w[1], 0.25);
        assert_relative_eq!(w[2], 1.0);
        assert_relative_eq!(w[3], 0.75);
    }
}
