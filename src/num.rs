//! Utilities for numerics.

use std::cmp::Ordering;

/// An `f32` that implements [`Ord`] according to the IEEE 754 totalOrder predicate.
///
/// Useful as a sort key when ordering detections or anchors by score.
#[derive(Clone, Copy, Debug)]
pub struct TotalF32(pub f32);

impl PartialEq for TotalF32 {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == Ordering::Equal
    }
}

impl Eq for TotalF32 {}

impl PartialOrd for TotalF32 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.0.total_cmp(&other.0))
    }
}

impl Ord for TotalF32 {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Applies the standard sigmoid/logistic function to the input.
pub fn sigmoid(v: f32) -> f32 {
    1.0 / (1.0 + (-v).exp())
}

/// Numerically stable softmax over a slice of logits.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = exp.iter().sum();
    exp.into_iter().map(|e| e / sum).collect()
}

/// Smooth-L1 (Huber with δ=1) applied to a single residual.
pub fn smooth_l1(diff: f32) -> f32 {
    let a = diff.abs();
    if a < 1.0 {
        0.5 * a * a
    } else {
        a - 0.5
    }
}

/// Numerically stable log-sum-exp of a slice of logits.
pub fn log_sum_exp(logits: &[f32]) -> f32 {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        return f32::NEG_INFINITY;
    }
    max + logits.iter().map(|&l| (l - max).exp()).sum::<f32>().ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn sigmoid_symmetry() {
        assert_relative_eq!(sigmoid(0.0), 0.5);
        assert_relative_eq!(sigmoid(3.0) + sigmoid(-3.0), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn softmax_sums_to_one() {
        let p = softmax(&[1.0, 2.0, 3.0]);
        assert_relative_eq!(p.iter().sum::<f32>(), 1.0, epsilon = 1e-6);
        assert!(p[2] > p[1] && p[1] > p[0]);
    }

    #[test]
    fn smooth_l1_branches() {
        assert_relative_eq!(smooth_l1(0.5), 0.125);
        assert_relative_eq!(smooth_l1(-0.5), 0.125);
        assert_relative_eq!(smooth_l1(2.0), 1.5);
    }

    #[test]
    fn total_f32_orders_nan_last() {
        let mut v = [TotalF32(f32::NAN), TotalF32(1.0), TotalF32(-1.0)];
        v.sort();
        assert_eq!(v[0].0, -1.0);
        assert_eq!(v[1].0, 1.0);
        assert!(v[2].0.is_nan());
    }
}
