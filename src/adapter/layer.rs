//! A single low-rank adapter pair.
//!
//! For a frozen weight `W (d_out x d_in)` the adapter holds `A (r x d_in)`
//! and `B (d_out x r)` and contributes `alpha/r * (x @ A^T) @ B^T` on top of
//! the layer's native output. `A` starts with small deterministic noise and
//! `B` at zero, so the correction vanishes before any training step.

use crate::autograd::{linear, scale, Tensor};
use ndarray::Array1;

/// Low-rank adapter for one base-model layer.
#[derive(Clone, Debug)]
pub struct LoraLayer {
    a: Tensor,
    b: Tensor,
    d_in: usize,
    d_out: usize,
    rank: usize,
    alpha: f32,
    scale: f32,
}

impl LoraLayer {
    /// Fresh adapter pair for a `d_out x d_in` layer.
    pub fn new(d_in: usize, d_out: usize, rank: usize, alpha: f32) -> Self {
        assert!(rank > 0, "rank must be positive");
        let a_init: Vec<f32> = (0..rank * d_in).map(|i| (i as f32 * 0.1).sin() * 0.01).collect();
        Self {
            a: Tensor::from_vec(a_init, true),
            b: Tensor::zeros(d_out * rank, true),
            d_in,
            d_out,
            rank,
            alpha,
            scale: alpha / rank as f32,
        }
    }

    /// The additive correction for a `rows x d_in` input.
    pub fn forward_delta(&self, input: &Tensor, rows: usize) -> Tensor {
        let down = linear(input, &self.a, rows, self.d_in, self.rank);
        let up = linear(&down, &self.b, rows, self.rank, self.d_out);
        scale(&up, self.scale)
    }

    /// The dense correction `alpha/r * B @ A` (`d_out x d_in`), used when
    /// folding the adapter into base weights.
    pub fn delta_matrix(&self) -> Array1<f32> {
        let a = self.a.data();
        let b = self.b.data();
        let mut out = vec![0.0f32; self.d_out * self.d_in];
        for o in 0..self.d_out {
            for r in 0..self.rank {
                let b_or = b[o * self.rank + r];
                if b_or == 0.0 {
                    continue;
                }
                for i in 0..self.d_in {
                    out[o * self.d_in + i] += self.scale * b_or * a[r * self.d_in + i];
                }
            }
        }
        Array1::from(out)
    }

    /// Trainable tensors (shared handles).
    pub fn trainable_params(&self) -> Vec<Tensor> {
        vec![self.a.clone(), self.b.clone()]
    }

    /// Down-projection matrix `A`.
    pub fn lora_a(&self) -> &Tensor {
        &self.a
    }

    /// Up-projection matrix `B`.
    pub fn lora_b(&self) -> &Tensor {
        &self.b
    }

    /// Overwrite the adapter matrices (checkpoint restore).
    pub fn set_weights(&mut self, a: Vec<f32>, b: Vec<f32>) {
        debug_assert_eq!(a.len(), self.rank * self.d_in);
        debug_assert_eq!(b.len(), self.d_out * self.rank);
        *self.a.data_mut() = Array1::from(a);
        *self.b.data_mut() = Array1::from(b);
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    pub fn scale_factor(&self) -> f32 {
        self.scale
    }

    pub fn d_in(&self) -> usize {
        self.d_in
    }

    pub fn d_out(&self) -> usize {
        self.d_out
    }

    /// Trainable parameter count.
    pub fn num_params(&self) -> usize {
        self.a.len() + self.b.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::backward;

    #[test]
    fn test_fresh_adapter_has_zero_delta() {
        let layer = LoraLayer::new(4, 4, 2, 4.0);
        let x = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], false);
        let delta = layer.forward_delta(&x, 1);
        assert!(delta.data().iter().all(|&v| v == 0.0));
        assert!(layer.delta_matrix().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_scale_is_alpha_over_rank() {
        let layer = LoraLayer::new(4, 4, 2, 8.0);
        assert_eq!(layer.scale_factor(), 4.0);
        assert_eq!(layer.num_params(), 2 * 4 + 4 * 2);
    }

    #[test]
    fn test_delta_matches_delta_matrix() {
        // For any x, forward_delta(x) == x @ (scale * B A)^T.
        let mut layer = LoraLayer::new(3, 2, 2, 2.0);
        layer.set_weights(
            vec![0.1, 0.2, 0.3, -0.1, 0.0, 0.5],
            vec![1.0, -1.0, 0.5, 2.0],
        );
        let x = Tensor::from_vec(vec![1.0, -2.0, 3.0], false);
        let delta = layer.forward_delta(&x, 1);

        let dense = layer.delta_matrix();
        let expected: Vec<f32> = (0..2)
            .map(|o| (0..3).map(|i| dense[o * 3 + i] * x.data()[i]).sum())
            .collect();
        for (got, want) in delta.data().iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-5, "got {got}, want {want}");
        }
    }

    #[test]
    fn test_gradients_reach_both_matrices_after_warmup() {
        // First backward drives B only (A's path is gated by zero B);
        // after B moves, A receives gradient too.
        let mut layer = LoraLayer::new(2, 2, 1, 1.0);
        let x = Tensor::from_vec(vec![1.0, 2.0], false);

        let delta = layer.forward_delta(&x, 1);
        backward(&delta);
        assert!(layer.lora_b().grad().unwrap().iter().any(|&g| g != 0.0));
        assert!(layer.lora_a().grad().unwrap().iter().all(|&g| g == 0.0));

        layer.set_weights(vec![0.1, 0.2], vec![1.0, 1.0]);
        layer.lora_a().zero_grad();
        layer.lora_b().zero_grad();
        let delta = layer.forward_delta(&x, 1);
        backward(&delta);
        assert!(layer.lora_a().grad().unwrap().iter().any(|&g| g != 0.0));
    }

    #[test]
    fn test_clone_shares_parameters() {
        let layer = LoraLayer::new(2, 2, 1, 1.0);
        let view = layer.clone();
        view.lora_b().data_mut()[0] = 9.0;
        assert_eq!(layer.lora_b().data()[0], 9.0);
    }
}
