//! Optimizers for the adapter parameters.

mod adamw;

pub use adamw::{AdamW, OptimizerState};

use crate::autograd::Tensor;

/// Parameter update rule.
pub trait Optimizer {
    /// Apply one update using the gradients currently on `params`.
    fn step(&mut self, params: &mut [Tensor]);

    /// Current learning rate.
    fn lr(&self) -> f32;

    /// Change the learning rate.
    fn set_lr(&mut self, lr: f32);
}

/// Clip gradients to a maximum global L2 norm, returning the pre-clip norm.
pub fn clip_grad_norm(params: &[Tensor], max_norm: f32) -> f32 {
    let mut sum_sq = 0.0f32;
    for param in params {
        if let Some(grad) = param.grad() {
            sum_sq += grad.iter().map(|g| g * g).sum::<f32>();
        }
    }
    let norm = sum_sq.sqrt();
    if norm > max_norm && norm > 0.0 {
        let factor = max_norm / norm;
        for param in params {
            param.scale_grad(factor);
        }
    }
    norm
}
