//! Tape-based reverse-mode differentiation.
//!
//! Forward ops record a backward rule on each result; [`backward`] then runs
//! the recorded ops exactly once each, in reverse topological order, so
//! gradients through shared inputs (the base-plus-adapter fan-out at every
//! adapted layer) accumulate exactly.
//!
//! ## Gradient checkpointing
//!
//! Wrap a block in [`checkpoint::checkpoint`] to drop its intermediate
//! activations after the forward pass and recompute them on backward.

pub mod checkpoint;
pub mod ops;
pub mod precision;
mod tensor;

pub use checkpoint::{checkpoint, CheckpointConfig};
pub use ops::{add, causal_mix, linear, matmul_compute, relu, scale, transpose};
pub use precision::{
    bf16_to_f32, f32_to_bf16, GradScaler, MixedPrecisionConfig, Precision, ScalerState,
};
pub use tensor::{BackwardOp, Tensor};

use ndarray::Array1;
use std::collections::HashSet;
use std::rc::Rc;

/// Run the backward pass from `tensor`, seeding its gradient with ones.
pub fn backward(tensor: &Tensor) {
    backward_seeded(tensor, Array1::ones(tensor.len()));
}

/// Run the backward pass from `tensor` with an explicit seed gradient
/// (used for loss scaling in mixed-precision training).
pub fn backward_seeded(tensor: &Tensor, seed: Array1<f32>) {
    tensor.accumulate_grad(seed);
    let mut visited = HashSet::new();
    let mut ordered = Vec::new();
    collect_ops(tensor, &mut visited, &mut ordered);
    for op in ordered.iter().rev() {
        op.backward();
    }
}

/// Post-order walk: an op lands after all ops feeding its inputs, so the
/// reversed list runs consumers before producers.
fn collect_ops(tensor: &Tensor, visited: &mut HashSet<usize>, ordered: &mut Vec<Rc<dyn BackwardOp>>) {
    if !visited.insert(tensor.node_id()) {
        return;
    }
    if let Some(op) = tensor.backward_op() {
        for input in op.inputs() {
            collect_ops(&input, visited, ordered);
        }
        ordered.push(op);
    }
}
