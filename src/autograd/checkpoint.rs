//! Gradient checkpointing: trade recompute for activation memory.
//!
//! A checkpointed segment runs its forward pass, keeps only the segment
//! input and the recompute closure, and drops every intermediate activation.
//! During backward the closure re-runs the forward on a fresh tape, the
//! inner graph is differentiated with the segment's output gradient as seed,
//! and the input gradient is forwarded to the outer graph. Recomputation
//! repeats the identical float operations, so results match the
//! non-checkpointed pass exactly.

use super::backward_seeded;
use super::tensor::{BackwardOp, Tensor};
use ndarray::Array1;
use std::cell::RefCell;
use std::rc::Rc;

/// Configuration for gradient checkpointing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CheckpointConfig {
    /// Whether checkpointing is enabled.
    pub enabled: bool,
}

impl CheckpointConfig {
    /// Checkpointing on.
    pub fn enabled() -> Self {
        Self { enabled: true }
    }

    /// Checkpointing off.
    pub fn disabled() -> Self {
        Self { enabled: false }
    }
}

/// Recompute closure for one checkpointed segment.
pub type SegmentFn = Rc<dyn Fn(&Tensor) -> Tensor>;

/// Run `f` over `input` as a checkpointed segment.
///
/// The forward result is computed immediately, but the tape built inside `f`
/// is discarded; only `input` and `f` are retained for the backward pass.
/// Trainable parameters captured by `f` (adapter matrices) receive their
/// gradients during the recomputed backward because tensor clones share
/// gradient storage.
pub fn checkpoint(f: SegmentFn, input: &Tensor) -> Tensor {
    // Forward on a detached input: the inner tape is dropped with `probe`,
    // freeing every intermediate activation.
    let probe = f(&input.detach());
    let needs_grad = probe.requires_grad() || input.requires_grad();
    let result = Tensor::new(probe.data().clone(), needs_grad);
    drop(probe);

    if needs_grad {
        result.set_backward_op(Rc::new(CheckpointBackward {
            f,
            input: input.clone(),
            out_grad: result.grad_cell(),
        }));
    }
    result
}

struct CheckpointBackward {
    f: SegmentFn,
    input: Tensor,
    out_grad: Rc<RefCell<Option<Array1<f32>>>>,
}

impl BackwardOp for CheckpointBackward {
    fn backward(&self) {
        let Some(g) = self.out_grad.borrow().clone() else {
            return;
        };
        // Recompute on a fresh grad-tracking leaf sharing the input's data.
        let leaf = Tensor::new(self.input.data().clone(), true);
        let recomputed = (self.f)(&leaf);
        backward_seeded(&recomputed, g);
        if self.input.requires_grad() {
            if let Some(leaf_grad) = leaf.grad() {
                self.input.accumulate_grad(leaf_grad);
            }
        }
    }

    fn inputs(&self) -> Vec<Tensor> {
        vec![self.input.clone()]
    }
}
