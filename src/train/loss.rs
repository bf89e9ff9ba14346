//! Masked causal language-modeling loss.
//!
//! Cross-entropy over next-token predictions, averaged over *real* positions
//! only. Padded positions contribute exactly zero loss and zero gradient —
//! the pipeline's most load-bearing correctness property.

use crate::autograd::{BackwardOp, Tensor};
use ndarray::Array1;
use std::cell::RefCell;
use std::rc::Rc;

/// Numerically stable softmax over one position's logits.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exp.iter().sum();
    exp.iter().map(|&x| x / sum).collect()
}

/// Cross-entropy of `logits` (`positions x vocab_size`, flattened) against
/// `targets`, skipping positions where `mask` is false.
///
/// Returns a scalar tensor. When no position is real the loss is zero and
/// carries no gradient.
pub fn masked_causal_ce(
    logits: &Tensor,
    targets: &[u32],
    mask: &[bool],
    vocab_size: usize,
) -> Tensor {
    let positions = targets.len();
    assert_eq!(mask.len(), positions, "mask length must match targets");
    assert_eq!(
        logits.len(),
        positions * vocab_size,
        "logits must be positions x vocab_size"
    );

    let real: usize = mask.iter().filter(|&&m| m).count();
    if real == 0 {
        return Tensor::from_vec(vec![0.0], false);
    }

    let mut total = 0.0f32;
    let mut grads = vec![0.0f32; logits.len()];
    {
        let data = logits.data();
        let flat = data.as_slice().expect("logits are contiguous");
        let inv = 1.0 / real as f32;
        for pos in 0..positions {
            if !mask[pos] {
                continue;
            }
            let row = &flat[pos * vocab_size..(pos + 1) * vocab_size];
            let probs = softmax(row);
            let target = targets[pos] as usize;
            assert!(target < vocab_size, "target id outside vocabulary");
            total -= probs[target].max(1e-10).ln();
            for (i, &p) in probs.iter().enumerate() {
                let one_hot = if i == target { 1.0 } else { 0.0 };
                grads[pos * vocab_size + i] = (p - one_hot) * inv;
            }
        }
    }

    let loss = Tensor::from_vec(vec![total / real as f32], logits.requires_grad());
    if logits.requires_grad() {
        loss.set_backward_op(Rc::new(MaskedCeBackward {
            logits: logits.clone(),
            grads: Array1::from(grads),
            out_grad: loss.grad_cell(),
        }));
    }
    loss
}

struct MaskedCeBackward {
    logits: Tensor,
    grads: Array1<f32>,
    out_grad: Rc<RefCell<Option<Array1<f32>>>>,
}

impl BackwardOp for MaskedCeBackward {
    fn backward(&self) {
        let Some(seed) = self.out_grad.borrow().as_ref().map(|g| g[0]) else {
            return;
        };
        self.logits.accumulate_grad(self.grads.mapv(|g| g * seed));
    }

    fn inputs(&self) -> Vec<Tensor> {
        vec![self.logits.clone()]
    }
}
