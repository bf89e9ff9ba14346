//! Memory planning: fit the micro-batch under the accelerator ceiling.
//!
//! The plan estimates resident bytes for the frozen weights, the adapter
//! parameters with their gradients and AdamW moments, and per-item
//! activations (scaled by precision, and collapsed to a single block's worth
//! when gradient checkpointing recomputes the rest). The largest micro-batch
//! that fits becomes the run's effective batch size; if not even one item
//! fits, the run refuses to start.

use crate::autograd::Precision;
use crate::config::TuneConfig;
use crate::error::{Error, Result};
use crate::model::BaseModel;

/// Tensors alive per block during the backward pass (projection, delta,
/// mixed state, activation).
const TENSORS_PER_BLOCK: u64 = 4;

/// Byte budget breakdown and the fitted micro-batch size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryPlan {
    /// Frozen base parameters (always fp32 master copies).
    pub frozen_param_bytes: u64,
    /// Adapter parameters.
    pub adapter_param_bytes: u64,
    /// Adapter gradients.
    pub gradient_bytes: u64,
    /// AdamW first and second moments.
    pub optimizer_bytes: u64,
    /// Activation bytes for one window at the configured precision.
    pub activation_bytes_per_item: u64,
    /// Fitted micro-batch size (<= nominal B/K).
    pub micro_batch: usize,
    /// Achieved effective batch size (micro_batch x K).
    pub effective_batch: usize,
}

impl MemoryPlan {
    /// Derive the plan for a model/config pairing.
    pub fn plan(
        model: &dyn BaseModel,
        num_adapter_params: usize,
        config: &TuneConfig,
    ) -> Result<Self> {
        let precision = if config.mixed_precision {
            Precision::Bf16
        } else {
            Precision::Fp32
        };

        let frozen_param_bytes = model.num_frozen_params() as u64 * 4;
        let adapter_param_bytes = num_adapter_params as u64 * 4;
        let gradient_bytes = num_adapter_params as u64 * 4;
        let optimizer_bytes = num_adapter_params as u64 * 8;

        // Conditioning prepends one control token to each window.
        let seq = (config.max_seq_len + 1) as u64;
        let hidden = model.hidden_size() as u64;
        let vocab = model.vocab().vocab_size as u64;
        let blocks = model.layer_specs().len().saturating_sub(1).max(1) as u64;
        let retained_blocks = if config.gradient_checkpointing { 1 } else { blocks };
        let activation_bytes_per_item = (seq * hidden * retained_blocks * TENSORS_PER_BLOCK
            + seq * vocab)
            * precision.size_bytes() as u64;

        let fixed =
            frozen_param_bytes + adapter_param_bytes + gradient_bytes + optimizer_bytes;
        let minimum = fixed + activation_bytes_per_item;
        if minimum > config.memory_ceiling_bytes {
            return Err(Error::InsufficientMemory {
                required_bytes: minimum,
                ceiling_bytes: config.memory_ceiling_bytes,
            });
        }

        let nominal_micro = config.micro_batch_size().max(1);
        let headroom = config.memory_ceiling_bytes - fixed;
        let fitting = (headroom / activation_bytes_per_item.max(1)) as usize;
        let micro_batch = nominal_micro.min(fitting.max(1));

        Ok(Self {
            frozen_param_bytes,
            adapter_param_bytes,
            gradient_bytes,
            optimizer_bytes,
            activation_bytes_per_item,
            micro_batch,
            effective_batch: micro_batch * config.accumulation_factor,
        })
    }

    /// Estimated resident bytes at the fitted micro-batch size.
    pub fn total_bytes(&self) -> u64 {
        self.frozen_param_bytes
            + self.adapter_param_bytes
            + self.gradient_bytes
            + self.optimizer_bytes
            + self.activation_bytes_per_item * self.micro_batch as u64
    }
}
