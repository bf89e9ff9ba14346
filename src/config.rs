//! Training configuration.
//!
//! All pipeline knobs flow through [`TuneConfig`] explicitly; nothing reads
//! ambient or global state, so the training loop stays testable against
//! synthetic tiny models.

use crate::adapter::TargetLayers;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default memory ceiling: the ~13 GB usable on a consumer accelerator.
pub const DEFAULT_MEMORY_CEILING_BYTES: u64 = 13 * 1024 * 1024 * 1024;

/// Configuration for a fine-tuning run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuneConfig {
    /// Window length cap W (tokens per training window).
    pub max_seq_len: usize,
    /// Window overlap O (tokens shared with the previous window), `O < W`.
    pub overlap: usize,
    /// Nominal batch size B (windows per optimizer step).
    pub batch_size: usize,
    /// Accumulation factor K: each step consumes K micro-batches of B/K.
    pub accumulation_factor: usize,
    /// Target memory ceiling in bytes.
    pub memory_ceiling_bytes: u64,
    /// Reduced-precision compute with dynamic loss scaling.
    pub mixed_precision: bool,
    /// Recompute block activations during backward instead of retaining them.
    pub gradient_checkpointing: bool,
    /// LoRA rank r.
    pub adapter_rank: usize,
    /// LoRA alpha (effective scale is alpha / r).
    pub adapter_alpha: f32,
    /// Which base-model layers receive adapters.
    pub target_layers: TargetLayers,
    /// Optimizer steps between disk snapshots.
    pub checkpoint_interval: u64,
    /// Where snapshots land; `None` disables disk checkpointing.
    pub checkpoint_dir: Option<PathBuf>,
    /// Learning rate.
    pub lr: f32,
    /// Global gradient-norm clip, if any.
    pub max_grad_norm: Option<f32>,
    /// Stop after this many optimizer steps.
    pub max_steps: Option<u64>,
    /// Seed for epoch shuffling.
    pub seed: u64,
}

impl TuneConfig {
    /// New config with the given window geometry and defaults everywhere else.
    pub fn new(max_seq_len: usize, overlap: usize) -> Self {
        Self {
            max_seq_len,
            overlap,
            batch_size: 8,
            accumulation_factor: 1,
            memory_ceiling_bytes: DEFAULT_MEMORY_CEILING_BYTES,
            mixed_precision: false,
            gradient_checkpointing: false,
            adapter_rank: 8,
            adapter_alpha: 16.0,
            target_layers: TargetLayers::All,
            checkpoint_interval: 100,
            checkpoint_dir: None,
            lr: 1e-4,
            max_grad_norm: Some(1.0),
            max_steps: None,
            seed: 42,
        }
    }

    /// Set the nominal batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the gradient accumulation factor.
    pub fn with_accumulation_factor(mut self, factor: usize) -> Self {
        self.accumulation_factor = factor;
        self
    }

    /// Set the memory ceiling in bytes.
    pub fn with_memory_ceiling(mut self, bytes: u64) -> Self {
        self.memory_ceiling_bytes = bytes;
        self
    }

    /// Enable or disable mixed precision.
    pub fn with_mixed_precision(mut self, enabled: bool) -> Self {
        self.mixed_precision = enabled;
        self
    }

    /// Enable or disable gradient checkpointing.
    pub fn with_gradient_checkpointing(mut self, enabled: bool) -> Self {
        self.gradient_checkpointing = enabled;
        self
    }

    /// Set adapter rank and alpha.
    pub fn with_adapter(mut self, rank: usize, alpha: f32) -> Self {
        self.adapter_rank = rank;
        self.adapter_alpha = alpha;
        self
    }

    /// Set the adapted-layer selector.
    pub fn with_target_layers(mut self, target: TargetLayers) -> Self {
        self.target_layers = target;
        self
    }

    /// Set snapshot cadence and directory.
    pub fn with_checkpointing(mut self, interval: u64, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_interval = interval;
        self.checkpoint_dir = Some(dir.into());
        self
    }

    /// Set the learning rate.
    pub fn with_lr(mut self, lr: f32) -> Self {
        self.lr = lr;
        self
    }

    /// Set gradient clipping.
    pub fn with_grad_clip(mut self, max_norm: f32) -> Self {
        self.max_grad_norm = Some(max_norm);
        self
    }

    /// Stop after `steps` optimizer steps.
    pub fn with_max_steps(mut self, steps: u64) -> Self {
        self.max_steps = Some(steps);
        self
    }

    /// Set the shuffle seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Nominal micro-batch size B/K.
    pub fn micro_batch_size(&self) -> usize {
        self.batch_size / self.accumulation_factor.max(1)
    }

    /// Reject bad parameters before any work starts.
    pub fn validate(&self) -> Result<()> {
        if self.max_seq_len == 0 {
            return Err(Error::InvalidConfig("max_seq_len must be positive".into()));
        }
        if self.overlap >= self.max_seq_len {
            return Err(Error::InvalidConfig(format!(
                "overlap ({}) must be smaller than max_seq_len ({})",
                self.overlap, self.max_seq_len
            )));
        }
        if self.batch_size == 0 {
            return Err(Error::InvalidConfig("batch_size must be positive".into()));
        }
        if self.accumulation_factor == 0 {
            return Err(Error::InvalidConfig("accumulation_factor must be positive".into()));
        }
        if self.batch_size % self.accumulation_factor != 0 {
            return Err(Error::InvalidConfig(format!(
                "batch_size ({}) must be divisible by accumulation_factor ({})",
                self.batch_size, self.accumulation_factor
            )));
        }
        if self.adapter_rank == 0 {
            return Err(Error::InvalidConfig("adapter_rank must be positive".into()));
        }
        if self.adapter_alpha <= 0.0 {
            return Err(Error::InvalidConfig("adapter_alpha must be positive".into()));
        }
        if self.checkpoint_interval == 0 {
            return Err(Error::InvalidConfig("checkpoint_interval must be positive".into()));
        }
        if self.lr <= 0.0 {
            return Err(Error::InvalidConfig("lr must be positive".into()));
        }
        Ok(())
    }
}
