//! The memory-budgeted training loop.
//!
//! One optimizer step consumes `accumulation_factor` micro-batches; item
//! gradients are summed on the tape and rescaled so the update matches a
//! single batch of the nominal size. Mixed precision rides on dynamic loss
//! scaling: an overflowed step is silently skipped (scale halves) and only
//! persistent overflow is surfaced as divergence. Cancellation is honored at
//! micro-batch boundaries only, keeping [`TrainingState`] consistent.

use super::loss::masked_causal_ce;
use super::memory::MemoryPlan;
use super::metrics::MetricsTracker;
use super::snapshot::{snapshot_path, Snapshot};
use super::state::TrainingState;
use super::CancelToken;
use crate::adapter::AdapterManager;
use crate::autograd::{backward_seeded, GradScaler, MixedPrecisionConfig};
use crate::config::TuneConfig;
use crate::data::batch::{Batch, BatchAssembler};
use crate::data::sequence::TokenSequence;
use crate::error::{Error, Result};
use crate::model::{BaseModel, ForwardOptions};
use crate::optim::{clip_grad_norm, AdamW, Optimizer};
use ndarray::arr1;
use std::path::{Path, PathBuf};

/// Consecutive overflowed steps tolerated before declaring divergence.
const MAX_CONSECUTIVE_OVERFLOWS: u32 = 8;

/// Why an epoch loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    /// The window pool ran dry — the normal end of an epoch.
    EpochExhausted,
    /// `max_steps` was reached.
    MaxSteps,
    /// The cancel token fired.
    Cancelled,
}

/// Outcome of one epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochSummary {
    /// Micro-batches consumed.
    pub micro_batches: usize,
    /// Mean micro-batch loss.
    pub mean_loss: f32,
    /// Why the loop stopped.
    pub stop: StopCause,
}

/// Drives LoRA fine-tuning of a frozen base model.
#[derive(Debug)]
pub struct Trainer<M: BaseModel> {
    model: M,
    adapters: AdapterManager,
    optimizer: AdamW,
    scaler: GradScaler,
    config: TuneConfig,
    plan: MemoryPlan,
    state: TrainingState,
    /// Run observability: per-step losses, throughput, skip counts.
    pub metrics: MetricsTracker,
    consecutive_overflows: u32,
    last_snapshot: Option<PathBuf>,
}

impl<M: BaseModel> Trainer<M> {
    /// Validate the configuration, plan memory, and assemble the loop.
    pub fn new(model: M, adapters: AdapterManager, config: TuneConfig) -> Result<Self> {
        config.validate()?;
        if config.max_seq_len > model.context_len() {
            return Err(Error::InvalidConfig(format!(
                "max_seq_len ({}) exceeds the model context length ({})",
                config.max_seq_len,
                model.context_len()
            )));
        }

        let plan = MemoryPlan::plan(&model, adapters.num_trainable(), &config)?;
        let precision = if config.mixed_precision {
            MixedPrecisionConfig::reduced()
        } else {
            MixedPrecisionConfig::fp32()
        };
        let state = TrainingState {
            effective_batch_size: plan.effective_batch,
            ..TrainingState::default()
        };

        Ok(Self {
            model,
            adapters,
            optimizer: AdamW::default_params(config.lr),
            scaler: GradScaler::from_config(&precision),
            config,
            plan,
            state,
            metrics: MetricsTracker::new(),
            consecutive_overflows: 0,
            last_snapshot: None,
        })
    }

    /// Resume from a disk snapshot at the exact accumulation boundary it
    /// was taken on.
    pub fn resume(model: M, config: TuneConfig, path: impl AsRef<Path>) -> Result<Self> {
        let snapshot = Snapshot::load(path)?;
        let adapters = AdapterManager::from_state(snapshot.adapter, &model)?;
        let mut trainer = Self::new(model, adapters, config)?;
        trainer.optimizer.restore(snapshot.optimizer);
        trainer.scaler.restore(&snapshot.scaler);
        let effective = trainer.plan.effective_batch;
        trainer.state = snapshot.training;
        trainer.state.effective_batch_size = effective;
        Ok(trainer)
    }

    /// Train one stratified epoch over `corpus`.
    ///
    /// The epoch index perturbs the shuffle seed so successive epochs see
    /// different window orders while staying reproducible.
    pub fn train_epoch(
        &mut self,
        corpus: &[TokenSequence],
        epoch: u64,
        cancel: &CancelToken,
    ) -> Result<EpochSummary> {
        let mut assembler = BatchAssembler::new(
            corpus,
            self.config.max_seq_len,
            self.config.overlap,
            self.plan.micro_batch,
            self.model.vocab().pad_id,
            self.config.seed.wrapping_add(epoch),
        )?;

        let mut micro_batches = 0usize;
        let mut loss_sum = 0.0f32;
        let stop = loop {
            if cancel.is_cancelled() {
                break StopCause::Cancelled;
            }
            if let Some(max) = self.config.max_steps {
                if self.state.step >= max {
                    break StopCause::MaxSteps;
                }
            }
            match assembler.next_batch() {
                Ok(batch) => {
                    loss_sum += self.train_micro_batch(&batch)?;
                    micro_batches += 1;
                }
                Err(Error::EmptyBatch) => break StopCause::EpochExhausted,
                Err(e) => return Err(e),
            }
        };

        Ok(EpochSummary {
            micro_batches,
            mean_loss: if micro_batches > 0 {
                loss_sum / micro_batches as f32
            } else {
                0.0
            },
            stop,
        })
    }

    /// Forward/backward one micro-batch, applying the optimizer update when
    /// the accumulation round completes. Returns the micro-batch mean loss.
    pub fn train_micro_batch(&mut self, batch: &Batch) -> Result<f32> {
        let items: Vec<ConditionedItem> = (0..batch.batch_size)
            .filter_map(|i| self.conditioned_item(batch, i))
            .collect();
        if items.is_empty() {
            return Ok(0.0);
        }

        let opts = ForwardOptions {
            gradient_checkpointing: self.config.gradient_checkpointing,
        };
        let vocab_size = self.model.vocab().vocab_size;
        let adapter_view = self.adapters.adapter_set();
        // Per-item seed: loss scale for underflow protection, divided by the
        // item count so summed item gradients average over the micro-batch.
        let seed = self.scaler.scale() / items.len() as f32;

        let mut loss_total = 0.0f32;
        for item in &items {
            let logits = self.model.forward(&item.input, &adapter_view, &opts);
            let loss = masked_causal_ce(&logits, &item.target, &item.mask, vocab_size);
            loss_total += loss.data()[0];
            if loss.requires_grad() {
                backward_seeded(&loss, arr1(&[seed]));
            }
        }

        let mean_loss = loss_total / items.len() as f32;
        self.state.record_micro_batch(mean_loss);
        self.metrics.record_tokens(batch.num_real_tokens());

        if self.state.micro_batches_accumulated >= self.config.accumulation_factor {
            self.apply_update()?;
        }
        Ok(mean_loss)
    }

    /// Finish an accumulation round: unscale summed gradients by the loss
    /// scale and 1/K, then either update or skip on overflow.
    fn apply_update(&mut self) -> Result<()> {
        let mut params = self.adapters.trainable_params();
        let unscale = 1.0 / (self.scaler.scale() * self.config.accumulation_factor as f32);

        let mut finite = true;
        for param in &params {
            param.scale_grad(unscale);
            if let Some(grad) = param.grad() {
                if grad.iter().any(|g| !g.is_finite()) {
                    finite = false;
                }
            }
        }

        if !finite {
            // Silent recovery: discard the round, back the scale off, and
            // only escalate when overflow persists.
            self.adapters.zero_grads();
            self.scaler.update(false);
            self.state.skip_step();
            self.metrics.record_skipped();
            self.consecutive_overflows += 1;
            if self.consecutive_overflows >= MAX_CONSECUTIVE_OVERFLOWS {
                return Err(Error::Diverged {
                    step: self.state.step,
                    last_snapshot: self.last_snapshot.clone(),
                });
            }
            return Ok(());
        }

        self.consecutive_overflows = 0;
        if let Some(max_norm) = self.config.max_grad_norm {
            clip_grad_norm(&params, max_norm);
        }
        self.optimizer.step(&mut params);
        self.adapters.zero_grads();
        self.scaler.update(true);

        let step_loss = self.state.running_loss;
        self.state.complete_step();
        self.metrics.record_step(step_loss);

        if self.snapshot_due() {
            self.write_periodic_snapshot()?;
        }
        Ok(())
    }

    fn snapshot_due(&self) -> bool {
        self.config.checkpoint_dir.is_some()
            && self.state.step > 0
            && self.state.step % self.config.checkpoint_interval == 0
    }

    fn write_periodic_snapshot(&mut self) -> Result<()> {
        let dir = self
            .config
            .checkpoint_dir
            .clone()
            .expect("snapshot_due checked the directory");
        std::fs::create_dir_all(&dir)?;
        let path = snapshot_path(&dir, self.adapters.composer(), self.state.step);
        self.snapshot_to(&path)?;
        self.last_snapshot = Some(path);
        Ok(())
    }

    /// Write a snapshot to an explicit path. Only valid at an accumulation
    /// boundary, which is the only place the loop calls it from.
    pub fn snapshot_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if !self.state.at_boundary() {
            return Err(Error::InvalidConfig(
                "snapshots are only taken at accumulation boundaries".into(),
            ));
        }
        Snapshot::new(
            self.adapters.composer(),
            self.adapters.state(),
            self.optimizer.state(),
            self.state.clone(),
            self.scaler.state(),
        )
        .save(path)
    }

    /// Build the model input for one batch row: the composer control token
    /// (when the vocabulary has one) followed by the window, predicting the
    /// window itself shifted by one. Rows too short to train on are skipped.
    fn conditioned_item(&self, batch: &Batch, i: usize) -> Option<ConditionedItem> {
        let len = batch.lengths[i];
        let tokens = batch.tokens(i);
        match self.model.composer_token(batch.composers[i]) {
            Some(ctrl) => {
                if len == 0 {
                    return None;
                }
                let mut input = Vec::with_capacity(batch.seq_len);
                input.push(ctrl);
                input.extend_from_slice(&tokens[..batch.seq_len - 1]);
                Some(ConditionedItem {
                    input,
                    target: tokens.to_vec(),
                    mask: (0..batch.seq_len).map(|j| j < len).collect(),
                })
            }
            None => {
                if len < 2 {
                    return None;
                }
                Some(ConditionedItem {
                    input: tokens[..batch.seq_len - 1].to_vec(),
                    target: tokens[1..].to_vec(),
                    mask: (0..batch.seq_len - 1).map(|j| j + 1 < len).collect(),
                })
            }
        }
    }

    /// Current training state.
    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    /// The memory plan the run operates under.
    pub fn plan(&self) -> &MemoryPlan {
        &self.plan
    }

    /// The adapter manager (e.g. for saving adapters after training).
    pub fn adapters(&self) -> &AdapterManager {
        &self.adapters
    }

    /// The frozen model.
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Most recent periodic snapshot, if any.
    pub fn last_snapshot(&self) -> Option<&Path> {
        self.last_snapshot.as_deref()
    }

    /// Tear down into model and adapters (e.g. to merge for inference).
    pub fn into_parts(self) -> (M, AdapterManager) {
        (self.model, self.adapters)
    }
}

struct ConditionedItem {
    input: Vec<u32>,
    target: Vec<u32>,
    mask: Vec<bool>,
}
