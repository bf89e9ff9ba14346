//! Mutable training-loop bookkeeping.

use serde::{Deserialize, Serialize};

/// State mutated once per micro-batch and captured in every snapshot.
///
/// Snapshots are only written at accumulation boundaries, so a persisted
/// state always has `micro_batches_accumulated == 0` and a resumed run can
/// never land mid-accumulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TrainingState {
    /// Completed optimizer steps.
    pub step: u64,
    /// Micro-batches consumed since the last optimizer update.
    pub micro_batches_accumulated: usize,
    /// Exponential running loss over micro-batches.
    pub running_loss: f32,
    /// Memory-derived effective batch size (micro-batch x accumulation).
    pub effective_batch_size: usize,
    /// Optimizer steps skipped due to mixed-precision overflow.
    pub skipped_steps: u64,
}

impl TrainingState {
    /// Smoothing factor for the running loss.
    const LOSS_BETA: f32 = 0.98;

    /// Record one micro-batch's loss.
    pub fn record_micro_batch(&mut self, loss: f32) {
        self.micro_batches_accumulated += 1;
        self.running_loss = if self.step == 0 && self.micro_batches_accumulated == 1 {
            loss
        } else {
            Self::LOSS_BETA * self.running_loss + (1.0 - Self::LOSS_BETA) * loss
        };
    }

    /// Close out an accumulation round after an optimizer update.
    pub fn complete_step(&mut self) {
        self.step += 1;
        self.micro_batches_accumulated = 0;
    }

    /// Close out an accumulation round whose update was skipped (overflow).
    pub fn skip_step(&mut self) {
        self.skipped_steps += 1;
        self.micro_batches_accumulated = 0;
    }

    /// Whether the state sits on an accumulation boundary.
    pub fn at_boundary(&self) -> bool {
        self.micro_batches_accumulated == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_micro_batch_seeds_running_loss() {
        let mut state = TrainingState::default();
        state.record_micro_batch(2.0);
        assert_eq!(state.running_loss, 2.0);
        assert_eq!(state.micro_batches_accumulated, 1);
    }

    #[test]
    fn test_complete_step_resets_accumulation() {
        let mut state = TrainingState::default();
        state.record_micro_batch(1.0);
        state.record_micro_batch(1.0);
        state.complete_step();
        assert_eq!(state.step, 1);
        assert!(state.at_boundary());
    }

    #[test]
    fn test_skip_step_counts_but_does_not_advance() {
        let mut state = TrainingState::default();
        state.record_micro_batch(1.0);
        state.skip_step();
        assert_eq!(state.step, 0);
        assert_eq!(state.skipped_steps, 1);
        assert!(state.at_boundary());
    }

    #[test]
    fn test_serde_round_trip_exact() {
        let state = TrainingState {
            step: 7,
            micro_batches_accumulated: 0,
            running_loss: 1.2345678,
            effective_batch_size: 8,
            skipped_steps: 2,
        };
        let json = serde_json::to_string(&state).unwrap();
        let back: TrainingState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
