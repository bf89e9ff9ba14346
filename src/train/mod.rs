//! The memory-budgeted training loop and its supporting pieces.
//!
//! [`Trainer`] drives gradient-accumulated LoRA updates under a byte ceiling
//! ([`MemoryPlan`]), with mixed-precision loss scaling, optional gradient
//! checkpointing, periodic composer-keyed disk snapshots, and cancellation
//! at micro-batch boundaries.

pub mod loss;
pub mod memory;
pub mod metrics;
pub mod snapshot;
pub mod state;
mod trainer;

pub use loss::{masked_causal_ce, softmax};
pub use memory::MemoryPlan;
pub use metrics::{perplexity, MetricsTracker};
pub use snapshot::{snapshot_path, Snapshot};
pub use state::TrainingState;
pub use trainer::{EpochSummary, StopCause, Trainer};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation signal.
///
/// Training observes it at micro-batch boundaries, generation at window
/// boundaries — never mid-unit, so state stays consistent.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A fresh, un-fired token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the token. Irrevocable for the jobs watching it.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether the token has fired.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token_fires_once_for_all_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
