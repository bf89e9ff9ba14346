//! Lightweight training observability.

use std::time::Instant;

/// Per-run counters and loss history.
#[derive(Debug)]
pub struct MetricsTracker {
    /// Loss per optimizer step.
    pub losses: Vec<f32>,
    /// Completed optimizer steps.
    pub steps: u64,
    /// Steps skipped on overflow.
    pub skipped_steps: u64,
    /// Real (unpadded) tokens consumed.
    pub tokens_seen: u64,
    started: Instant,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self {
            losses: Vec::new(),
            steps: 0,
            skipped_steps: 0,
            tokens_seen: 0,
            started: Instant::now(),
        }
    }

    /// Record a completed optimizer step and its loss.
    pub fn record_step(&mut self, loss: f32) {
        self.steps += 1;
        self.losses.push(loss);
    }

    /// Record a skipped step.
    pub fn record_skipped(&mut self) {
        self.skipped_steps += 1;
    }

    /// Record consumed tokens.
    pub fn record_tokens(&mut self, tokens: usize) {
        self.tokens_seen += tokens as u64;
    }

    /// Mean loss over the most recent `n` steps.
    pub fn mean_recent_loss(&self, n: usize) -> Option<f32> {
        if self.losses.is_empty() {
            return None;
        }
        let tail = &self.losses[self.losses.len().saturating_sub(n)..];
        Some(tail.iter().sum::<f32>() / tail.len() as f32)
    }

    /// Token throughput since the tracker was created.
    pub fn tokens_per_second(&self) -> f64 {
        let secs = self.started.elapsed().as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            self.tokens_seen as f64 / secs
        }
    }
}

impl Default for MetricsTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Perplexity of a cross-entropy loss.
pub fn perplexity(loss: f32) -> f32 {
    loss.exp()
}
