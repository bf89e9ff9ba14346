//! Long-form generation beyond the model's native context.
//!
//! The generator fills one context window autoregressively; when the window
//! reaches the model's context length it is re-seeded with the last
//! `overlap` tokens of its own output (continuity overlap) and generation
//! resumes. Only freshly sampled tokens enter the stitched output, so the
//! overlap region is never duplicated.

use super::sampler::{Sampler, SamplerConfig};
use crate::adapter::AdapterSet;
use crate::data::sequence::Composer;
use crate::error::{Error, Result};
use crate::model::{BaseModel, ForwardOptions};
use crate::train::CancelToken;

/// One generation request.
#[derive(Debug, Clone)]
pub struct GenerateConfig {
    /// Target output length T in tokens; may exceed the model context.
    pub target_len: usize,
    /// Continuity overlap O carried between windows.
    pub overlap: usize,
    /// Composer conditioning, constant across all windows of the request.
    pub composer: Composer,
    /// Sampling policy, applied identically per window.
    pub sampling: SamplerConfig,
}

impl GenerateConfig {
    /// Request `target_len` tokens with default sampling.
    pub fn new(target_len: usize, overlap: usize) -> Self {
        Self {
            target_len,
            overlap,
            composer: Composer::Unknown,
            sampling: SamplerConfig::default(),
        }
    }

    /// Set the composer conditioning.
    pub fn with_composer(mut self, composer: Composer) -> Self {
        self.composer = composer;
        self
    }

    /// Set the sampling policy.
    pub fn with_sampling(mut self, sampling: SamplerConfig) -> Self {
        self.sampling = sampling;
        self
    }
}

/// Why a generation request finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The requested length was produced.
    TargetReached,
    /// The model sampled its end-of-sequence token; the output is shorter
    /// than requested. Reported, not an error.
    EndOfSequence,
    /// The cancel token fired at a window boundary.
    Cancelled,
}

/// A finished piece and how it ended.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedPiece {
    pub tokens: Vec<u32>,
    pub stop: StopReason,
}

/// Sliding-window generator over a frozen model plus adapter view.
///
/// Concurrent requests may share one generator: every call builds its own
/// private generation context, and model weights plus adapters are only read.
pub struct SlidingWindowGenerator<'m, M: BaseModel> {
    model: &'m M,
    adapters: AdapterSet,
}

impl<'m, M: BaseModel> SlidingWindowGenerator<'m, M> {
    /// Generator over `model` with `adapters` (possibly [`AdapterSet::empty`]).
    pub fn new(model: &'m M, adapters: AdapterSet) -> Self {
        Self { model, adapters }
    }

    /// Produce a whole piece for `config`, seeded by `prompt`.
    pub fn generate(
        &self,
        prompt: &[u32],
        config: &GenerateConfig,
        cancel: &CancelToken,
    ) -> Result<GeneratedPiece> {
        let mut stream = self.stream(prompt, config.clone(), cancel.clone())?;
        let tokens: Vec<u32> = stream.by_ref().collect();
        Ok(GeneratedPiece {
            tokens,
            stop: stream.stop_reason().expect("drained stream has a stop reason"),
        })
    }

    /// Lazy token-at-a-time surface over the same process.
    ///
    /// The stream is finite and not restartable mid-flight; a new request
    /// needs a fresh stream.
    pub fn stream(
        &self,
        prompt: &[u32],
        config: GenerateConfig,
        cancel: CancelToken,
    ) -> Result<TokenStream<'_, 'm, M>> {
        let context_len = self.model.context_len();
        if config.overlap >= context_len {
            return Err(Error::InvalidConfig(format!(
                "overlap ({}) must be smaller than the model context ({context_len})",
                config.overlap
            )));
        }
        if config.target_len == 0 {
            return Err(Error::InvalidConfig("target_len must be positive".into()));
        }

        let sampler = Sampler::new(config.sampling.clone());
        let ctx = GenerationContext::new(self.model, prompt, &config);
        Ok(TokenStream {
            generator: self,
            config,
            sampler,
            ctx,
            cancel,
            stop: None,
        })
    }
}

/// Per-request mutable state: the live window and the stitched output count.
struct GenerationContext {
    /// Conditioning token prepended to every window, if any.
    ctrl: Option<u32>,
    /// The current context window (conditioning + recent tokens).
    window: Vec<u32>,
    /// Tokens emitted so far.
    produced: usize,
}

impl GenerationContext {
    fn new(model: &dyn BaseModel, prompt: &[u32], config: &GenerateConfig) -> Self {
        let ctrl = model.composer_token(config.composer);
        let mut window = Vec::new();
        if let Some(c) = ctrl {
            window.push(c);
        }
        window.extend_from_slice(prompt);
        if window.is_empty() {
            // An unconditioned empty prompt still needs one context token;
            // the pad token serves as a neutral start symbol.
            window.push(model.vocab().pad_id);
        }
        Self {
            ctrl,
            window,
            produced: 0,
        }
    }

    /// Re-seed the window with its own tail: conditioning token plus the
    /// last `overlap` tokens.
    fn reseed(&mut self, overlap: usize) {
        let tail_start = self.window.len().saturating_sub(overlap);
        let tail: Vec<u32> = self.window[tail_start..].to_vec();
        self.window.clear();
        if let Some(c) = self.ctrl {
            self.window.push(c);
        }
        self.window.extend_from_slice(&tail);
    }
}

/// Finite lazy iterator of sampled tokens.
pub struct TokenStream<'g, 'm, M: BaseModel> {
    generator: &'g SlidingWindowGenerator<'m, M>,
    config: GenerateConfig,
    sampler: Sampler,
    ctx: GenerationContext,
    cancel: CancelToken,
    stop: Option<StopReason>,
}

impl<M: BaseModel> TokenStream<'_, '_, M> {
    /// Why the stream ended; `None` while tokens remain.
    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop
    }
}

impl<M: BaseModel> Iterator for TokenStream<'_, '_, M> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.stop.is_some() {
            return None;
        }
        if self.ctx.produced >= self.config.target_len {
            self.stop = Some(StopReason::TargetReached);
            return None;
        }

        let model = self.generator.model;
        let context_len = model.context_len();

        // Window boundary: re-seed with the continuity overlap. This is also
        // the only point where cancellation is honored.
        if self.ctx.window.len() >= context_len {
            if self.cancel.is_cancelled() {
                self.stop = Some(StopReason::Cancelled);
                return None;
            }
            self.ctx.reseed(self.config.overlap);
        }

        let vocab_size = model.vocab().vocab_size;
        let logits = model.forward(
            &self.ctx.window,
            &self.generator.adapters,
            &ForwardOptions::default(),
        );
        let data = logits.data();
        let flat = data.as_slice().expect("logits are contiguous");
        let last = &flat[(self.ctx.window.len() - 1) * vocab_size..];
        let token = self.sampler.sample(last);

        if model.vocab().eos_id == Some(token) {
            self.stop = Some(StopReason::EndOfSequence);
            return None;
        }

        self.ctx.window.push(token);
        self.ctx.produced += 1;
        if self.ctx.produced >= self.config.target_len {
            self.stop = Some(StopReason::TargetReached);
        }
        Some(token)
    }
}
