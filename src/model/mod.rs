//! The frozen base-model boundary.
//!
//! The pre-trained transformer is an opaque artifact: this crate drives it
//! through [`BaseModel`] and never mutates its parameters during training.
//! Adapters participate only through the additive delta hook consulted at
//! each adapted layer, so the base forward path is augmented, never replaced.

mod frozen;

pub use frozen::FrozenLanguageModel;

use crate::adapter::AdapterSet;
use crate::autograd::Tensor;
use crate::data::sequence::Composer;

/// Special-token layout of the model's vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VocabSpec {
    /// Total vocabulary size, including control tokens.
    pub vocab_size: usize,
    /// Padding token id.
    pub pad_id: u32,
    /// End-of-sequence token id, if the vocabulary has one.
    pub eos_id: Option<u32>,
}

/// Shape of one adaptable layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerSpec {
    /// Stable layer identifier (e.g. `block0.proj`, `head`).
    pub id: String,
    /// Input dimension.
    pub d_in: usize,
    /// Output dimension.
    pub d_out: usize,
}

/// Per-forward options threaded from the training configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardOptions {
    /// Recompute block activations during backward instead of retaining them.
    pub gradient_checkpointing: bool,
}

/// The frozen base transformer.
///
/// `forward` maps one token window to per-position next-token logits
/// (flattened `tokens.len() x vocab_size`), consulting `adapters` for an
/// additive correction at each adapted layer. Implementations must keep
/// their own weights out of the gradient tape (`requires_grad = false`), so
/// only adapter parameters ever receive gradients.
pub trait BaseModel {
    /// Vocabulary layout.
    fn vocab(&self) -> VocabSpec;

    /// Native context length C.
    fn context_len(&self) -> usize;

    /// Hidden state width.
    fn hidden_size(&self) -> usize;

    /// Adaptable layers, in forward order.
    fn layer_specs(&self) -> Vec<LayerSpec>;

    /// Shared handle to a layer's weight matrix (row-major `d_out x d_in`).
    /// Used by adapter merge/unmerge only; training never touches it.
    fn layer_weight(&self, layer_id: &str) -> Option<Tensor>;

    /// Conditioning control token for a composer, if the vocabulary
    /// reserves one. `Unknown` has none.
    fn composer_token(&self, composer: Composer) -> Option<u32>;

    /// Forward one window to flattened per-position logits.
    fn forward(&self, tokens: &[u32], adapters: &AdapterSet, opts: &ForwardOptions) -> Tensor;

    /// Total frozen parameter count (embedding plus adaptable layers).
    fn num_frozen_params(&self) -> usize {
        let specs: usize = self.layer_specs().iter().map(|s| s.d_in * s.d_out).sum();
        self.vocab().vocab_size * self.hidden_size() + specs
    }
}
