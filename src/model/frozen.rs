//! Reference implementation of the frozen base model.
//!
//! A deliberately small causal language model: frozen token embedding, a
//! stack of projection blocks with causal state mixing, and an output head.
//! It stands in for the real pre-trained transformer at the same boundary —
//! weights load from disk, nothing here trains — and keeps the pipeline
//! testable on synthetic tiny configurations.

use super::{BaseModel, ForwardOptions, LayerSpec, VocabSpec};
use crate::adapter::AdapterSet;
use crate::autograd::checkpoint::SegmentFn;
use crate::autograd::{add, causal_mix, checkpoint, linear, relu, Tensor};
use crate::data::sequence::Composer;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Reserved control-token layout: pad, then EOS, then one token per
/// cataloged composer, then the musical vocabulary.
const PAD_ID: u32 = 0;
const EOS_ID: u32 = 1;
const COMPOSER_BASE: u32 = 2;

/// Frozen causal LM over the symbolic-music vocabulary.
#[derive(Debug)]
pub struct FrozenLanguageModel {
    vocab_size: usize,
    context_len: usize,
    hidden: usize,
    embedding: Tensor,
    blocks: Vec<(String, Tensor)>,
    head: Tensor,
}

impl FrozenLanguageModel {
    /// Deterministic synthetic model for tests and pipeline dry runs.
    ///
    /// The vocabulary must leave room for pad, EOS and the composer control
    /// tokens below the musical token range.
    pub fn synthetic(
        vocab_size: usize,
        hidden: usize,
        num_blocks: usize,
        context_len: usize,
    ) -> Self {
        let reserved = COMPOSER_BASE as usize + Composer::CATALOG.len();
        assert!(
            vocab_size > reserved,
            "vocab_size must exceed the {reserved} reserved control tokens"
        );
        assert!(hidden > 0 && context_len > 0);

        let embedding = Tensor::from_vec(seeded_weights(vocab_size * hidden, 0.5, 1), false);
        let blocks = (0..num_blocks)
            .map(|i| {
                let id = format!("block{i}.proj");
                let scale = 1.0 / (hidden as f32).sqrt();
                let weight =
                    Tensor::from_vec(seeded_weights(hidden * hidden, scale, 2 + i as u64), false);
                (id, weight)
            })
            .collect();
        let head = Tensor::from_vec(
            seeded_weights(vocab_size * hidden, 1.0 / (hidden as f32).sqrt(), 99),
            false,
        );

        Self {
            vocab_size,
            context_len,
            hidden,
            embedding,
            blocks,
            head,
        }
    }

    /// Save weights as versioned JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let state = ModelState {
            version: MODEL_FORMAT_VERSION.to_string(),
            vocab_size: self.vocab_size,
            context_len: self.context_len,
            hidden: self.hidden,
            embedding: self.embedding.data().to_vec(),
            blocks: self
                .blocks
                .iter()
                .map(|(id, w)| (id.clone(), w.data().to_vec()))
                .collect(),
            head: self.head.data().to_vec(),
        };
        let file = File::create(path)?;
        serde_json::to_writer(BufWriter::new(file), &state)?;
        Ok(())
    }

    /// Load weights from versioned JSON.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let state: ModelState = serde_json::from_reader(BufReader::new(file))?;
        if state.version != MODEL_FORMAT_VERSION {
            return Err(Error::SnapshotIntegrity(format!(
                "unsupported model format version {} (expected {MODEL_FORMAT_VERSION})",
                state.version
            )));
        }
        if state.embedding.len() != state.vocab_size * state.hidden {
            return Err(Error::AdapterValidation("embedding size mismatch".into()));
        }
        Ok(Self {
            vocab_size: state.vocab_size,
            context_len: state.context_len,
            hidden: state.hidden,
            embedding: Tensor::from_vec(state.embedding, false),
            blocks: state
                .blocks
                .into_iter()
                .map(|(id, w)| (id, Tensor::from_vec(w, false)))
                .collect(),
            head: Tensor::from_vec(state.head, false),
        })
    }

    /// Gather frozen embeddings for a token window (`rows x hidden`).
    fn embed(&self, tokens: &[u32]) -> Tensor {
        let emb = self.embedding.data();
        let mut data = Vec::with_capacity(tokens.len() * self.hidden);
        for &token in tokens {
            let t = token as usize;
            assert!(t < self.vocab_size, "token id {t} outside vocabulary");
            data.extend_from_slice(&emb.as_slice().expect("embedding is contiguous")
                [t * self.hidden..(t + 1) * self.hidden]);
        }
        Tensor::from_vec(data, false)
    }
}

const MODEL_FORMAT_VERSION: &str = "1.0";

#[derive(Serialize, Deserialize)]
struct ModelState {
    version: String,
    vocab_size: usize,
    context_len: usize,
    hidden: usize,
    embedding: Vec<f32>,
    blocks: Vec<(String, Vec<f32>)>,
    head: Vec<f32>,
}

/// One projection block with its adapter hook: base projection, additive
/// delta, causal mixing, nonlinearity.
fn block_forward(
    x: &Tensor,
    id: &str,
    weight: &Tensor,
    adapters: &AdapterSet,
    rows: usize,
    hidden: usize,
) -> Tensor {
    let base = linear(x, weight, rows, hidden, hidden);
    let projected = match adapters.delta(id, x, rows) {
        Some(delta) => add(&base, &delta),
        None => base,
    };
    relu(&causal_mix(&projected, rows, hidden))
}

impl BaseModel for FrozenLanguageModel {
    fn vocab(&self) -> VocabSpec {
        VocabSpec {
            vocab_size: self.vocab_size,
            pad_id: PAD_ID,
            eos_id: Some(EOS_ID),
        }
    }

    fn context_len(&self) -> usize {
        self.context_len
    }

    fn hidden_size(&self) -> usize {
        self.hidden
    }

    fn layer_specs(&self) -> Vec<LayerSpec> {
        let mut specs: Vec<LayerSpec> = self
            .blocks
            .iter()
            .map(|(id, _)| LayerSpec {
                id: id.clone(),
                d_in: self.hidden,
                d_out: self.hidden,
            })
            .collect();
        specs.push(LayerSpec {
            id: "head".to_string(),
            d_in: self.hidden,
            d_out: self.vocab_size,
        });
        specs
    }

    fn layer_weight(&self, layer_id: &str) -> Option<Tensor> {
        if layer_id == "head" {
            return Some(self.head.clone());
        }
        self.blocks
            .iter()
            .find(|(id, _)| id == layer_id)
            .map(|(_, w)| w.clone())
    }

    fn composer_token(&self, composer: Composer) -> Option<u32> {
        composer.catalog_index().map(|i| COMPOSER_BASE + i as u32)
    }

    fn forward(&self, tokens: &[u32], adapters: &AdapterSet, opts: &ForwardOptions) -> Tensor {
        let rows = tokens.len();
        assert!(rows > 0, "forward needs at least one token");
        assert!(
            rows <= self.context_len,
            "window of {rows} tokens exceeds context length {}",
            self.context_len
        );

        let mut h = self.embed(tokens);
        for (id, weight) in &self.blocks {
            h = if opts.gradient_checkpointing {
                let segment: SegmentFn = {
                    let id = id.clone();
                    let weight = weight.clone();
                    let adapters = adapters.clone();
                    let hidden = self.hidden;
                    std::rc::Rc::new(move |x: &Tensor| {
                        block_forward(x, &id, &weight, &adapters, x.len() / hidden, hidden)
                    })
                };
                checkpoint(segment, &h)
            } else {
                block_forward(&h, id, weight, adapters, rows, self.hidden)
            };
        }

        let logits = linear(&h, &self.head, rows, self.hidden, self.vocab_size);
        match adapters.delta("head", &h, rows) {
            Some(delta) => add(&logits, &delta),
            None => logits,
        }
    }
}

/// Deterministic pseudo-random weights; fixed by (len, scale, salt) so a
/// synthetic model is reproducible across runs and processes.
fn seeded_weights(len: usize, scale: f32, salt: u64) -> Vec<f32> {
    (0..len)
        .map(|i| ((i as f32 + salt as f32 * 37.0) * 0.137).sin() * scale)
        .collect()
}
