//! Memory-budgeted LoRA fine-tuning for a symbolic-music transformer.
//!
//! `afinar` turns variable-length tokenized MIDI performances into bounded
//! training windows, drives low-rank-adapter fine-tuning under a memory
//! ceiling (gradient accumulation, mixed precision, gradient checkpointing),
//! and stitches long-form compositions back together with sliding-window
//! generation.
//!
//! The base transformer is an opaque pre-trained artifact behind the
//! [`model::BaseModel`] trait; this crate never trains its weights. Adapters
//! contribute a purely additive correction to adapted layer outputs and are
//! the only trainable parameters.
//!
//! # Pipeline
//!
//! ```text
//! TokenSequence -> Windower -> BatchAssembler -> Trainer  <-> AdapterManager
//!                                                  |
//!                                                  v
//!                                              snapshot file
//!
//! seed tokens -> SlidingWindowGenerator (reads AdapterSet) -> stitched piece
//! ```
//!
//! # Example
//!
//! ```
//! use afinar::data::sequence::Composer;
//! use afinar::model::FrozenLanguageModel;
//! use afinar::adapter::{AdapterManager, TargetLayers};
//! use afinar::train::Trainer;
//! use afinar::TuneConfig;
//!
//! let model = FrozenLanguageModel::synthetic(64, 8, 2, 32);
//! let adapters = AdapterManager::attach(
//!     &model, Composer::Bach, 2, 4.0, &TargetLayers::All,
//! ).unwrap();
//! let config = TuneConfig::new(16, 4).with_batch_size(2).with_accumulation_factor(2);
//! let trainer = Trainer::new(model, adapters, config).unwrap();
//! assert_eq!(trainer.state().step, 0);
//! ```

pub mod adapter;
pub mod autograd;
pub mod config;
pub mod data;
pub mod error;
pub mod generate;
pub mod model;
pub mod optim;
pub mod train;

pub use adapter::{AdapterManager, AdapterSet, TargetLayers};
pub use autograd::Tensor;
pub use config::TuneConfig;
pub use data::{Batch, BatchAssembler, TokenSequence, Window, Windower};
pub use error::{Error, Result};
pub use generate::{GenerateConfig, SlidingWindowGenerator};
pub use model::{BaseModel, FrozenLanguageModel};
pub use train::{CancelToken, Trainer};
