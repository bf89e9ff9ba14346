//! Error taxonomy for the fine-tuning pipeline.
//!
//! `EmptyBatch` is a normal end-of-epoch signal the caller recovers from by
//! starting the next epoch. `Diverged` and `InsufficientMemory` are fatal:
//! the run halts and the caller gets the last stable snapshot reference.

use std::path::PathBuf;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the training and generation pipeline.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad windowing/training parameters, rejected before any work starts.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// No windows remain in the epoch pool. Normal end-of-epoch signal.
    #[error("no windows remain in the current epoch")]
    EmptyBatch,

    /// `unmerge` called without a retained pre-merge weight copy.
    #[error("unmerge unavailable: pre-merge base weights were not retained")]
    UnmergeUnavailable,

    /// Persistent non-finite gradients across repeated loss-scale reductions.
    #[error("training diverged at step {step}; last stable snapshot: {last_snapshot:?}")]
    Diverged {
        step: u64,
        last_snapshot: Option<PathBuf>,
    },

    /// The memory plan cannot fit even the minimum micro-batch.
    #[error("insufficient memory: {required_bytes} bytes required at minimum batch size, ceiling is {ceiling_bytes}")]
    InsufficientMemory {
        required_bytes: u64,
        ceiling_bytes: u64,
    },

    /// A target layer selector named a layer the model does not have.
    #[error("unknown layer: {0}")]
    UnknownLayer(String),

    /// Adapter parameters do not match the model they are applied to.
    #[error("adapter validation error: {0}")]
    AdapterValidation(String),

    /// A snapshot file failed its integrity or version check.
    #[error("snapshot integrity error: {0}")]
    SnapshotIntegrity(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
