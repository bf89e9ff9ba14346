//! Host-side data pipeline: token sequences in, padded stratified batches
//! out. Pure computation, no accelerator involvement.

pub mod batch;
pub mod sequence;
pub mod stats;
pub mod window;

pub use batch::{Batch, BatchAssembler, TaggedWindow};
pub use sequence::{Composer, TokenSequence};
pub use stats::{corpus_stats, sequence_stats, CorpusStats, SequenceStats};
pub use window::{Window, Windower};
