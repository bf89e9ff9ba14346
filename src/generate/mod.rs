//! Sliding-window generation of long-form pieces.

mod sampler;
mod sliding;

pub use sampler::{Sampler, SamplerConfig};
pub use sliding::{
    GenerateConfig, GeneratedPiece, SlidingWindowGenerator, StopReason, TokenStream,
};
