//! # Robata
//!
//! A continuous-batching state engine for autoregressive text generation.
//!
//! ## Overview
//!
//! Many generation requests share one decode batch. Between steps, finished
//! or cancelled requests leave the batch and newly prefilled requests join
//! it, so the batch never waits for its slowest member.
//!
//! Key components include:
//!
//! - [`BatchState`](batch::BatchState), the in-flight state of one batch, with
//!   ingest, filter and merge
//! - [`Generator`](generation::Generator), which advances a batch by one token
//! - [`TokenPolicy`](policy::TokenPolicy) and [`StopPolicy`](policy::StopPolicy),
//!   the per-request decision objects
//! - [`ContinuousBatcher`](serve::ContinuousBatcher), a background driver that
//!   streams records back to each request
//!
//! The model and the tokenizer are collaborators behind the
//! [`InferenceEngine`](engine::InferenceEngine) and
//! [`Tokenizer`](tokenizer::Tokenizer) traits.
//!
//! ## Architecture
//!
//! ### Assumptions
//! Every batch-wide buffer reserves two dimensions with special meanings:
//!  - The `0th` dimension is the batch (row) dimension
//!  - The `1st` dimension is the sequence dimension
//!
//! Histories are left padded and right aligned, so the newest token of every
//! row sits in the same column.
//!
//! ### Sharding
//!
//! Several [`Generator`](generation::Generator)s may keep identical copies of
//! one batch. Each computes every row but only emits the records of the rows
//! it owns (see [`ShardConfig`](config::ShardConfig)).
//!
//! ## Features
//!
//! - **serve** - Enables the continuous batching driver (default)
//! - **tokenizers** - Enables the Hugging Face `tokenizers` adapter
//!

pub mod batch;
pub mod config;
pub mod engine;
pub mod error;
pub mod generation;
pub mod policy;
pub mod request;
mod tensor;
pub mod tokenizer;

#[cfg(feature = "serve")]
pub mod serve;

#[cfg(test)]
mod testing;

/// Constants for client reference
pub use tensor::constant;

pub mod prelude {
    //! Commonly used types.
    pub use crate::batch::{BatchState, RowState};
    pub use crate::config::{BatcherConfig, ShardConfig, TokenizerConfig};
    pub use crate::engine::{EngineInput, EngineOutput, InferenceEngine, KeyLayout, LayerCache};
    pub use crate::error::{Error, Result};
    pub use crate::generation::Generator;
    pub use crate::policy::{FinishReason, StopPolicy, TokenPolicy};
    pub use crate::request::{
        Batch, CachedBatch, GeneratedText, Generation, GenerationRequest, PrefillTokens,
        SamplingParameters, StoppingParameters,
    };
    pub use crate::tokenizer::Tokenizer;
    #[cfg(feature = "serve")]
    pub use crate::serve::{ContinuousBatcher, GenerationBatcher, GenerationStream};
}
