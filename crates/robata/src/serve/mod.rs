//! # Continuous Batching Driver
//!
//! Runs a [`Generator`](crate::generation::Generator) behind a request queue
//! so callers only submit requests and read per-token records back.
//!
//! ## Overview
//!
//! One background task owns the single active [`BatchState`](crate::batch::BatchState)
//! and works strictly step by step:
//!
//! 1. Waiting requests are admitted while the batch size and token budget
//!    allow, tokenized into a fresh batch, run through their first step and
//!    merged into the active batch
//! 2. The active batch advances by one token
//! 3. Records are routed to each request's [`GenerationStream`]
//! 4. Finished rows and rows whose stream was dropped are filtered out
//!
//! Admission, merge and filter only happen between steps. A failed step or
//! merge drops the affected batch and ends its streams; other requests keep
//! going.
//!
//! # Example
//!
//! ```rust,ignore
//! use futures::StreamExt;
//! use robata::prelude::*;
//!
//! let generator = Generator::new(engine, tokenizer, ShardConfig::default())?;
//! let batcher = ContinuousBatcher::new(generator, BatcherConfig::default())?;
//!
//! let request = GenerationRequest::new("Hello", 0, Default::default(), Default::default());
//! let mut stream = batcher.run(request).await?;
//! while let Some(generation) = stream.next().await {
//!     print!("{}", generation.token_text);
//! }
//! ```

mod batcher;
mod queue_item;
mod scheduler;
mod stream;
mod worker;

pub use batcher::ContinuousBatcher;
pub use stream::GenerationStream;

use async_trait::async_trait;
use crate::error::Result;
use crate::request::GenerationRequest;

/// Accepts generation requests and streams their records back.
#[async_trait]
pub trait GenerationBatcher {
    /// Validates and enqueues `request`.
    ///
    /// Malformed sampling or stopping parameters are rejected here with
    /// [`Error::Policy`](crate::error::Error::Policy), before the request can
    /// reach a shared batch.
    async fn run(&self, request: GenerationRequest) -> Result<GenerationStream>;
}
