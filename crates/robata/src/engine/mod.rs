//! # Inference Engine Collaborator
//!
//! The neural forward computation is opaque to the batch engine. Once per
//! step the [`Generator`](crate::generation::Generator) hands every row's
//! full token history to an [`InferenceEngine`] and receives next-token logits
//! back.
//!
//! ## Logits layout
//!
//! [`EngineOutput::logits`] has shape `(rows, seq, vocab)` and is right
//! aligned: for a row whose history has length `h`, history index `t` sits at
//! position `seq - h + t`, so the final position is always `seq - 1`. An
//! engine may return only the final position (`seq == 1`); prefill
//! log-probabilities are then reported as `NaN`.
//!
//! ## Cache reuse
//!
//! An engine may return a [`LayerCache`] to be handed back on the next step.
//! The batch engine only keeps it when [`InferenceEngine::supports_cache`]
//! says so, and keeps it consistent through filter and merge. Every step still
//! sends the full history, so an engine without a cache is always correct.

mod cache;

pub use cache::{KeyLayout, LayerCache};

use async_trait::async_trait;
use candle_core::Tensor;
use crate::error::Result;

/// Everything the engine may use for one step of a batch.
#[derive(Debug, Clone)]
pub struct EngineInput<'a> {
    /// Full token history of every row, left padding included
    pub histories: Vec<&'a [u32]>,
    /// True (unpadded) length of every row
    pub lengths: Vec<usize>,
    /// Decode input, `(rows, prompt_width)` on the first step and `(rows, 1)` after
    pub input_ids: Tensor,
    /// Active region of the attention mask, `(rows, max_input_length)`
    pub attention_mask: Tensor,
    /// Position indices matching `input_ids`
    pub position_ids: Tensor,
    /// Cache returned by the previous step, if it was kept
    pub cache: Option<&'a LayerCache>,
}

impl EngineInput<'_> {
    pub fn rows(&self) -> usize {
        self.histories.len()
    }
}

/// Result of one forward pass.
#[derive(Debug, Clone)]
pub struct EngineOutput {
    /// `(rows, seq, vocab)` right-aligned logits
    pub logits: Tensor,
    pub cache: Option<LayerCache>,
}

/// # InferenceEngine
///
/// A model that scores the next token of every row of a batch.
///
/// Implementations must be correct when invoked every step with the full
/// growing history and no cache. Failures propagate to the caller of the step
/// unchanged; the batch engine never retries.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Runs one forward pass over `input`.
    async fn forward(&self, input: EngineInput<'_>) -> Result<EngineOutput>;

    /// Whether caches returned by [`forward`](InferenceEngine::forward) should be kept.
    fn supports_cache(&self) -> bool {
        false
    }
}
