//! # Requests and Records
//!
//! Types exchanged with the outside of the batch engine: inbound generation
//! requests and batches, outbound per-step generation records, and the batch
//! summary consumed by an external scheduler.

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::error::Result;
use crate::policy::{FinishReason, StopPolicy, TokenPolicy};

/// Token selection parameters for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParameters {
    /// Logit scaling; `1.0` leaves scores untouched.
    pub temperature: f32,
    /// Keep only the `top_k` highest scores; `0` disables.
    pub top_k: u32,
    /// Nucleus threshold in `(0, 1]`; `1.0` disables.
    pub top_p: f32,
    /// Penalty applied to tokens already in the history; `1.0` disables.
    pub repetition_penalty: f32,
    /// Force random sampling even without active warpers.
    pub do_sample: bool,
    /// Seed of the sampling generator.
    pub seed: u64,
}

impl Default for SamplingParameters {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            repetition_penalty: 1.0,
            do_sample: false,
            seed: 0,
        }
    }
}

/// Stopping parameters for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoppingParameters {
    pub max_new_tokens: u32,
    pub stop_sequences: Vec<String>,
    pub ignore_eos_token: bool,
}

impl Default for StoppingParameters {
    fn default() -> Self {
        Self {
            max_new_tokens: 20,
            stop_sequences: Vec::new(),
            ignore_eos_token: false,
        }
    }
}

/// A single generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Opaque request identifier
    pub id: Uuid,
    /// Raw prompt text
    pub inputs: String,
    /// Keep at most this many prompt tokens, dropping from the left. `0` keeps all.
    pub truncate: usize,
    pub parameters: SamplingParameters,
    pub stopping_parameters: StoppingParameters,
    /// Report log-probabilities of the prompt tokens with the first generated token
    pub prefill_logprobs: bool,
}

impl GenerationRequest {
    /// Creates a request with a fresh random id.
    pub fn new(
        inputs: impl Into<String>,
        truncate: usize,
        parameters: SamplingParameters,
        stopping_parameters: StoppingParameters,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            inputs: inputs.into(),
            truncate,
            parameters,
            stopping_parameters,
            prefill_logprobs: false,
        }
    }

    pub fn with_prefill_logprobs(mut self, prefill_logprobs: bool) -> Self {
        self.prefill_logprobs = prefill_logprobs;
        self
    }

    /// Checks that both policies can be built from this request.
    ///
    /// Must pass before the request joins a shared batch: a step offers no
    /// recovery from a single misconfigured row.
    pub fn validate(&self) -> Result<()> {
        TokenPolicy::from_parameters(&self.parameters)?;
        StopPolicy::from_parameters(&self.stopping_parameters, None)?;
        Ok(())
    }
}

/// An inbound batch of fresh requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: u64,
    pub requests: Vec<GenerationRequest>,
}

/// Summary of a live batch for an external scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedBatch {
    pub id: u64,
    pub request_ids: Vec<Uuid>,
    pub size: usize,
    /// Advisory upper bound on the tokens the batch can grow to
    pub max_tokens: u64,
}

/// Prompt tokens reported with a row's first generated token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrefillTokens {
    pub ids: Vec<u32>,
    /// One entry per prompt token; the first is `NaN`.
    pub logprobs: Vec<f32>,
    pub texts: Vec<String>,
}

impl PrefillTokens {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Completed generation of a stopped row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedText {
    pub text: String,
    pub generated_tokens: u32,
    pub finish_reason: FinishReason,
    /// Set when the row used random sampling
    pub seed: Option<u64>,
}

/// Per-row output of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub request_id: Uuid,
    pub prefill_tokens: Option<PrefillTokens>,
    pub token_id: u32,
    pub token_logprob: f32,
    pub token_text: String,
    pub token_is_special: bool,
    pub generated_text: Option<GeneratedText>,
}

impl Generation {
    /// Whether this is the last record for its request.
    pub fn is_finished(&self) -> bool {
        self.generated_text.is_some()
    }
}
