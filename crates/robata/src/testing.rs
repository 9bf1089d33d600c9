//! Deterministic collaborators for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use async_trait::async_trait;
use candle_core::{DType, Device, Tensor};
use uuid::Uuid;
use crate::batch::BatchState;
use crate::engine::{EngineInput, EngineOutput, InferenceEngine, KeyLayout, LayerCache};
use crate::error::{Error, Result};
use crate::request::{Batch, GenerationRequest, SamplingParameters, StoppingParameters};
use crate::tokenizer::{TokenizedBatch, Tokenizer};

pub(crate) const PAD: u32 = 0;
pub(crate) const EOS: u32 = 1;

const VOCABULARY: [&str; 13] = [
    "<pad>", "</s>", "Hello", "world", "the", "quick", "brown", "fox", "jumps", "over", "lazy",
    "dog", "<partial>",
];

pub(crate) const VOCAB_SIZE: usize = VOCABULARY.len();

/// Whitespace word tokenizer over a fixed vocabulary.
///
/// Words decode as `" word"`, specials as themselves and [`MockTokenizer::PARTIAL`]
/// as a lone replacement character.
#[derive(Debug, Clone, Default)]
pub(crate) struct MockTokenizer;

impl MockTokenizer {
    pub(crate) const PARTIAL: &'static str = "<partial>";

    pub(crate) fn new() -> Self {
        Self
    }

    pub(crate) fn id(&self, word: &str) -> u32 {
        VOCABULARY
            .iter()
            .position(|w| *w == word)
            .unwrap_or_else(|| panic!("{word} is not in the test vocabulary")) as u32
    }

    fn piece(&self, id: u32, skip_special_tokens: bool) -> Result<String> {
        let word = VOCABULARY
            .get(id as usize)
            .ok_or_else(|| Error::Tokenizer(format!("unknown id {id}")))?;
        Ok(match id {
            PAD | EOS if skip_special_tokens => String::new(),
            PAD | EOS => word.to_string(),
            _ if *word == Self::PARTIAL => "\u{FFFD}".to_string(),
            _ => format!(" {word}"),
        })
    }
}

#[async_trait]
impl Tokenizer for MockTokenizer {
    async fn encode_batch(&self, inputs: &[&str], truncate: usize) -> Result<TokenizedBatch> {
        let encodings = inputs
            .iter()
            .map(|input| {
                input
                    .split_whitespace()
                    .map(|word| {
                        VOCABULARY
                            .iter()
                            .position(|w| *w == word)
                            .map(|id| id as u32)
                            .ok_or_else(|| Error::Tokenizer(format!("unknown word {word}")))
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;
        TokenizedBatch::left_padded(encodings, truncate, PAD, &Device::Cpu)
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        ids.iter().map(|&id| self.piece(id, skip_special_tokens)).collect()
    }

    fn is_special(&self, id: u32) -> bool {
        id == PAD || id == EOS
    }

    fn eos_token_id(&self) -> Option<u32> {
        Some(EOS)
    }
}

/// Walks the plain words in vocabulary order, wrapping around.
pub(crate) fn next_word(id: u32) -> u32 {
    let first = 2;
    let words = VOCAB_SIZE as u32 - 3;
    if (first..first + words).contains(&id) {
        first + (id - first + 1) % words
    } else {
        first
    }
}

type Rule = dyn Fn(u32) -> u32 + Send + Sync;

/// Engine that puts a high score on `rule(token)` for every history token.
pub(crate) struct MockEngine {
    rule: Box<Rule>,
    full_sequence: bool,
    cache: Option<KeyLayout>,
    fail: bool,
    short_rows: bool,
    nan: bool,
    calls: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<Vec<Vec<u32>>>>>,
}

impl MockEngine {
    pub(crate) fn new() -> Self {
        Self::with_rule(next_word)
    }

    pub(crate) fn with_rule(rule: impl Fn(u32) -> u32 + Send + Sync + 'static) -> Self {
        Self {
            rule: Box::new(rule),
            full_sequence: true,
            cache: None,
            fail: false,
            short_rows: false,
            nan: false,
            calls: Arc::new(AtomicUsize::new(0)),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Return only the final position of every row.
    pub(crate) fn final_position_only(mut self) -> Self {
        self.full_sequence = false;
        self
    }

    /// Return a one-layer cache covering the active mask window.
    pub(crate) fn with_cache(mut self, layout: KeyLayout) -> Self {
        self.cache = Some(layout);
        self
    }

    pub(crate) fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Return one logits row fewer than requested.
    pub(crate) fn dropping_a_row(mut self) -> Self {
        self.short_rows = true;
        self
    }

    /// Return `NaN` for every logit.
    pub(crate) fn emitting_nan(mut self) -> Self {
        self.nan = true;
        self
    }

    pub(crate) fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    /// Histories received by every call so far.
    pub(crate) fn seen(&self) -> Arc<Mutex<Vec<Vec<Vec<u32>>>>> {
        self.seen.clone()
    }

    fn cache_for(&self, layout: KeyLayout, rows: usize, past_len: usize) -> Result<LayerCache> {
        let shape = match layout {
            KeyLayout::HeadDimLast => (rows, 1, past_len, 2),
            KeyLayout::SeqLast => (rows, 1, 2, past_len),
        };
        let keys = Tensor::ones(shape, DType::F32, &Device::Cpu)?;
        let values = Tensor::ones((rows, 1, past_len, 2), DType::F32, &Device::Cpu)?;
        Ok(LayerCache::new(vec![(keys, values)], layout))
    }
}

#[async_trait]
impl InferenceEngine for MockEngine {
    async fn forward(&self, input: EngineInput<'_>) -> Result<EngineOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(input.histories.iter().map(|h| h.to_vec()).collect());
        }
        if self.fail {
            return Err(Error::Engine("device lost".into()));
        }

        let rows = if self.short_rows { input.rows().saturating_sub(1) } else { input.rows() };
        let seq = if self.full_sequence {
            input.histories.iter().map(|h| h.len()).max().unwrap_or(1)
        } else {
            1
        };
        let fill = if self.nan { f32::NAN } else { 0.0 };
        let mut logits = vec![fill; rows * seq * VOCAB_SIZE];
        for (row, history) in input.histories.iter().take(rows).enumerate() {
            for position in 0..seq {
                let Some(t) = (position + history.len()).checked_sub(seq) else {
                    continue;
                };
                if self.nan {
                    continue;
                }
                let next = (self.rule)(history[t]) as usize;
                logits[(row * seq + position) * VOCAB_SIZE + next] = 10.0;
            }
        }
        let logits = Tensor::from_vec(logits, (rows, seq, VOCAB_SIZE), &Device::Cpu)?;

        let cache = match self.cache {
            Some(layout) => Some(self.cache_for(layout, rows, input.attention_mask.dim(1)?)?),
            None => None,
        };
        Ok(EngineOutput { logits, cache })
    }

    fn supports_cache(&self) -> bool {
        self.cache.is_some()
    }
}

pub(crate) fn request(inputs: &str, max_new_tokens: u32) -> GenerationRequest {
    GenerationRequest::new(
        inputs,
        0,
        SamplingParameters::default(),
        StoppingParameters { max_new_tokens, ..Default::default() },
    )
}

/// Ingests `(prompt, max_new_tokens)` pairs as one batch.
pub(crate) async fn ingest(id: u64, prompts: &[(&str, u32)]) -> BatchState {
    let requests = prompts.iter().map(|(inputs, max)| request(inputs, *max)).collect();
    BatchState::from_batch(Batch { id, requests }, &MockTokenizer::new())
        .await
        .unwrap()
}

pub(crate) fn mask_rows(batch: &BatchState) -> Vec<Vec<u32>> {
    batch.attention_mask().to_vec2::<u32>().unwrap()
}

pub(crate) fn ids(batch: &BatchState) -> Vec<Uuid> {
    batch.request_ids()
}
