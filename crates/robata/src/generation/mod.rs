//! # Step Executor
//!
//! [`Generator`] advances a [`BatchState`] by one token per row. It owns the
//! engine and tokenizer collaborators and the shard position that decides
//! which rows' records this executor emits.
//!
//! Every cooperating shard runs the same steps over the same state; only the
//! emitted [`Generation`] records are partitioned, by `row % world_size == rank`.

use candle_core::{DType, Tensor};
use tracing::{debug, instrument};
use crate::batch::{BatchState, RowState};
use crate::config::ShardConfig;
use crate::engine::{EngineInput, InferenceEngine};
use crate::error::{Error, Result};
use crate::request::{Batch, GeneratedText, Generation, PrefillTokens};
use crate::tensor::constant::SEQ_DIM;
use crate::tensor::operations::{activate_column, log_softmax, next_positions, window_ending_at};
use crate::tokenizer::{decode_token, Tokenizer};

/// One step executor.
pub struct Generator<E, T> {
    engine: E,
    tokenizer: T,
    shard: ShardConfig,
}

impl<E, T> Generator<E, T>
where
    E: InferenceEngine,
    T: Tokenizer,
{
    pub fn new(engine: E, tokenizer: T, shard: ShardConfig) -> Result<Self> {
        shard.validate()?;
        Ok(Self { engine, tokenizer, shard })
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn tokenizer(&self) -> &T {
        &self.tokenizer
    }

    pub fn shard(&self) -> ShardConfig {
        self.shard
    }

    /// Builds a fresh state for `batch` with this executor's tokenizer.
    pub async fn ingest(&self, batch: Batch) -> Result<BatchState> {
        BatchState::from_batch(batch, &self.tokenizer).await
    }

    /// Runs one step over every row of `batch`.
    ///
    /// Returns the records owned by this shard and the advanced state, or
    /// `None` once every row has stopped. Any failure consumes the state.
    #[instrument(
        skip_all,
        name = "generate_token",
        fields(batch_id = batch.id(), size = batch.len())
    )]
    pub async fn generate_token(
        &self,
        mut batch: BatchState,
    ) -> Result<(Vec<Generation>, Option<BatchState>)> {
        let width = batch.attention_mask.dim(SEQ_DIM)?;
        let active_end = width - batch.padding_right_offset;
        let output = {
            let input = EngineInput {
                histories: batch
                    .rows
                    .iter()
                    .map(|row| row.all_input_ids.as_slice())
                    .collect(),
                lengths: batch.rows.iter().map(RowState::input_length).collect(),
                input_ids: batch.input_ids.clone(),
                attention_mask: window_ending_at(
                    &batch.attention_mask,
                    active_end,
                    batch.max_input_length,
                )?,
                position_ids: batch.position_ids.clone(),
                cache: batch.cache.as_ref(),
            };
            self.engine.forward(input).await?
        };

        let (rows, seq, _) = output.logits.dims3()?;
        if rows != batch.len() || seq == 0 {
            return Err(Error::Engine(format!(
                "expected logits for {} rows, got shape {:?}",
                batch.len(),
                output.logits.dims()
            )));
        }
        let logits = output.logits.to_dtype(DType::F32)?;

        let mut generations = Vec::with_capacity(batch.len());
        let mut next_ids = Vec::with_capacity(batch.len());
        let mut stopped = true;
        for (i, row) in batch.rows.iter_mut().enumerate() {
            let row_logits = logits.get(i)?;
            let last = row_logits.get(seq - 1)?.to_vec1::<f32>()?;
            if let Some(position) = last.iter().position(|score| !score.is_finite()) {
                return Err(Error::Engine(format!(
                    "non-finite logit {} for token {position} of request {}",
                    last[position], row.request.id
                )));
            }
            let next = row.token_policy.next_token(&row.all_input_ids, &last)?;

            let prompt_length = row.input_length;
            row.all_input_ids.push(next.id);
            row.input_length += 1;

            let (text, prefix_offset, read_offset) = decode_token(
                &self.tokenizer,
                &row.all_input_ids,
                row.prefix_offset,
                row.read_offset,
            )?;
            let finish_reason = row.stop_policy.check(next.id, &text);
            stopped &= finish_reason.is_some();

            if self.shard.owns_row(i) {
                let generated_text = match finish_reason {
                    Some(finish_reason) => {
                        let generated_tokens = row.stop_policy.current_tokens();
                        let start = row.all_input_ids.len() - generated_tokens as usize;
                        Some(GeneratedText {
                            text: self.tokenizer.decode(&row.all_input_ids[start..], true)?,
                            generated_tokens,
                            finish_reason,
                            seed: row.token_policy.seed(),
                        })
                    }
                    None => None,
                };
                let first_token = row.stop_policy.current_tokens() == 1;
                let prefill_tokens = if row.request.prefill_logprobs && first_token {
                    let history = &row.all_input_ids[..row.all_input_ids.len() - 1];
                    Some(self.prefill_tokens(&row_logits, history, prompt_length)?)
                } else {
                    None
                };
                generations.push(Generation {
                    request_id: row.request.id,
                    prefill_tokens,
                    token_id: next.id,
                    token_logprob: next.logprob(),
                    token_is_special: self.tokenizer.is_special(next.id),
                    token_text: text,
                    generated_text,
                });
            }

            row.prefix_offset = prefix_offset;
            row.read_offset = read_offset;
            row.finish_reason = finish_reason;
            batch.max_input_length = batch.max_input_length.max(row.input_length);
            next_ids.push(next.id);
        }

        if stopped {
            debug!(emitted = generations.len(), "every row stopped");
            return Ok((generations, None));
        }

        let device = batch.input_ids.device().clone();
        let rows = next_ids.len();
        batch.input_ids = Tensor::from_vec(next_ids, (rows, 1), &device)?;
        batch.attention_mask = activate_column(&batch.attention_mask, active_end)?;
        batch.padding_right_offset = batch.padding_right_offset.checked_sub(1).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "batch {} has no slack left for another token",
                batch.batch_id
            ))
        })?;
        batch.position_ids = next_positions(&batch.position_ids)?;
        batch.cache = if self.engine.supports_cache() { output.cache } else { None };

        Ok((generations, Some(batch)))
    }

    /// Log-probabilities of the prompt tokens, scored by the positions before them.
    fn prefill_tokens(
        &self,
        row_logits: &Tensor,
        history: &[u32],
        prompt_length: usize,
    ) -> Result<PrefillTokens> {
        let ids = history[history.len() - prompt_length..].to_vec();
        Ok(PrefillTokens {
            logprobs: prompt_logprobs(row_logits, history, prompt_length)?,
            texts: self.tokenizer.decode_each(&ids)?,
            ids,
        })
    }
}

/// Scores each prompt token but the first with the logits of the position
/// before it. Positions outside `row_logits` are `NaN`.
fn prompt_logprobs(
    row_logits: &Tensor,
    history: &[u32],
    prompt_length: usize,
) -> Result<Vec<f32>> {
    let seq = row_logits.dim(0)?;
    let start = history.len() - prompt_length;
    let mut logprobs = vec![f32::NAN; prompt_length];

    let mut positions = Vec::new();
    let mut targets = Vec::new();
    let mut slots = Vec::new();
    for slot in 1..prompt_length {
        let t = start + slot;
        if let Some(position) = (seq + t - 1).checked_sub(history.len()) {
            positions.push(position as u32);
            targets.push(history[t]);
            slots.push(slot);
        }
    }
    if positions.is_empty() {
        return Ok(logprobs);
    }

    let device = row_logits.device();
    let count = positions.len();
    let scoring = row_logits.index_select(&Tensor::from_vec(positions, count, device)?, 0)?;
    let scored = log_softmax(&scoring)?
        .gather(&Tensor::from_vec(targets, (count, 1), device)?, 1)?
        .squeeze(1)?
        .to_vec1::<f32>()?;
    for (slot, logprob) in slots.into_iter().zip(scored) {
        logprobs[slot] = logprob;
    }
    Ok(logprobs)
}
