//! # Batch State
//!
//! [`BatchState`] is the in-flight state of one decode batch: one row per
//! request plus the shared numeric buffers the engine consumes.
//!
//! ## Row layout
//!
//! Every row's per-request state lives in a single [`RowState`], and row `i`
//! of every buffer belongs to `rows[i]`, so reordering rows moves all of a
//! request's state at once.
//!
//! The attention mask is `(rows, max_input_length + padding_right_offset)`:
//!
//! ```text
//!  | left padding | history (right aligned) | slack for future tokens |
//!  0              max_input_length - len     max_input_length           width
//! ```
//!
//! ## Lifecycle
//!
//! * [`BatchState::from_batch`] builds a fresh state from a [`Batch`](crate::request::Batch)
//! * [`Generator::generate_token`](crate::generation::Generator::generate_token) advances it by one token
//! * [`BatchState::filter`] drops finished or cancelled rows
//! * [`BatchState::concatenate`] merges states between steps

mod concatenate;
mod filter;
mod ingest;

use std::collections::HashMap;
use candle_core::Tensor;
use uuid::Uuid;
use crate::engine::LayerCache;
use crate::policy::{FinishReason, StopPolicy, TokenPolicy};
use crate::request::{CachedBatch, GenerationRequest};
use crate::tensor::constant::SEQ_DIM;

/// Per-request state of one row.
#[derive(Debug, Clone)]
pub struct RowState {
    pub(crate) request: GenerationRequest,
    /// Full token history, left padding included
    pub(crate) all_input_ids: Vec<u32>,
    /// True length of the history without padding
    pub(crate) input_length: usize,
    pub(crate) prefix_offset: usize,
    pub(crate) read_offset: usize,
    pub(crate) token_policy: TokenPolicy,
    pub(crate) stop_policy: StopPolicy,
    pub(crate) finish_reason: Option<FinishReason>,
}

impl RowState {
    pub fn id(&self) -> Uuid {
        self.request.id
    }

    pub fn request(&self) -> &GenerationRequest {
        &self.request
    }

    pub fn history(&self) -> &[u32] {
        &self.all_input_ids
    }

    pub fn input_length(&self) -> usize {
        self.input_length
    }

    /// Offsets of the incremental decoder into [`history`](RowState::history).
    pub fn decode_offsets(&self) -> (usize, usize) {
        (self.prefix_offset, self.read_offset)
    }

    pub fn current_tokens(&self) -> u32 {
        self.stop_policy.current_tokens()
    }

    pub fn remaining_tokens(&self) -> u32 {
        self.stop_policy.remaining_tokens()
    }

    /// Set once the row has produced its last token.
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    pub fn is_finished(&self) -> bool {
        self.finish_reason.is_some()
    }
}

/// In-flight state of one decode batch.
#[derive(Debug)]
pub struct BatchState {
    pub(crate) batch_id: u64,
    pub(crate) rows: Vec<RowState>,
    pub(crate) requests_idx_mapping: HashMap<Uuid, usize>,

    /// `(rows, prompt_width)` before the first step, `(rows, 1)` after
    pub(crate) input_ids: Tensor,
    pub(crate) attention_mask: Tensor,
    pub(crate) position_ids: Tensor,
    pub(crate) cache: Option<LayerCache>,

    pub(crate) max_input_length: usize,
    pub(crate) padding_right_offset: usize,
    pub(crate) max_tokens: u64,
}

impl BatchState {
    pub fn id(&self) -> u64 {
        self.batch_id
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[RowState] {
        &self.rows
    }

    pub fn request_ids(&self) -> Vec<Uuid> {
        self.rows.iter().map(RowState::id).collect()
    }

    /// Row index of a request, if it is a member.
    pub fn index_of(&self, request_id: &Uuid) -> Option<usize> {
        self.requests_idx_mapping.get(request_id).copied()
    }

    pub fn max_input_length(&self) -> usize {
        self.max_input_length
    }

    pub fn padding_right_offset(&self) -> usize {
        self.padding_right_offset
    }

    /// Advisory token bound reported to schedulers.
    pub fn max_tokens(&self) -> u64 {
        self.max_tokens
    }

    pub fn input_ids(&self) -> &Tensor {
        &self.input_ids
    }

    pub fn attention_mask(&self) -> &Tensor {
        &self.attention_mask
    }

    pub fn position_ids(&self) -> &Tensor {
        &self.position_ids
    }

    pub fn cache(&self) -> Option<&LayerCache> {
        self.cache.as_ref()
    }

    /// Whether the first step has run, leaving a width-one decode input.
    pub fn is_prefilled(&self) -> bool {
        self.input_ids.dim(SEQ_DIM).is_ok_and(|width| width == 1)
            && self.rows.iter().all(|row| row.current_tokens() > 0)
    }

    /// Summary for an external scheduler.
    pub fn to_cached_batch(&self) -> CachedBatch {
        CachedBatch {
            id: self.batch_id,
            request_ids: self.request_ids(),
            size: self.len(),
            max_tokens: self.max_tokens,
        }
    }

    fn index_rows(rows: &[RowState]) -> HashMap<Uuid, usize> {
        rows.iter().enumerate().map(|(i, row)| (row.id(), i)).collect()
    }

    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        let rows = self.len();
        let width = self.max_input_length + self.padding_right_offset;
        assert_eq!(self.attention_mask.dims(), &[rows, width]);
        assert_eq!(self.input_ids.dims()[0], rows);
        assert_eq!(self.position_ids.dims(), self.input_ids.dims());
        assert_eq!(self.requests_idx_mapping.len(), rows);
        for (i, row) in self.rows.iter().enumerate() {
            assert_eq!(self.index_of(&row.id()), Some(i));
            assert!(row.input_length <= self.max_input_length);
        }
        let mask = self.attention_mask.to_vec2::<u32>().unwrap();
        for (row, columns) in self.rows.iter().zip(mask) {
            let active = &columns[..self.max_input_length];
            let start = self.max_input_length - row.input_length;
            assert!(active[..start].iter().all(|&m| m == 0));
            assert!(active[start..].iter().all(|&m| m == 1));
            assert!(columns[self.max_input_length..].iter().all(|&m| m == 0));
        }
    }
}
