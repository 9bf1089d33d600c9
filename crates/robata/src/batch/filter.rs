use std::collections::HashSet;
use tracing::{debug, instrument};
use uuid::Uuid;
use crate::error::{Error, Result};
use crate::tensor::constant::SEQ_DIM;
use crate::tensor::operations::{gather_rows, pad_columns, window_ending_at};
use super::{BatchState, RowState};

impl BatchState {
    /// Keeps only `request_ids`, in the given order.
    ///
    /// Retaining the whole membership leaves the state untouched. Otherwise
    /// the mask is re-anchored to the retained rows' longest history and
    /// their largest remaining budget.
    #[instrument(
        skip_all,
        name = "filter",
        fields(batch_id = self.batch_id, size = self.len(), retain = request_ids.len())
    )]
    pub fn filter(&mut self, request_ids: &[Uuid]) -> Result<()> {
        if request_ids.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "cannot filter batch {} to no requests",
                self.batch_id
            )));
        }

        let mut seen = HashSet::with_capacity(request_ids.len());
        let mut keep = Vec::with_capacity(request_ids.len());
        for id in request_ids {
            let index = self.index_of(id).ok_or_else(|| {
                Error::InvalidArgument(format!("request {id} is not in batch {}", self.batch_id))
            })?;
            if !seen.insert(index) {
                return Err(Error::InvalidArgument(format!("request {id} is listed twice")));
            }
            keep.push(index);
        }
        if keep.len() == self.len() {
            debug!("retaining every request");
            return Ok(());
        }

        let retained = keep.iter().map(|&i| &self.rows[i]);
        let max_input_length = retained.clone().map(RowState::input_length).max().unwrap_or(0);
        let padding_right_offset = retained
            .clone()
            .map(|row| row.remaining_tokens() as usize)
            .max()
            .unwrap_or(0);
        let remaining: u64 = retained.map(|row| row.remaining_tokens() as u64).sum();

        let active_end = self.attention_mask.dim(SEQ_DIM)? - self.padding_right_offset;
        let retained_mask = gather_rows(&self.attention_mask, &keep)?;
        let attention_mask = pad_columns(
            &window_ending_at(&retained_mask, active_end, max_input_length)?,
            0,
            padding_right_offset,
        )?;
        let input_ids = gather_rows(&self.input_ids, &keep)?;
        let position_ids = gather_rows(&self.position_ids, &keep)?;
        let cache = match &self.cache {
            Some(cache) => {
                let past_len = max_input_length.saturating_sub(1);
                Some(cache.filter(self.len(), &keep, past_len)?)
            }
            None => None,
        };

        let mut slots = std::mem::take(&mut self.rows).into_iter().map(Some).collect::<Vec<_>>();
        self.rows = keep.iter().filter_map(|&i| slots[i].take()).collect();
        self.requests_idx_mapping = Self::index_rows(&self.rows);
        self.input_ids = input_ids;
        self.attention_mask = attention_mask;
        self.position_ids = position_ids;
        self.cache = cache;
        self.max_input_length = max_input_length;
        self.padding_right_offset = padding_right_offset;
        self.max_tokens = (self.rows.len() * max_input_length) as u64 + remaining;

        debug!(
            max_input_length,
            padding_right_offset,
            max_tokens = self.max_tokens,
            "filtered batch"
        );
        Ok(())
    }
}
