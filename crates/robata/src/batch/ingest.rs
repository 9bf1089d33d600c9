use candle_core::Tensor;
use tracing::{debug, instrument};
use crate::error::{Error, Result};
use crate::policy::{StopPolicy, TokenPolicy};
use crate::request::Batch;
use crate::tensor::constant::{PREFIX_OFFSET_WINDOW, SEQ_DIM};
use crate::tensor::operations::{pad_columns, positions_from_mask};
use crate::tokenizer::Tokenizer;
use super::{BatchState, RowState};

impl BatchState {
    /// Builds a fresh state from an inbound batch.
    ///
    /// All prompts are tokenized together, left padded to the longest one and
    /// left truncated to the largest `truncate` of the set. The mask gets
    /// enough zero slack on the right for the largest `max_new_tokens`.
    #[instrument(
        skip_all,
        name = "ingest",
        fields(batch_id = batch.id, size = batch.requests.len())
    )]
    pub async fn from_batch<T>(batch: Batch, tokenizer: &T) -> Result<Self>
    where
        T: Tokenizer + ?Sized,
    {
        let Batch { id: batch_id, requests } = batch;
        if requests.is_empty() {
            return Err(Error::InvalidArgument(format!("batch {batch_id} has no requests")));
        }

        let eos_token_id = tokenizer.eos_token_id();
        let mut policies = Vec::with_capacity(requests.len());
        for request in &requests {
            policies.push((
                TokenPolicy::from_parameters(&request.parameters)?,
                StopPolicy::from_parameters(&request.stopping_parameters, eos_token_id)?,
            ));
        }

        let truncate = if requests.iter().any(|r| r.truncate == 0) {
            0
        } else {
            requests.iter().map(|r| r.truncate).max().unwrap_or(0)
        };
        let padding_right_offset = requests
            .iter()
            .map(|r| r.stopping_parameters.max_new_tokens as usize)
            .max()
            .unwrap_or(0);

        let inputs = requests.iter().map(|r| r.inputs.as_str()).collect::<Vec<_>>();
        let tokenized = tokenizer.encode_batch(&inputs, truncate).await?;
        let (rows, width) = tokenized.input_ids.dims2()?;
        if rows != requests.len() || tokenized.attention_mask.dims2()? != (rows, width) {
            return Err(Error::Tokenizer(format!(
                "expected {} encoded rows, got ids {:?} and mask {:?}",
                requests.len(),
                tokenized.input_ids.dims(),
                tokenized.attention_mask.dims()
            )));
        }

        let mask_rows = tokenized.attention_mask.to_vec2::<u32>()?;
        let lengths = mask_rows
            .iter()
            .map(|row| row.iter().filter(|&&m| m != 0).count())
            .collect::<Vec<_>>();
        if let Some(empty) = lengths.iter().position(|&len| len == 0) {
            return Err(Error::InvalidArgument(format!(
                "request {} has an empty prompt",
                requests[empty].id
            )));
        }
        let max_input_length = lengths.iter().copied().max().unwrap_or(0);

        // Columns left of the longest prompt are padding in every row.
        let skip = width - max_input_length;
        let input_ids = tokenized.input_ids.narrow(SEQ_DIM, skip, max_input_length)?;
        let mask = tokenized.attention_mask.narrow(SEQ_DIM, skip, max_input_length)?;
        let mask_rows = mask_rows.into_iter().map(|row| row[skip..].to_vec()).collect::<Vec<_>>();

        let device = input_ids.device().clone();
        let attention_mask = pad_columns(&mask, 0, padding_right_offset)?;
        let position_ids = Tensor::from_vec(
            positions_from_mask(&mask_rows),
            (rows, max_input_length),
            &device,
        )?;

        let max_tokens = requests
            .iter()
            .map(|r| (max_input_length + r.stopping_parameters.max_new_tokens as usize) as u64)
            .sum();

        let histories = input_ids.to_vec2::<u32>()?;
        let rows = requests
            .into_iter()
            .zip(policies)
            .zip(histories.into_iter().zip(lengths))
            .map(|((request, (token_policy, stop_policy)), (mut history, input_length))| {
                history.reserve(request.stopping_parameters.max_new_tokens as usize);
                RowState {
                    request,
                    all_input_ids: history,
                    input_length,
                    prefix_offset: max_input_length.saturating_sub(PREFIX_OFFSET_WINDOW),
                    read_offset: max_input_length,
                    token_policy,
                    stop_policy,
                    finish_reason: None,
                }
            })
            .collect::<Vec<_>>();

        debug!(max_input_length, padding_right_offset, max_tokens, "ingested batch");
        Ok(Self {
            batch_id,
            requests_idx_mapping: Self::index_rows(&rows),
            rows,
            input_ids,
            attention_mask,
            position_ids,
            cache: None,
            max_input_length,
            padding_right_offset,
            max_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ingest, mask_rows, request, MockTokenizer, PAD};

    #[tokio::test]
    async fn test_two_prompts_are_left_padded() {
        let tokenizer = MockTokenizer::new();
        let batch = ingest(1, &[("Hello", 3), ("Hello world", 3)]).await;

        assert_eq!(batch.max_input_length(), 2);
        assert_eq!(batch.padding_right_offset(), 3);
        assert_eq!(mask_rows(&batch), vec![vec![0, 1, 0, 0, 0], vec![1, 1, 0, 0, 0]]);
        assert_eq!(batch.rows()[0].history(), &[PAD, tokenizer.id("Hello")]);
        assert_eq!(batch.rows()[0].input_length(), 1);
        assert_eq!(batch.rows()[1].input_length(), 2);
        assert_eq!(batch.max_tokens(), 10);
        batch.assert_consistent();
    }

    #[tokio::test]
    async fn test_positions_use_sentinel_for_padding() {
        let batch = ingest(1, &[("Hello", 2), ("the quick brown", 2)]).await;
        assert_eq!(
            batch.position_ids().to_vec2::<i64>().unwrap(),
            vec![vec![1, 1, 0], vec![0, 1, 2]]
        );
    }

    #[tokio::test]
    async fn test_padding_covers_the_longest_budget() {
        let batch = ingest(1, &[("Hello", 2), ("the", 5), ("fox", 1)]).await;
        assert_eq!(batch.padding_right_offset(), 5);
        assert_eq!(batch.attention_mask().dims(), &[3, 6]);
        assert_eq!(batch.max_tokens(), 3 + 6 + 2);
        batch.assert_consistent();
    }

    #[tokio::test]
    async fn test_decode_offsets_start_near_the_prompt_end() {
        let batch = ingest(1, &[("the quick brown fox jumps over the lazy dog", 1)]).await;
        assert_eq!(batch.rows()[0].decode_offsets(), (4, 9));

        let batch = ingest(1, &[("Hello world", 1)]).await;
        assert_eq!(batch.rows()[0].decode_offsets(), (0, 2));
    }

    #[tokio::test]
    async fn test_largest_truncation_applies_to_all() {
        let mut short = request("the quick brown fox", 2);
        short.truncate = 2;
        let mut long = request("the quick brown fox", 2);
        long.truncate = 3;
        let batch = BatchState::from_batch(Batch { id: 1, requests: vec![short, long] }, &MockTokenizer::new())
            .await
            .unwrap();
        assert_eq!(batch.max_input_length(), 3);
        assert!(batch.rows().iter().all(|row| row.input_length() == 3));
    }

    #[tokio::test]
    async fn test_rejects_empty_batch_and_prompt() {
        let tokenizer = MockTokenizer::new();
        let result = BatchState::from_batch(Batch { id: 1, requests: vec![] }, &tokenizer).await;
        assert!(matches!(result, Err(Error::InvalidArgument(_))));

        let batch = Batch { id: 1, requests: vec![request("Hello", 2), request("", 2)] };
        let result = BatchState::from_batch(batch, &tokenizer).await;
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_rejects_invalid_policies() {
        let mut bad = request("Hello", 2);
        bad.parameters.temperature = 0.0;
        let result = BatchState::from_batch(Batch { id: 1, requests: vec![bad] }, &MockTokenizer::new()).await;
        assert!(matches!(result, Err(Error::Policy(_))));
    }

    #[tokio::test]
    async fn test_tokenizer_errors_propagate() {
        let batch = Batch { id: 1, requests: vec![request("unknown-word", 2)] };
        let result = BatchState::from_batch(batch, &MockTokenizer::new()).await;
        assert!(matches!(result, Err(Error::Tokenizer(_))));
    }
}
