use candle_core::Tensor;
use tracing::{debug, instrument, warn};
use crate::engine::LayerCache;
use crate::error::{Error, Result};
use crate::tensor::constant::{BATCH_DIM, SEQ_DIM};
use crate::tensor::operations::{pad_columns, window_ending_at};
use super::BatchState;

impl BatchState {
    /// Merges prefilled states into one, keeping their row order.
    ///
    /// Each input's active mask is left padded up to the shared
    /// `max_input_length` so every history stays right aligned at the
    /// current generation point. The result takes the first input's id.
    #[instrument(skip_all, name = "concatenate", fields(batches = batches.len()))]
    pub fn concatenate(batches: Vec<BatchState>) -> Result<BatchState> {
        if batches.is_empty() {
            return Err(Error::InvalidArgument("no batches to concatenate".into()));
        }
        if let Some(fresh) = batches.iter().find(|batch| !batch.is_prefilled()) {
            return Err(Error::InvalidArgument(format!(
                "batch {} has not completed its first step",
                fresh.batch_id
            )));
        }
        if batches.len() == 1 {
            return batches
                .into_iter()
                .next()
                .ok_or_else(|| Error::InvalidArgument("no batches to concatenate".into()));
        }

        let batch_id = batches[0].batch_id;
        let max_input_length = batches.iter().map(|b| b.max_input_length).max().unwrap_or(0);
        let padding_right_offset = batches
            .iter()
            .map(|b| b.padding_right_offset)
            .max()
            .unwrap_or(0);

        let mut input_ids = Vec::with_capacity(batches.len());
        let mut position_ids = Vec::with_capacity(batches.len());
        let mut attention_mask = Vec::with_capacity(batches.len());
        let mut max_tokens = 0u64;
        for batch in &batches {
            let left_offset = max_input_length - batch.max_input_length;
            let active_end = batch.attention_mask.dim(SEQ_DIM)? - batch.padding_right_offset;
            let active =
                window_ending_at(&batch.attention_mask, active_end, batch.max_input_length)?;
            attention_mask.push(pad_columns(&active, left_offset, padding_right_offset)?);
            input_ids.push(batch.input_ids.clone());
            position_ids.push(batch.position_ids.clone());
            max_tokens += batch.max_tokens + (left_offset * batch.len()) as u64;
        }

        let cache = merge_caches(&batches, max_input_length)?;

        let rows = batches.into_iter().flat_map(|batch| batch.rows).collect::<Vec<_>>();
        debug!(
            rows = rows.len(),
            max_input_length,
            padding_right_offset,
            max_tokens,
            "merged batches"
        );
        Ok(BatchState {
            batch_id,
            requests_idx_mapping: Self::index_rows(&rows),
            rows,
            input_ids: Tensor::cat(&input_ids, BATCH_DIM)?,
            attention_mask: Tensor::cat(&attention_mask, BATCH_DIM)?,
            position_ids: Tensor::cat(&position_ids, BATCH_DIM)?,
            cache,
            max_input_length,
            padding_right_offset,
            max_tokens,
        })
    }
}

/// Merges caches when every input carries one of the same layout.
fn merge_caches(batches: &[BatchState], max_input_length: usize) -> Result<Option<LayerCache>> {
    let caches = batches.iter().filter_map(|b| b.cache.as_ref()).collect::<Vec<_>>();
    if caches.is_empty() {
        return Ok(None);
    }
    let layout = caches[0].layout();
    if caches.len() != batches.len() || caches.iter().any(|c| c.layout() != layout) {
        warn!("dropping caches of merged batches, not every batch holds a compatible one");
        return Ok(None);
    }

    let parts = batches
        .iter()
        .zip(&caches)
        .map(|(batch, cache)| (*cache, batch.len(), batch.max_input_length.saturating_sub(1)))
        .collect::<Vec<_>>();
    LayerCache::concatenate(&parts, max_input_length.saturating_sub(1)).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShardConfig;
    use crate::engine::KeyLayout;
    use crate::generation::Generator;
    use crate::testing::{ids, ingest, mask_rows, MockEngine, MockTokenizer};

    async fn prefilled<E: crate::engine::InferenceEngine>(
        generator: &Generator<E, MockTokenizer>,
        id: u64,
        prompts: &[(&str, u32)],
    ) -> BatchState {
        let batch = ingest(id, prompts).await;
        generator.generate_token(batch).await.unwrap().1.unwrap()
    }

    fn generator() -> Generator<MockEngine, MockTokenizer> {
        Generator::new(MockEngine::new(), MockTokenizer::new(), ShardConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_rejects_empty_and_fresh_inputs() {
        assert!(matches!(BatchState::concatenate(vec![]), Err(Error::InvalidArgument(_))));

        let fresh = ingest(1, &[("Hello", 3)]).await;
        assert!(matches!(BatchState::concatenate(vec![fresh]), Err(Error::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_single_input_is_returned_unchanged() {
        let batch = prefilled(&generator(), 7, &[("Hello", 3), ("the quick", 4)]).await;
        let members = ids(&batch);
        let mask = mask_rows(&batch);
        let (max_tokens, max_input_length) = (batch.max_tokens(), batch.max_input_length());
        let input_ids = batch.input_ids().id();

        let merged = BatchState::concatenate(vec![batch]).unwrap();
        assert_eq!(merged.id(), 7);
        assert_eq!(ids(&merged), members);
        assert_eq!(mask_rows(&merged), mask);
        assert_eq!(merged.max_tokens(), max_tokens);
        assert_eq!(merged.max_input_length(), max_input_length);
        assert_eq!(merged.input_ids().id(), input_ids);
        merged.assert_consistent();
    }

    #[tokio::test]
    async fn test_merge_right_aligns_histories() {
        let generator = generator();
        let a = prefilled(&generator, 3, &[("Hello", 3)]).await;
        let b = prefilled(&generator, 4, &[("the quick brown", 5), ("fox", 2)]).await;
        let expected = [ids(&a), ids(&b)].concat();
        let (tokens_a, tokens_b) = (a.max_tokens(), b.max_tokens());

        let merged = BatchState::concatenate(vec![a, b]).unwrap();
        assert_eq!(merged.id(), 3);
        assert_eq!(ids(&merged), expected);
        assert_eq!(merged.max_input_length(), 4);
        assert_eq!(merged.padding_right_offset(), 4);
        assert_eq!(
            mask_rows(&merged),
            vec![
                vec![0, 0, 1, 1, 0, 0, 0, 0],
                vec![1, 1, 1, 1, 0, 0, 0, 0],
                vec![0, 0, 1, 1, 0, 0, 0, 0],
            ]
        );
        assert_eq!(merged.max_tokens(), tokens_a + tokens_b + 2);
        assert_eq!(merged.input_ids().dims(), &[3, 1]);
        merged.assert_consistent();
    }

    #[tokio::test]
    async fn test_merge_grouping() {
        let generator = generator();
        let prompts_a: &[(&str, u32)] = &[("Hello", 4)];
        let prompts_b: &[(&str, u32)] = &[("the quick", 3), ("fox jumps over", 6)];
        let prompts_c: &[(&str, u32)] = &[("lazy dog", 2)];

        let nested = BatchState::concatenate(vec![
            BatchState::concatenate(vec![
                prefilled(&generator, 1, prompts_a).await,
                prefilled(&generator, 2, prompts_b).await,
            ])
            .unwrap(),
            prefilled(&generator, 3, prompts_c).await,
        ])
        .unwrap();
        let flat = BatchState::concatenate(vec![
            prefilled(&generator, 1, prompts_a).await,
            prefilled(&generator, 2, prompts_b).await,
            prefilled(&generator, 3, prompts_c).await,
        ])
        .unwrap();

        assert_eq!(mask_rows(&nested), mask_rows(&flat));
        assert_eq!(nested.max_tokens(), flat.max_tokens());
        let histories = |b: &BatchState| b.rows().iter().map(|r| r.input_length()).collect::<Vec<_>>();
        assert_eq!(histories(&nested), histories(&flat));
    }

    #[tokio::test]
    async fn test_merged_batch_keeps_generating() {
        let generator = generator();
        let a = prefilled(&generator, 1, &[("Hello", 3)]).await;
        let b = prefilled(&generator, 2, &[("the quick brown", 3)]).await;
        let expected = [ids(&a), ids(&b)].concat();
        let merged = BatchState::concatenate(vec![a, b]).unwrap();

        let (generations, next) = generator.generate_token(merged).await.unwrap();
        assert_eq!(generations.iter().map(|g| g.request_id).collect::<Vec<_>>(), expected);
        let next = next.unwrap();
        assert!(next.rows().iter().all(|row| row.current_tokens() == 2));
        next.assert_consistent();
    }

    #[tokio::test]
    async fn test_merge_caches_only_when_all_compatible() {
        let cached = Generator::new(
            MockEngine::new().with_cache(KeyLayout::HeadDimLast),
            MockTokenizer::new(),
            ShardConfig::default(),
        )
        .unwrap();
        let a = prefilled(&cached, 1, &[("Hello", 3)]).await;
        let b = prefilled(&cached, 2, &[("the quick brown", 3)]).await;
        let merged = BatchState::concatenate(vec![a, b]).unwrap();
        let (keys, _) = &merged.cache().unwrap().layers()[0];
        assert_eq!(keys.dims(), &[2, 1, 3, 2]);

        let a = prefilled(&cached, 1, &[("Hello", 3)]).await;
        let b = prefilled(&generator(), 2, &[("Hello", 3)]).await;
        let merged = BatchState::concatenate(vec![a, b]).unwrap();
        assert!(merged.cache().is_none());
    }
}
