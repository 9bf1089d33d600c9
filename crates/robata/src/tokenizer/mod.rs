//! # Tokenizer Collaborator
//!
//! Text to token id conversion is external to the batch engine. This module
//! defines what the engine needs from a tokenizer:
//!
//! * batch encoding into a left-padded id matrix with a parallel mask
//! * decoding with or without special tokens
//! * the end of sequence id and which ids are special
//!
//! [`decode_token`] builds incremental, offset-tracking decoding on top of
//! [`Tokenizer::decode`] so a step never re-decodes a row's whole history.

#[cfg_attr(docsrs, doc(cfg(feature = "tokenizers")))]
#[cfg(feature = "tokenizers")]
/// Adapter for Hugging Face `tokenizers` files.
///
/// This module is only available when the `tokenizers` feature flag is enabled.
pub mod hf;

use async_trait::async_trait;
use candle_core::{Device, Tensor};
use crate::error::{Error, Result};

/// Left-padded token ids and the parallel attention mask, both `(rows, width)` `u32`.
#[derive(Debug, Clone)]
pub struct TokenizedBatch {
    pub input_ids: Tensor,
    pub attention_mask: Tensor,
}

impl TokenizedBatch {
    /// Left-truncates every encoding to `truncate` tokens (`0` keeps all),
    /// then left-pads to the longest one with `pad_token_id`.
    pub fn left_padded(
        encodings: Vec<Vec<u32>>,
        truncate: usize,
        pad_token_id: u32,
        device: &Device,
    ) -> Result<Self> {
        let rows = encodings.len();
        let encodings = encodings
            .into_iter()
            .map(|ids| match truncate {
                0 => ids,
                t if ids.len() > t => ids[ids.len() - t..].to_vec(),
                _ => ids,
            })
            .collect::<Vec<_>>();
        let width = encodings.iter().map(Vec::len).max().unwrap_or(0);

        let mut input_ids = Vec::with_capacity(rows * width);
        let mut attention_mask = Vec::with_capacity(rows * width);
        for ids in &encodings {
            let padding = width - ids.len();
            input_ids.extend(std::iter::repeat_n(pad_token_id, padding));
            input_ids.extend_from_slice(ids);
            attention_mask.extend(std::iter::repeat_n(0u32, padding));
            attention_mask.extend(std::iter::repeat_n(1u32, ids.len()));
        }

        Ok(Self {
            input_ids: Tensor::from_vec(input_ids, (rows, width), device)?,
            attention_mask: Tensor::from_vec(attention_mask, (rows, width), device)?,
        })
    }
}

/// Tokenizer used by ingest and the step executor.
#[async_trait]
pub trait Tokenizer: Send + Sync {
    /// Encodes `inputs` into a left-padded, left-truncated batch.
    async fn encode_batch(&self, inputs: &[&str], truncate: usize) -> Result<TokenizedBatch>;

    /// Decodes `ids` into text, optionally dropping special tokens.
    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String>;

    /// Decodes every id on its own, keeping special tokens.
    fn decode_each(&self, ids: &[u32]) -> Result<Vec<String>> {
        ids.iter().map(|&id| self.decode(&[id], false)).collect()
    }

    /// Whether `id` is a special token such as padding or end of sequence.
    fn is_special(&self, id: u32) -> bool;

    /// End of sequence id, if the vocabulary has one.
    fn eos_token_id(&self) -> Option<u32>;
}

/// Decodes the text newly made available by the last token(s) of `ids`.
///
/// `prefix_offset..read_offset` is the already emitted context kept for
/// tokenizers whose pieces depend on their neighbours. Returns the new text
/// and the offsets to use next time; while the tail decodes to an incomplete
/// character the text is empty and the offsets do not move.
pub fn decode_token<T>(
    tokenizer: &T,
    ids: &[u32],
    prefix_offset: usize,
    read_offset: usize,
) -> Result<(String, usize, usize)>
where
    T: Tokenizer + ?Sized,
{
    if prefix_offset > read_offset || read_offset > ids.len() {
        return Err(Error::InvalidArgument(format!(
            "decode offsets {prefix_offset}..{read_offset} out of range for {} tokens",
            ids.len()
        )));
    }
    let prefix_text = tokenizer.decode(&ids[prefix_offset..read_offset], false)?;
    let new_text = tokenizer.decode(&ids[prefix_offset..], false)?;

    if new_text.len() > prefix_text.len() && !new_text.ends_with('\u{FFFD}') {
        if let Some(suffix) = new_text.get(prefix_text.len()..) {
            return Ok((suffix.to_string(), read_offset, ids.len()));
        }
    }
    Ok((String::new(), prefix_offset, read_offset))
}
