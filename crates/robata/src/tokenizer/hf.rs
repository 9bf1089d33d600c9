use std::collections::HashSet;
use std::path::Path;
use async_trait::async_trait;
use candle_core::Device;
use tracing::debug;
use crate::config::TokenizerConfig;
use crate::error::{Error, Result};
use super::{TokenizedBatch, Tokenizer};

const PAD_FALLBACKS: [&str; 2] = ["<pad>", "[PAD]"];
const EOS_FALLBACKS: [&str; 3] = ["</s>", "<|endoftext|>", "<|eot_id|>"];

/// [`Tokenizer`] backed by a Hugging Face `tokenizer.json`.
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
    pad_token_id: u32,
    eos_token_id: Option<u32>,
    special_ids: HashSet<u32>,
    device: Device,
}

impl HfTokenizer {
    /// Loads a tokenizer file and resolves its padding and end of sequence ids.
    ///
    /// Padding and truncation configured inside the file are disabled; the
    /// batch engine pads on the left and truncates on the left itself.
    pub fn from_file(
        path: impl AsRef<Path>,
        config: &TokenizerConfig,
        device: Device,
    ) -> Result<Self> {
        let path = path.as_ref();
        let mut inner = tokenizers::Tokenizer::from_file(path).map_err(|e| {
            Error::Configuration(format!("cannot load tokenizer {}: {e}", path.display()))
        })?;

        let lookup = |token: &str| {
            inner.token_to_id(token).ok_or_else(|| {
                Error::Configuration(format!("token {token:?} is not in the vocabulary"))
            })
        };
        let eos_token_id = match &config.eos_token {
            Some(token) => Some(lookup(token)?),
            None => EOS_FALLBACKS.iter().find_map(|token| inner.token_to_id(token)),
        };
        let pad_token_id = match &config.pad_token {
            Some(token) => lookup(token)?,
            None => inner
                .get_padding()
                .map(|padding| padding.pad_id)
                .or_else(|| PAD_FALLBACKS.iter().find_map(|token| inner.token_to_id(token)))
                .or(eos_token_id)
                .ok_or_else(|| Error::Configuration("tokenizer has no padding token".into()))?,
        };

        let special_ids = inner
            .get_added_tokens_decoder()
            .into_iter()
            .filter(|(_, token)| token.special)
            .map(|(id, _)| id)
            .chain(eos_token_id)
            .chain(std::iter::once(pad_token_id))
            .collect();

        inner.with_padding(None);
        inner
            .with_truncation(None)
            .map_err(|e| Error::Configuration(format!("cannot disable truncation: {e}")))?;

        debug!(pad_token_id, ?eos_token_id, "loaded tokenizer from {}", path.display());
        Ok(Self {
            inner,
            pad_token_id,
            eos_token_id,
            special_ids,
            device,
        })
    }

    pub fn pad_token_id(&self) -> u32 {
        self.pad_token_id
    }
}

#[async_trait]
impl Tokenizer for HfTokenizer {
    async fn encode_batch(&self, inputs: &[&str], truncate: usize) -> Result<TokenizedBatch> {
        let encodings = self
            .inner
            .encode_batch(inputs.to_vec(), true)
            .map_err(|e| Error::Tokenizer(e.to_string()))?
            .into_iter()
            .map(|encoding| encoding.get_ids().to_vec())
            .collect();
        TokenizedBatch::left_padded(encodings, truncate, self.pad_token_id, &self.device)
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.inner
            .decode(ids, skip_special_tokens)
            .map_err(|e| Error::Tokenizer(e.to_string()))
    }

    fn is_special(&self, id: u32) -> bool {
        self.special_ids.contains(&id)
    }

    fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }
}
