//! Configuration types for robata.

use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::error::{Error, Result};

/// Position of one step executor among its cooperating shards.
///
/// Every shard holds the full batch state; a shard only emits the
/// generations of rows where `row % world_size == rank`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardConfig {
    /// This shard's rank, in `0..world_size`.
    pub rank: usize,
    /// Number of cooperating shards.
    pub world_size: usize,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }
}

impl ShardConfig {
    pub fn validate(&self) -> Result<()> {
        if self.world_size == 0 {
            return Err(Error::Configuration("world_size must be at least 1".into()));
        }
        if self.rank >= self.world_size {
            return Err(Error::Configuration(format!(
                "rank {} is out of range for world_size {}",
                self.rank, self.world_size
            )));
        }
        Ok(())
    }

    /// Whether this shard owns the output of `row`.
    #[inline]
    pub fn owns_row(&self, row: usize) -> bool {
        row % self.world_size == self.rank
    }
}

/// Continuous batching driver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatcherConfig {
    /// Maximum number of requests in the active batch.
    pub max_batch_size: usize,
    /// Upper bound on the active batch's `max_tokens` after admission.
    /// `None` disables token based backpressure.
    pub max_batch_total_tokens: Option<u64>,
    /// How long the idle worker waits for a notification before re-checking the queue.
    pub idle_poll_ms: u64,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 32,
            max_batch_total_tokens: None,
            idle_poll_ms: 100,
        }
    }
}

impl BatcherConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(Error::Configuration("max_batch_size must be at least 1".into()));
        }
        if self.max_batch_total_tokens == Some(0) {
            return Err(Error::Configuration("max_batch_total_tokens must be positive".into()));
        }
        Ok(())
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}

/// Special token overrides for the `tokenizers` adapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenizerConfig {
    /// Padding token; falls back to the tokenizer's padding setup, then `<pad>`, then EOS.
    pub pad_token: Option<String>,
    /// End of sequence token; falls back to `</s>`, then `<|endoftext|>`.
    pub eos_token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_shard_owns_every_row() {
        let shard = ShardConfig::default();
        assert!(shard.validate().is_ok());
        assert!((0..7).all(|row| shard.owns_row(row)));
    }

    #[test]
    fn test_shard_rank_out_of_range() {
        let shard = ShardConfig { rank: 2, world_size: 2 };
        assert!(matches!(shard.validate(), Err(Error::Configuration(_))));

        let shard = ShardConfig { rank: 0, world_size: 0 };
        assert!(matches!(shard.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_batcher_config_validation() {
        assert!(BatcherConfig::default().validate().is_ok());

        let config = BatcherConfig { max_batch_size: 0, ..Default::default() };
        assert!(config.validate().is_err());

        let config = BatcherConfig { max_batch_total_tokens: Some(0), ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_idle_poll_duration() {
        let config = BatcherConfig { idle_poll_ms: 250, ..Default::default() };
        assert_eq!(config.idle_poll(), Duration::from_millis(250));
    }
}
