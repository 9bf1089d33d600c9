use std::fmt;
use serde::{Deserialize, Serialize};
use crate::error::{Error, Result};
use crate::request::StoppingParameters;

/// Characters of recent output kept around for stop sequence matching.
const OUTPUT_WINDOW_CHARS: usize = 300;

/// Why a row stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FinishReason {
    /// `max_new_tokens` reached
    Length,
    /// The end of sequence token was produced
    EosToken,
    /// The output ends with one of the stop sequences
    StopSequence,
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            FinishReason::Length => "length",
            FinishReason::EosToken => "eos_token",
            FinishReason::StopSequence => "stop_sequence",
        };
        f.write_str(reason)
    }
}

/// Per-request stopping decision, tracking how many tokens were generated.
#[derive(Debug, Clone)]
pub struct StopPolicy {
    eos_token_id: Option<u32>,
    stop_sequences: Vec<String>,
    max_new_tokens: u32,
    ignore_eos_token: bool,
    current_tokens: u32,
    current_output: String,
}

impl StopPolicy {
    pub fn from_parameters(
        parameters: &StoppingParameters,
        eos_token_id: Option<u32>,
    ) -> Result<Self> {
        if parameters.max_new_tokens == 0 {
            return Err(Error::Policy("max_new_tokens must be at least 1".into()));
        }
        if parameters.stop_sequences.iter().any(String::is_empty) {
            return Err(Error::Policy("stop sequences must not be empty".into()));
        }
        Ok(Self {
            eos_token_id,
            stop_sequences: parameters.stop_sequences.clone(),
            max_new_tokens: parameters.max_new_tokens,
            ignore_eos_token: parameters.ignore_eos_token,
            current_tokens: 0,
            current_output: String::new(),
        })
    }

    pub fn max_new_tokens(&self) -> u32 {
        self.max_new_tokens
    }

    /// Tokens generated so far.
    pub fn current_tokens(&self) -> u32 {
        self.current_tokens
    }

    /// Decode budget left before `max_new_tokens` is reached.
    pub fn remaining_tokens(&self) -> u32 {
        self.max_new_tokens.saturating_sub(self.current_tokens)
    }

    /// Records one generated token and its decoded text, returning the stop reason if any.
    pub fn check(&mut self, token_id: u32, text: &str) -> Option<FinishReason> {
        self.current_tokens += 1;
        if self.current_tokens >= self.max_new_tokens {
            return Some(FinishReason::Length);
        }
        if !self.ignore_eos_token && self.eos_token_id == Some(token_id) {
            return Some(FinishReason::EosToken);
        }

        self.current_output.push_str(text);
        let excess = self.current_output.chars().count().saturating_sub(OUTPUT_WINDOW_CHARS);
        if excess > 0 {
            let cut = self
                .current_output
                .char_indices()
                .nth(excess)
                .map_or(self.current_output.len(), |(i, _)| i);
            self.current_output.drain(..cut);
        }

        self.stop_sequences
            .iter()
            .any(|stop| self.current_output.ends_with(stop.as_str()))
            .then_some(FinishReason::StopSequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parameters(max_new_tokens: u32, stop_sequences: &[&str]) -> StoppingParameters {
        StoppingParameters {
            max_new_tokens,
            stop_sequences: stop_sequences.iter().map(|s| s.to_string()).collect(),
            ignore_eos_token: false,
        }
    }

    #[test]
    fn test_stops_at_max_new_tokens() {
        let mut policy = StopPolicy::from_parameters(&parameters(3, &[]), None).unwrap();
        assert_eq!(policy.check(5, " a"), None);
        assert_eq!(policy.check(5, " a"), None);
        assert_eq!(policy.remaining_tokens(), 1);
        assert_eq!(policy.check(5, " a"), Some(FinishReason::Length));
        assert_eq!(policy.current_tokens(), 3);
    }

    #[test]
    fn test_stops_on_eos_unless_ignored() {
        let mut policy = StopPolicy::from_parameters(&parameters(10, &[]), Some(1)).unwrap();
        assert_eq!(policy.check(1, ""), Some(FinishReason::EosToken));

        let ignoring = StoppingParameters { ignore_eos_token: true, ..parameters(10, &[]) };
        let mut policy = StopPolicy::from_parameters(&ignoring, Some(1)).unwrap();
        assert_eq!(policy.check(1, ""), None);
    }

    #[test]
    fn test_length_wins_over_eos() {
        let mut policy = StopPolicy::from_parameters(&parameters(1, &[]), Some(1)).unwrap();
        assert_eq!(policy.check(1, ""), Some(FinishReason::Length));
    }

    #[test]
    fn test_stop_sequence_across_tokens() {
        let mut policy = StopPolicy::from_parameters(&parameters(10, &["fox jumps"]), None).unwrap();
        assert_eq!(policy.check(4, " fox"), None);
        assert_eq!(policy.check(5, " jumps"), Some(FinishReason::StopSequence));
    }

    #[test]
    fn test_output_window_is_bounded() {
        let mut policy = StopPolicy::from_parameters(&parameters(1000, &["end"]), None).unwrap();
        for _ in 0..200 {
            assert_eq!(policy.check(2, "éé"), None);
        }
        assert_eq!(policy.current_output.chars().count(), OUTPUT_WINDOW_CHARS);
        assert_eq!(policy.check(3, "end"), Some(FinishReason::StopSequence));
    }

    #[test]
    fn test_rejects_invalid_parameters() {
        assert!(matches!(
            StopPolicy::from_parameters(&parameters(0, &[]), None),
            Err(Error::Policy(_))
        ));
        assert!(matches!(
            StopPolicy::from_parameters(&parameters(4, &[""]), None),
            Err(Error::Policy(_))
        ));
    }

    #[test]
    fn test_finish_reason_display() {
        assert_eq!(FinishReason::Length.to_string(), "length");
        assert_eq!(FinishReason::StopSequence.to_string(), "stop_sequence");
    }
}
