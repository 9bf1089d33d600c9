use std::collections::HashSet;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use crate::error::{Error, Result};
use crate::request::SamplingParameters;

/// How the next token is picked once scores are warped.
#[derive(Debug, Clone)]
pub enum Choice {
    /// Highest score wins
    Greedy,
    /// Draw from the warped distribution with a seeded generator
    Sampling { seed: u64, rng: StdRng },
}

/// Chosen token and the log-probability distribution it was chosen from.
#[derive(Debug, Clone)]
pub struct NextToken {
    pub id: u32,
    /// Log-softmax of the warped scores, one entry per vocabulary id
    pub logprobs: Vec<f32>,
}

impl NextToken {
    pub fn logprob(&self) -> f32 {
        self.logprobs[self.id as usize]
    }
}

/// Per-request next token selection.
///
/// Scores go through the repetition penalty, temperature, top-k and top-p
/// warpers in that order; inactive warpers are skipped.
#[derive(Debug, Clone)]
pub struct TokenPolicy {
    repetition_penalty: Option<f32>,
    temperature: Option<f32>,
    top_k: Option<usize>,
    top_p: Option<f32>,
    choice: Choice,
}

impl TokenPolicy {
    pub fn from_parameters(parameters: &SamplingParameters) -> Result<Self> {
        let SamplingParameters {
            temperature,
            top_k,
            top_p,
            repetition_penalty,
            do_sample,
            seed,
        } = *parameters;

        if !temperature.is_finite() || temperature <= 0.0 {
            return Err(Error::Policy(format!("temperature must be positive, got {temperature}")));
        }
        if !(top_p > 0.0 && top_p <= 1.0) {
            return Err(Error::Policy(format!("top_p must be in (0, 1], got {top_p}")));
        }
        if !repetition_penalty.is_finite() || repetition_penalty <= 0.0 {
            return Err(Error::Policy(format!(
                "repetition_penalty must be positive, got {repetition_penalty}"
            )));
        }

        let temperature = (temperature != 1.0).then_some(temperature);
        let top_k = (top_k > 0).then_some(top_k as usize);
        let top_p = (top_p < 1.0).then_some(top_p);
        let has_warpers = temperature.is_some() || top_k.is_some() || top_p.is_some();

        let choice = if do_sample || has_warpers {
            Choice::Sampling { seed, rng: StdRng::seed_from_u64(seed) }
        } else {
            Choice::Greedy
        };

        Ok(Self {
            repetition_penalty: (repetition_penalty != 1.0).then_some(repetition_penalty),
            temperature,
            top_k,
            top_p,
            choice,
        })
    }

    /// Seed of the sampling generator, if this policy samples.
    pub fn seed(&self) -> Option<u64> {
        match &self.choice {
            Choice::Greedy => None,
            Choice::Sampling { seed, .. } => Some(*seed),
        }
    }

    pub fn choice(&self) -> &Choice {
        &self.choice
    }

    /// Picks the next token from one position's `logits`, given the row's history.
    pub fn next_token(&mut self, history: &[u32], logits: &[f32]) -> Result<NextToken> {
        if logits.is_empty() {
            return Err(Error::Engine("empty logits row".into()));
        }
        let mut scores = logits.to_vec();

        if let Some(penalty) = self.repetition_penalty {
            let seen: HashSet<u32> = history.iter().copied().collect();
            for id in seen {
                if let Some(score) = scores.get_mut(id as usize) {
                    *score = if *score < 0.0 { *score * penalty } else { *score / penalty };
                }
            }
        }
        if let Some(temperature) = self.temperature {
            scores.iter_mut().for_each(|score| *score /= temperature);
        }
        if let Some(k) = self.top_k {
            keep_top_k(&mut scores, k);
        }
        if let Some(p) = self.top_p {
            keep_top_p(&mut scores, p);
        }

        let logprobs = log_softmax(&scores);
        let id = match &mut self.choice {
            Choice::Greedy => argmax(&scores),
            Choice::Sampling { rng, .. } => {
                let weights = logprobs.iter().map(|lp| lp.exp()).collect::<Vec<_>>();
                let distribution = WeightedIndex::new(&weights)
                    .map_err(|e| Error::Engine(format!("cannot sample from logits: {e}")))?;
                distribution.sample(rng)
            }
        };

        Ok(NextToken { id: id as u32, logprobs })
    }
}

fn argmax(scores: &[f32]) -> usize {
    scores
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, &score)| {
            if score > best.1 { (i, score) } else { best }
        })
        .0
}

fn log_softmax(scores: &[f32]) -> Vec<f32> {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let log_sum = scores.iter().map(|s| (s - max).exp()).sum::<f32>().ln();
    scores.iter().map(|s| s - max - log_sum).collect()
}

fn sorted_descending(scores: &[f32]) -> Vec<usize> {
    let mut order = (0..scores.len()).collect::<Vec<_>>();
    order.sort_by(|&a, &b| scores[b].partial_cmp(&scores[a]).unwrap_or(std::cmp::Ordering::Equal));
    order
}

fn keep_top_k(scores: &mut [f32], k: usize) {
    if k >= scores.len() {
        return;
    }
    for &i in &sorted_descending(scores)[k..] {
        scores[i] = f32::NEG_INFINITY;
    }
}

/// Keeps the smallest set of highest scores whose probability mass reaches `p`.
fn keep_top_p(scores: &mut [f32], p: f32) {
    let order = sorted_descending(scores);
    let probs = log_softmax(scores).into_iter().map(f32::exp).collect::<Vec<_>>();
    let mut cumulative = 0.0;
    let mut keep = order.len();
    for (rank, &i) in order.iter().enumerate() {
        cumulative += probs[i];
        if cumulative >= p {
            keep = rank + 1;
            break;
        }
    }
    for &i in &order[keep..] {
        scores[i] = f32::NEG_INFINITY;
    }
}
