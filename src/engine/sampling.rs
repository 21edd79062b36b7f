//! Token selection from a logits vector.

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::backend::{InferenceBackend, TokenId};

/// Errors from building or sampling a candidate set
#[derive(Error, Debug, PartialEq)]
pub enum SamplingError {
    #[error("Logits length {actual} does not match vocabulary size {expected}")]
    LogitsLength { expected: usize, actual: usize },

    #[error("Candidate set is empty")]
    Empty,
}

/// One vocabulary entry offered to the sampler
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenData {
    pub id: TokenId,
    pub logit: f32,
    /// Probability, filled in by the sampler
    pub p: f32,
}

/// Transient candidate list built from one logits vector
#[derive(Debug, Clone)]
pub struct CandidateSet {
    pub data: Vec<TokenData>,
    /// True once `data` is ordered by descending logit
    pub sorted: bool,
}

impl CandidateSet {
    /// Build the full-vocabulary candidate set.
    ///
    /// `logits` must hold exactly one score per vocabulary entry.
    pub fn from_logits(logits: &[f32], n_vocab: usize) -> Result<Self, SamplingError> {
        if logits.len() != n_vocab {
            return Err(SamplingError::LogitsLength {
                expected: n_vocab,
                actual: logits.len(),
            });
        }
        let data = logits
            .iter()
            .enumerate()
            .map(|(id, &logit)| TokenData {
                id: id as TokenId,
                logit,
                p: 0.0,
            })
            .collect();
        Ok(Self {
            data,
            sorted: false,
        })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Order candidates by descending logit. Ties keep vocabulary order.
    pub fn sort_desc(&mut self) {
        if !self.sorted {
            self.data.sort_by(|a, b| {
                b.logit
                    .partial_cmp(&a.logit)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            self.sorted = true;
        }
    }

    /// Sort and fill `p` with softmax probabilities.
    pub fn softmax(&mut self) {
        self.sort_desc();
        let logits: Vec<f32> = self.data.iter().map(|c| c.logit).collect();
        for (c, p) in self.data.iter_mut().zip(softmax(&logits)) {
            c.p = p;
        }
    }

    /// Greedy pick (argmax). The lowest id wins ties.
    pub fn argmax(&self) -> Result<TokenId, SamplingError> {
        self.data
            .iter()
            .fold(None::<&TokenData>, |best, c| match best {
                Some(b) if b.logit >= c.logit => Some(b),
                _ => Some(c),
            })
            .map(|c| c.id)
            .ok_or(SamplingError::Empty)
    }

    /// Apply repetition penalty to candidates whose id appears in `past_tokens`.
    pub fn apply_repetition_penalty(&mut self, past_tokens: &[TokenId], penalty: f32) {
        if penalty == 1.0 || past_tokens.is_empty() {
            return;
        }
        for c in &mut self.data {
            if past_tokens.contains(&c.id) {
                if c.logit > 0.0 {
                    c.logit /= penalty;
                } else {
                    c.logit *= penalty;
                }
            }
        }
        self.sorted = false;
    }
}

/// How the next token is chosen from the candidate set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingStrategy {
    /// The engine's own sampler, which may consume engine RNG state
    EngineDefault,
    /// Argmax, no randomness
    Greedy,
}

/// Sampling configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub strategy: SamplingStrategy,
    /// Repetition penalty over the history window (1.0 = disabled)
    pub repetition_penalty: f32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            strategy: SamplingStrategy::EngineDefault,
            repetition_penalty: 1.0,
        }
    }
}

/// Chooses one token per step from an engine's current logits.
///
/// Selection depends only on the logits, the history window (when a
/// repetition penalty is set) and sampler state held inside the engine, so
/// two engines in the same state choose the same token.
#[derive(Debug, Clone, Default)]
pub struct SamplingEngine {
    config: SamplingConfig,
}

impl SamplingEngine {
    pub fn new(config: SamplingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SamplingConfig {
        &self.config
    }

    /// Validate logits and build the (possibly penalized) candidate set.
    pub fn candidates(
        &self,
        logits: &[f32],
        n_vocab: usize,
        past_tokens: &[TokenId],
    ) -> Result<CandidateSet, SamplingError> {
        let mut candidates = CandidateSet::from_logits(logits, n_vocab)?;
        candidates.apply_repetition_penalty(past_tokens, self.config.repetition_penalty);
        Ok(candidates)
    }

    /// Pick the next token from the backend's current logits.
    pub fn select_token<B: InferenceBackend>(
        &self,
        backend: &mut B,
        past_tokens: &[TokenId],
    ) -> Result<TokenId, SamplingError> {
        let mut candidates = self.candidates(backend.logits(), backend.n_vocab(), past_tokens)?;
        match self.config.strategy {
            SamplingStrategy::Greedy => candidates.argmax(),
            SamplingStrategy::EngineDefault => {
                if candidates.is_empty() {
                    return Err(SamplingError::Empty);
                }
                Ok(backend.sample(&mut candidates))
            }
        }
    }
}

/// Softmax function.
pub(crate) fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exp_sum: f32 = logits.iter().map(|l| (l - max).exp()).sum();
    logits.iter().map(|l| (l - max).exp() / exp_sum).collect()
}

/// Sample an index from a probability distribution.
pub(crate) fn sample_from_probs(probs: &[f32], rng: &mut impl Rng) -> usize {
    let r: f32 = rng.gen();
    let mut cumsum = 0.0;
    for (i, &p) in probs.iter().enumerate() {
        cumsum += p;
        if r < cumsum {
            return i;
        }
    }
    probs.len().saturating_sub(1)
}
