//! Fixed-length token generation against one session.
//!
//! Each step: sample from the current logits, record the token in the
//! history, hand it to the sink, then evaluate it at the session's position.
//! There is no EOS early stop; a run is exactly `n_predict` steps unless an
//! evaluation fails.

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::engine::{InferenceBackend, SamplingEngine, TokenId};
use crate::session::{InferenceSession, SessionError, TokenHistory};

/// Errors from the generation loop
#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("Sampling failed at step {step}: {source}")]
    Sampling {
        step: usize,
        #[source]
        source: SessionError,
    },

    #[error("Evaluation failed at step {step}: {source}")]
    Eval {
        step: usize,
        #[source]
        source: SessionError,
    },
}

impl GenerationError {
    /// Index of the step that failed.
    pub fn step(&self) -> usize {
        match self {
            GenerationError::Sampling { step, .. } | GenerationError::Eval { step, .. } => *step,
        }
    }
}

/// Where a loop is in its run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Primed,
    Generating { step: usize },
    Done,
    Failed,
}

/// Tokens and text produced by one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationOutput {
    pub tokens: Vec<TokenId>,
    pub text: String,
}

impl GenerationOutput {
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Generation loop shared by the live and the restored run.
#[derive(Debug, Clone)]
pub struct GenerationLoop {
    n_predict: usize,
    sampler: SamplingEngine,
    state: LoopState,
}

impl GenerationLoop {
    pub fn new(n_predict: usize, sampler: SamplingEngine) -> Self {
        Self {
            n_predict,
            sampler,
            state: LoopState::Primed,
        }
    }

    pub fn n_predict(&self) -> usize {
        self.n_predict
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Generate `n_predict` tokens.
    ///
    /// `sink` sees every sampled token and its text before the token is
    /// evaluated, so a failing step still emits the token it sampled.
    pub fn run<B, F>(
        &mut self,
        session: &mut InferenceSession<B>,
        history: &mut TokenHistory,
        mut sink: F,
    ) -> Result<GenerationOutput, GenerationError>
    where
        B: InferenceBackend,
        F: FnMut(TokenId, &str),
    {
        self.state = LoopState::Primed;
        let mut output = GenerationOutput {
            tokens: Vec::with_capacity(self.n_predict),
            text: String::new(),
        };

        for step in 0..self.n_predict {
            self.state = LoopState::Generating { step };

            let id = match session.sample_next(&self.sampler, history) {
                Ok(id) => id,
                Err(source) => {
                    self.state = LoopState::Failed;
                    warn!("Generation stopped at step {}: sampling failed", step);
                    return Err(GenerationError::Sampling { step, source });
                }
            };
            history.append(id);

            let piece = session.token_to_str(id);
            sink(id, &piece);
            output.tokens.push(id);
            output.text.push_str(&piece);

            if let Err(source) = session.evaluate(&[id]) {
                self.state = LoopState::Failed;
                warn!(
                    "Generation stopped at step {} (n_past={}): evaluation failed",
                    step,
                    session.n_past()
                );
                return Err(GenerationError::Eval { step, source });
            }
            debug!("step {}: token {} n_past={}", step, id, session.n_past());
        }

        self.state = LoopState::Done;
        info!(
            "Generated {} tokens, n_past={}",
            output.tokens.len(),
            session.n_past()
        );
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextParams;
    use crate::engine::{ReferenceEngine, ReferenceModelSpec, SamplingConfig, SamplingStrategy};

    fn primed_session(context_length: usize, prompt: &str) -> InferenceSession<ReferenceEngine> {
        let params = ContextParams {
            context_length,
            ..Default::default()
        };
        let engine = ReferenceEngine::from_spec(ReferenceModelSpec::default(), &params).unwrap();
        let mut session = InferenceSession::from_backend(engine, params);
        let tokens = session.tokenize(prompt).unwrap();
        session.evaluate(&tokens).unwrap();
        session
    }

    #[test]
    fn test_runs_exactly_n_predict_steps() {
        let mut session = primed_session(64, "The quick brown fox");
        let start = session.n_past();
        let mut history = TokenHistory::zeroed(8);
        let mut emitted = Vec::new();

        let mut gen = GenerationLoop::new(16, SamplingEngine::default());
        assert_eq!(gen.state(), LoopState::Primed);
        let output = gen
            .run(&mut session, &mut history, |id, _| emitted.push(id))
            .unwrap();

        assert_eq!(output.len(), 16);
        assert_eq!(emitted, output.tokens);
        assert_eq!(session.n_past(), start + 16);
        assert_eq!(gen.state(), LoopState::Done);
        assert_eq!(history.len(), 8);
        assert_eq!(history.last(), output.tokens.last().copied());
    }

    #[test]
    fn test_zero_steps_is_done_immediately() {
        let mut session = primed_session(16, "a");
        let mut history = TokenHistory::new(4);
        let mut gen = GenerationLoop::new(0, SamplingEngine::default());
        let output = gen.run(&mut session, &mut history, |_, _| {}).unwrap();
        assert!(output.is_empty());
        assert_eq!(gen.state(), LoopState::Done);
        assert_eq!(session.n_past(), 2);
    }

    #[test]
    fn test_halts_when_context_is_exhausted() {
        // BOS + 2 bytes leaves room for 5 generated tokens in a context of 8
        let mut session = primed_session(8, "ab");
        assert_eq!(session.n_past(), 3);
        let mut history = TokenHistory::new(4);
        let mut emitted = 0;

        let mut gen = GenerationLoop::new(16, SamplingEngine::default());
        let err = gen
            .run(&mut session, &mut history, |_, _| emitted += 1)
            .unwrap_err();

        assert!(matches!(err, GenerationError::Eval { step: 5, .. }));
        assert_eq!(err.step(), 5);
        assert_eq!(emitted, 6);
        assert_eq!(session.n_past(), 8);
        assert_eq!(gen.state(), LoopState::Failed);
    }

    #[test]
    fn test_unprimed_session_fails_sampling() {
        let params = ContextParams::default();
        let engine = ReferenceEngine::from_spec(ReferenceModelSpec::default(), &params).unwrap();
        let mut session = InferenceSession::from_backend(engine, params);
        let mut history = TokenHistory::new(4);

        let mut gen = GenerationLoop::new(4, SamplingEngine::default());
        let err = gen.run(&mut session, &mut history, |_, _| {}).unwrap_err();
        assert!(matches!(err, GenerationError::Sampling { step: 0, .. }));
        assert!(history.is_empty());
    }

    #[test]
    fn test_greedy_text_matches_tokens() {
        let mut session = primed_session(64, "fox");
        let mut history = TokenHistory::new(4);
        let sampler = SamplingEngine::new(SamplingConfig {
            strategy: SamplingStrategy::Greedy,
            ..Default::default()
        });

        let output = GenerationLoop::new(6, sampler)
            .run(&mut session, &mut history, |_, _| {})
            .unwrap();
        let expected: String = output
            .tokens
            .iter()
            .map(|&id| session.token_to_str(id))
            .collect();
        assert_eq!(output.text, expected);
    }
}
