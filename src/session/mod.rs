//! One inference session: an engine context plus its decode position.
//!
//! The session owns the engine (released on drop, on every exit path) and
//! the `n_past` counter, so several sessions can coexist without sharing
//! position state.

mod history;

pub use history::TokenHistory;

use std::fmt;
use std::path::Path;

use thiserror::Error;
use tracing::{debug, info};

use crate::config::ContextParams;
use crate::engine::{EngineError, InferenceBackend, SamplingEngine, SamplingError, TokenId};

/// Errors from session operations
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Failed to load model: {0}")]
    Load(#[source] EngineError),

    #[error("Failed to tokenize prompt: {0}")]
    Tokenize(String),

    #[error("Failed to evaluate at n_past={n_past}: {reason}")]
    Eval { n_past: usize, reason: String },

    #[error("Failed to validate state size: snapshot has {actual} bytes, session expects {expected}")]
    StateSizeMismatch { expected: usize, actual: usize },

    #[error("Position {n_past} is outside the context of {n_ctx} tokens")]
    InvalidPosition { n_past: usize, n_ctx: usize },

    #[error("Invalid logits: {0}")]
    Validation(#[from] SamplingError),

    #[error("State transfer failed: {0}")]
    State(#[source] EngineError),
}

/// Owned copy of an engine's opaque state.
///
/// Never interpreted by the harness: only its length and exact bytes matter.
#[derive(Clone, PartialEq, Eq)]
pub struct StateBuffer {
    data: Vec<u8>,
}

impl StateBuffer {
    /// Zero-filled buffer of `len` bytes.
    pub fn zeroed(len: usize) -> Self {
        Self { data: vec![0; len] }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

impl AsRef<[u8]> for StateBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for StateBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateBuffer")
            .field("len", &self.data.len())
            .field("capacity", &self.data.capacity())
            .finish()
    }
}

/// An engine context with its own decode position.
pub struct InferenceSession<B: InferenceBackend> {
    backend: B,
    params: ContextParams,
    /// Tokens already folded into the engine state
    n_past: usize,
    /// Logits are readable (after an eval or a restore)
    logits_valid: bool,
    /// A failed eval leaves the engine in an unknown state
    poisoned: bool,
}

impl<B: InferenceBackend> InferenceSession<B> {
    /// Load the model and create a fresh context.
    pub fn create(model_path: &Path, params: &ContextParams) -> Result<Self, SessionError> {
        if params.context_length == 0 {
            return Err(SessionError::Load(EngineError::InvalidConfig(
                "context_length must be greater than zero".to_string(),
            )));
        }
        info!("Creating session for: {}", model_path.display());
        let backend = B::load(model_path, params).map_err(SessionError::Load)?;
        Ok(Self::from_backend(backend, params.clone()))
    }

    /// Wrap an already created engine context.
    pub fn from_backend(backend: B, params: ContextParams) -> Self {
        Self {
            backend,
            params,
            n_past: 0,
            logits_valid: false,
            poisoned: false,
        }
    }

    /// Tokenize with a leading BOS token.
    pub fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, SessionError> {
        let tokens = self
            .backend
            .tokenize(text, true)
            .map_err(|e| SessionError::Tokenize(e.to_string()))?;
        if tokens.is_empty() {
            return Err(SessionError::Tokenize("no tokens produced".to_string()));
        }
        Ok(tokens)
    }

    /// Evaluate `tokens` at the current position and advance it.
    ///
    /// A failure poisons the session: no logits, no further evals.
    pub fn evaluate(&mut self, tokens: &[TokenId]) -> Result<(), SessionError> {
        if self.poisoned {
            return Err(SessionError::Eval {
                n_past: self.n_past,
                reason: "session poisoned by an earlier eval failure".to_string(),
            });
        }
        match self.backend.eval(tokens, self.n_past, self.params.n_threads) {
            Ok(()) => {
                self.n_past += tokens.len();
                self.logits_valid = true;
                Ok(())
            }
            Err(e) => {
                self.poisoned = true;
                self.logits_valid = false;
                Err(SessionError::Eval {
                    n_past: self.n_past,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Logits of the last evaluated token.
    pub fn logits(&self) -> Result<&[f32], SessionError> {
        if !self.logits_valid {
            return Err(SessionError::Eval {
                n_past: self.n_past,
                reason: "no logits available; evaluate first".to_string(),
            });
        }
        Ok(self.backend.logits())
    }

    /// Pick the next token from the current logits.
    pub fn sample_next(
        &mut self,
        sampler: &SamplingEngine,
        history: &mut TokenHistory,
    ) -> Result<TokenId, SessionError> {
        self.logits()?;
        Ok(sampler.select_token(&mut self.backend, history.as_slice())?)
    }

    /// Bytes needed for a full state capture.
    pub fn state_size(&self) -> usize {
        self.backend.state_size()
    }

    /// Copy the engine's state. Does not modify the session.
    pub fn capture_state(&self) -> Result<StateBuffer, SessionError> {
        let mut state = StateBuffer::zeroed(self.state_size());
        let written = self
            .backend
            .copy_state_data(state.as_mut_slice())
            .map_err(SessionError::State)?;
        if written != state.len() {
            return Err(SessionError::StateSizeMismatch {
                expected: state.len(),
                actual: written,
            });
        }
        debug!("Captured {} bytes of session state at n_past={}", written, self.n_past);
        Ok(state)
    }

    /// Replace the engine's state with `state`.
    ///
    /// The blob must be exactly [`InferenceSession::state_size`] bytes;
    /// anything else is rejected before the engine is touched.
    pub fn restore_state(&mut self, state: &StateBuffer) -> Result<(), SessionError> {
        let expected = self.state_size();
        if state.len() != expected {
            return Err(SessionError::StateSizeMismatch {
                expected,
                actual: state.len(),
            });
        }
        self.backend
            .set_state_data(state.as_slice())
            .map_err(SessionError::State)?;
        self.logits_valid = self.backend.has_logits();
        self.poisoned = false;
        debug!("Restored {} bytes of session state", state.len());
        Ok(())
    }

    pub fn n_past(&self) -> usize {
        self.n_past
    }

    /// Set the decode position, e.g. to the value saved with a snapshot.
    pub fn set_n_past(&mut self, n_past: usize) -> Result<(), SessionError> {
        if n_past > self.params.context_length {
            return Err(SessionError::InvalidPosition {
                n_past,
                n_ctx: self.params.context_length,
            });
        }
        self.n_past = n_past;
        Ok(())
    }

    pub fn n_vocab(&self) -> usize {
        self.backend.n_vocab()
    }

    pub fn context_length(&self) -> usize {
        self.params.context_length
    }

    pub fn params(&self) -> &ContextParams {
        &self.params
    }

    pub fn token_to_str(&self, token: TokenId) -> String {
        self.backend.token_to_str(token)
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Release the engine context.
    pub fn destroy(self) {
        debug!("Destroying session at n_past={}", self.n_past);
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ReferenceEngine, ReferenceModelSpec};

    fn params(context_length: usize) -> ContextParams {
        ContextParams {
            context_length,
            ..Default::default()
        }
    }

    fn session(context_length: usize) -> InferenceSession<ReferenceEngine> {
        let params = params(context_length);
        let engine = ReferenceEngine::from_spec(ReferenceModelSpec::default(), &params).unwrap();
        InferenceSession::from_backend(engine, params)
    }

    #[test]
    fn test_create_from_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bin");
        ReferenceModelSpec::default().write_to(&path).unwrap();

        let session = InferenceSession::<ReferenceEngine>::create(&path, &params(64)).unwrap();
        assert_eq!(session.n_past(), 0);
        assert_eq!(session.context_length(), 64);
    }

    #[test]
    fn test_create_rejects_zero_context() {
        let err = InferenceSession::<ReferenceEngine>::create(Path::new("unused"), &params(0))
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::Load(EngineError::InvalidConfig(_))));
    }

    #[test]
    fn test_create_missing_model_is_load_error() {
        let err = InferenceSession::<ReferenceEngine>::create(Path::new("/nonexistent"), &params(8))
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::Load(EngineError::ModelLoad { .. })));
    }

    #[test]
    fn test_tokenize_too_long_prompt() {
        let session = session(4);
        let err = session.tokenize("The quick brown fox").unwrap_err();
        assert!(matches!(err, SessionError::Tokenize(_)));
    }

    #[test]
    fn test_evaluate_advances_position() {
        let mut session = session(64);
        assert!(session.logits().is_err());

        let tokens = session.tokenize("fox").unwrap();
        session.evaluate(&tokens).unwrap();
        assert_eq!(session.n_past(), tokens.len());
        assert_eq!(session.logits().unwrap().len(), session.n_vocab());

        session.evaluate(&[10]).unwrap();
        assert_eq!(session.n_past(), tokens.len() + 1);
    }

    #[test]
    fn test_failed_eval_poisons_session() {
        let mut session = session(2);
        session.evaluate(&[1, 2]).unwrap();
        let err = session.evaluate(&[3]).unwrap_err();
        assert!(matches!(err, SessionError::Eval { n_past: 2, .. }));
        assert!(session.is_poisoned());
        assert!(session.logits().is_err());
        assert!(session.evaluate(&[3]).is_err());
    }

    #[test]
    fn test_capture_does_not_mutate() {
        let mut session = session(16);
        session.evaluate(&[1, 40, 41]).unwrap();
        let a = session.capture_state().unwrap();
        let b = session.capture_state().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), session.state_size());
        assert_eq!(session.n_past(), 3);
    }

    #[test]
    fn test_restore_rejects_size_mismatch() {
        let mut small = session(16);
        small.evaluate(&[1, 40]).unwrap();
        let state = small.capture_state().unwrap();

        let mut large = session(32);
        let err = large.restore_state(&state).unwrap_err();
        match err {
            SessionError::StateSizeMismatch { expected, actual } => {
                assert_eq!(expected, large.state_size());
                assert_eq!(actual, state.len());
            }
            other => panic!("unexpected error: {other}"),
        }
        // Target untouched
        assert!(large.logits().is_err());
    }

    #[test]
    fn test_restore_makes_logits_available() {
        let mut a = session(16);
        a.evaluate(&[1, 40, 41]).unwrap();
        let state = a.capture_state().unwrap();

        let mut b = session(16);
        b.restore_state(&state).unwrap();
        b.set_n_past(a.n_past()).unwrap();
        assert_eq!(b.logits().unwrap(), a.logits().unwrap());
        assert_eq!(b.n_past(), 3);
    }

    /// Exposes a full-length logits buffer even before any eval, like a
    /// native context whose logits storage is preallocated.
    struct PreallocatedLogits {
        inner: ReferenceEngine,
        buffer: Vec<f32>,
    }

    impl InferenceBackend for PreallocatedLogits {
        fn load(model_path: &Path, params: &ContextParams) -> Result<Self, EngineError> {
            let inner = ReferenceEngine::load(model_path, params)?;
            let buffer = vec![0.0; inner.n_vocab()];
            Ok(Self { inner, buffer })
        }
        fn n_vocab(&self) -> usize {
            self.inner.n_vocab()
        }
        fn n_ctx(&self) -> usize {
            self.inner.n_ctx()
        }
        fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>, EngineError> {
            self.inner.tokenize(text, add_bos)
        }
        fn eval(
            &mut self,
            tokens: &[TokenId],
            n_past: usize,
            n_threads: usize,
        ) -> Result<(), EngineError> {
            self.inner.eval(tokens, n_past, n_threads)
        }
        fn logits(&self) -> &[f32] {
            if self.inner.has_logits() {
                self.inner.logits()
            } else {
                &self.buffer
            }
        }
        fn has_logits(&self) -> bool {
            self.inner.has_logits()
        }
        fn sample(&mut self, candidates: &mut crate::engine::CandidateSet) -> TokenId {
            self.inner.sample(candidates)
        }
        fn token_to_str(&self, token: TokenId) -> String {
            self.inner.token_to_str(token)
        }
        fn state_size(&self) -> usize {
            self.inner.state_size()
        }
        fn copy_state_data(&self, dst: &mut [u8]) -> Result<usize, EngineError> {
            self.inner.copy_state_data(dst)
        }
        fn set_state_data(&mut self, src: &[u8]) -> Result<usize, EngineError> {
            self.inner.set_state_data(src)
        }
    }

    fn preallocated(context_length: usize) -> InferenceSession<PreallocatedLogits> {
        let params = params(context_length);
        let inner = ReferenceEngine::from_spec(ReferenceModelSpec::default(), &params).unwrap();
        let buffer = vec![0.0; inner.n_vocab()];
        InferenceSession::from_backend(PreallocatedLogits { inner, buffer }, params)
    }

    #[test]
    fn test_restore_of_pre_eval_state_has_no_logits() {
        let fresh = preallocated(16);
        let state = fresh.capture_state().unwrap();

        let mut target = preallocated(16);
        target.evaluate(&[1, 40]).unwrap();
        assert!(target.logits().is_ok());

        target.restore_state(&state).unwrap();
        assert!(matches!(target.logits(), Err(SessionError::Eval { .. })));
    }

    #[test]
    fn test_set_n_past_bounds() {
        let mut session = session(8);
        assert!(session.set_n_past(8).is_ok());
        assert!(matches!(
            session.set_n_past(9),
            Err(SessionError::InvalidPosition { n_past: 9, n_ctx: 8 })
        ));
    }

    #[test]
    fn test_state_buffer_reports_len_and_capacity() {
        let buf = StateBuffer::zeroed(128);
        assert_eq!(buf.len(), 128);
        assert!(buf.capacity() >= 128);
        assert!(format!("{:?}", buf).contains("len: 128"));
    }
}
