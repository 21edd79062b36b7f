//! Capability interface to an inference engine.
//!
//! The harness never looks inside the engine: it tokenizes, evaluates,
//! reads logits, asks the engine's own sampler for a token and moves the
//! engine's opaque state in and out as raw bytes.

use std::path::Path;

use thiserror::Error;

use super::sampling::CandidateSet;
use crate::config::ContextParams;

/// Token identifier, matches the C type used by llama.cpp
pub type TokenId = i32;

/// Errors reported by an engine implementation
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Failed to load model {path}: {reason}")]
    ModelLoad { path: String, reason: String },

    #[error("Invalid context configuration: {0}")]
    InvalidConfig(String),

    #[error("Text needs {needed} tokens but the context holds {capacity}")]
    TokenizeOverflow { needed: usize, capacity: usize },

    #[error("Eval failed: {0}")]
    EvalFailed(String),

    #[error("State buffer is {actual} bytes, engine expects {expected}")]
    StateSize { expected: usize, actual: usize },

    #[error("Corrupt state data: {0}")]
    CorruptState(String),
}

/// Operations the harness needs from an engine context.
///
/// One value is one engine context: it owns the model handle and KV cache
/// and releases them on drop. Calls are synchronous and must not overlap on
/// the same value, which `&mut self` enforces.
pub trait InferenceBackend: Sized {
    /// Load a model and create a fresh context for it.
    fn load(model_path: &Path, params: &ContextParams) -> Result<Self, EngineError>;

    /// Vocabulary size; every logits vector has exactly this length.
    fn n_vocab(&self) -> usize;

    /// Context length the engine was created with.
    fn n_ctx(&self) -> usize;

    /// Encode text, optionally prepending the BOS token.
    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>, EngineError>;

    /// Evaluate `tokens` starting at position `n_past`.
    ///
    /// On success the logits for the last token are available through
    /// [`InferenceBackend::logits`].
    fn eval(&mut self, tokens: &[TokenId], n_past: usize, n_threads: usize)
        -> Result<(), EngineError>;

    /// Logits produced by the most recent eval (or restored with the state).
    fn logits(&self) -> &[f32];

    /// Whether [`InferenceBackend::logits`] holds values from an eval or a
    /// restored state. Only then may the logits be read.
    fn has_logits(&self) -> bool;

    /// The engine's default sampler. May advance engine-internal RNG state.
    fn sample(&mut self, candidates: &mut CandidateSet) -> TokenId;

    /// Text piece for a token.
    fn token_to_str(&self, token: TokenId) -> String;

    /// Bytes needed to hold the full state of this context.
    fn state_size(&self) -> usize;

    /// Copy the full state into `dst`, returning the number of bytes written.
    fn copy_state_data(&self, dst: &mut [u8]) -> Result<usize, EngineError>;

    /// Replace the full state from `src`, returning the number of bytes read.
    fn set_state_data(&mut self, src: &[u8]) -> Result<usize, EngineError>;
}
