//! Engine capability interface, sampling and the reference engine.
//!
//! The harness talks to any engine through [`InferenceBackend`]. Two
//! implementations exist:
//! - [`ReferenceEngine`] - pure Rust, deterministic, always available
//! - `inference::LlamaEngine` - llama.cpp via FFI (feature `llama-inference`)
//!
//! ## Usage
//! ```ignore
//! use wf_session_replay::engine::{InferenceBackend, ReferenceEngine};
//!
//! let mut engine = ReferenceEngine::load("model.bin".as_ref(), &params)?;
//! let tokens = engine.tokenize("The quick brown fox", true)?;
//! engine.eval(&tokens, 0, 4)?;
//! let mut state = vec![0u8; engine.state_size()];
//! engine.copy_state_data(&mut state)?;
//! ```

mod backend;
mod kv_cache;
mod model;
mod sampling;

pub use backend::{EngineError, InferenceBackend, TokenId};
pub use kv_cache::{KVCache, KVCacheConfig};
pub use model::{
    ReferenceEngine, ReferenceModelSpec, MODEL_MAGIC, MODEL_VERSION, REFERENCE_VOCAB_SIZE,
    TOKEN_BOS, TOKEN_EOS, TOKEN_UNK,
};
pub use sampling::{
    CandidateSet, SamplingConfig, SamplingEngine, SamplingError, SamplingStrategy, TokenData,
};
