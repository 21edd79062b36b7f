//! WrinkleFree session replay
//!
//! Save and restore the complete state of an inference session, then prove
//! that generation continued from the restored state matches generation
//! continued from the live one, token for token.
//!
//! # Features
//!
//! - **llama-inference**: Enable the llama.cpp-backed engine (links libllama)

// Core modules (always available)
pub mod config;
pub mod generation;
pub mod replay;
pub mod session;
pub mod snapshot;

// Backend capability trait, sampling and the pure Rust reference engine
pub mod engine;

// C++ llama.cpp-based inference (feature-gated)
#[cfg(feature = "llama-inference")]
pub mod inference;

pub use config::{ContextParams, ReplayConfig};
pub use engine::{InferenceBackend, ReferenceEngine, SamplingConfig, SamplingEngine, TokenId};
pub use generation::{GenerationError, GenerationLoop, GenerationOutput};
pub use replay::{ReplayError, ReplayReport, SessionReplayHarness};
pub use session::{InferenceSession, SessionError, StateBuffer, TokenHistory};
pub use snapshot::{Snapshot, SnapshotError, SnapshotStore};
