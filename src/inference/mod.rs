//! llama.cpp-backed engine.
//!
//! Rust bindings to a prebuilt libllama, exposed through the same
//! [`InferenceBackend`](crate::engine::InferenceBackend) trait as the
//! reference engine.

mod engine;
mod llama_ffi;

pub use engine::LlamaEngine;
