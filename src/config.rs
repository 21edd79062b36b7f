//! Run configuration for the save/load harness.
//!
//! Example YAML config (replay.yaml):
//! ```yaml
//! model_path: models/7B/ggml-model.bin
//! prompt: "The quick brown fox"
//! n_predict: 16
//! repeat_last_n: 64
//! snapshot_path: dump_state.bin
//!
//! context:
//!   context_length: 512
//!   seed: 42
//!   n_threads: 4
//!   use_mmap: true
//!   use_mlock: false
//!   use_half_precision_cache: true
//!
//! sampling:
//!   strategy: engine_default
//!   repetition_penalty: 1.0
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::engine::SamplingConfig;

/// Number of tokens generated when the caller asks for a negative count.
pub const DEFAULT_N_PREDICT: usize = 16;

/// Engine context configuration, fixed for the lifetime of a session.
///
/// A snapshot can only be restored into a session created from the same
/// model with the same `ContextParams`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ContextParams {
    /// Maximum number of token positions in the context
    pub context_length: usize,
    /// Seed for the engine's sampler RNG
    pub seed: u64,
    /// Threads the backend may use inside one evaluate call
    pub n_threads: usize,
    /// Memory-map model weights instead of reading them
    pub use_mmap: bool,
    /// Ask the OS to keep model weights resident
    pub use_mlock: bool,
    /// Store the KV cache in 16-bit precision
    pub use_half_precision_cache: bool,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            context_length: 512,
            seed: 42,
            n_threads: 4,
            use_mmap: true,
            use_mlock: false,
            use_half_precision_cache: true,
        }
    }
}

/// Full harness configuration loaded from YAML or CLI args.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Path to the model artifact
    pub model_path: PathBuf,
    /// Prompt evaluated before the snapshot is taken
    pub prompt: String,
    /// Tokens generated in each of the two runs
    pub n_predict: usize,
    /// Capacity of the rolling token history
    pub repeat_last_n: usize,
    /// Where the raw state blob is written
    pub snapshot_path: PathBuf,
    /// Engine context settings
    pub context: ContextParams,
    /// Sampler settings
    pub sampling: SamplingConfig,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/7B/ggml-model.bin"),
            prompt: "The quick brown fox".to_string(),
            n_predict: DEFAULT_N_PREDICT,
            repeat_last_n: 64,
            snapshot_path: PathBuf::from("dump_state.bin"),
            context: ContextParams::default(),
            sampling: SamplingConfig::default(),
        }
    }
}

impl ReplayConfig {
    /// Load config from YAML file.
    pub fn from_yaml(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;
        serde_yaml::from_str(&content).map_err(|e| format!("Failed to parse YAML config: {}", e))
    }

    /// Generate example YAML config.
    pub fn example_yaml() -> String {
        serde_yaml::to_string(&Self::default()).unwrap_or_default()
    }

    /// Resolve a signed token count the way the CLI accepts it.
    ///
    /// Negative values select [`DEFAULT_N_PREDICT`].
    pub fn resolve_n_predict(requested: i64) -> usize {
        usize::try_from(requested).unwrap_or(DEFAULT_N_PREDICT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SamplingStrategy;

    #[test]
    fn test_defaults_match_demo_settings() {
        let config = ReplayConfig::default();
        assert_eq!(config.prompt, "The quick brown fox");
        assert_eq!(config.n_predict, 16);
        assert_eq!(config.repeat_last_n, 64);
        assert_eq!(config.context.seed, 42);
        assert_eq!(config.context.n_threads, 4);
        assert_eq!(config.sampling.strategy, SamplingStrategy::EngineDefault);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = "prompt: hello\ncontext:\n  context_length: 128\n";
        let config: ReplayConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.prompt, "hello");
        assert_eq!(config.context.context_length, 128);
        assert_eq!(config.context.seed, 42);
        assert_eq!(config.n_predict, 16);
    }

    #[test]
    fn test_example_yaml_parses_back() {
        let yaml = ReplayConfig::example_yaml();
        let config: ReplayConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config.context, ContextParams::default());
        assert_eq!(config.snapshot_path, PathBuf::from("dump_state.bin"));
    }

    #[test]
    fn test_from_yaml_reports_missing_file() {
        let err = ReplayConfig::from_yaml(Path::new("/nonexistent/replay.yaml")).unwrap_err();
        assert!(err.contains("Failed to read config file"));
    }

    #[test]
    fn test_negative_n_predict_uses_default() {
        assert_eq!(ReplayConfig::resolve_n_predict(-1), 16);
        assert_eq!(ReplayConfig::resolve_n_predict(0), 0);
        assert_eq!(ReplayConfig::resolve_n_predict(32), 32);
    }
}
