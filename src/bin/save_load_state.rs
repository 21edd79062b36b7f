//! Session save/load replay check
//!
//! Evaluates a prompt, snapshots the session to disk, generates, then
//! restores the snapshot into a fresh session and generates again. Both
//! continuations are printed; with `--verify` any difference is a failure.
//!
//! Usage:
//!   cargo run --release --bin save_load_state -- \
//!     --model models/reference.bin --init-reference-model --verify
//!
//! With `--features llama-inference` the binary drives llama.cpp instead of
//! the reference engine.

// Use mimalloc as the global allocator
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::io::Write;
use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};

use wf_session_replay::replay::{ReplayEvent, Run};
use wf_session_replay::{ReplayConfig, ReplayError, ReplayReport, SessionReplayHarness};

#[cfg(not(feature = "llama-inference"))]
use wf_session_replay::engine::ReferenceModelSpec;
#[cfg(not(feature = "llama-inference"))]
type Backend = wf_session_replay::ReferenceEngine;
#[cfg(feature = "llama-inference")]
type Backend = wf_session_replay::inference::LlamaEngine;

/// Save a session, restore it, and compare both continuations
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the model file
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// YAML config; command-line flags override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// RNG seed
    #[arg(short, long)]
    seed: Option<u64>,

    /// Number of threads for evaluation
    #[arg(short, long)]
    threads: Option<usize>,

    /// Prompt evaluated before the snapshot
    #[arg(short, long)]
    prompt: Option<String>,

    /// Tokens to generate per run (negative selects 16)
    #[arg(short = 'n', long, allow_negative_numbers = true)]
    n_predict: Option<i64>,

    /// Context size in tokens
    #[arg(short = 'c', long)]
    ctx_size: Option<usize>,

    /// Token history window
    #[arg(long)]
    repeat_last_n: Option<usize>,

    /// Where to write the state blob
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Read the model fully instead of memory-mapping it
    #[arg(long)]
    no_mmap: bool,

    /// Lock the model in memory
    #[arg(long)]
    mlock: bool,

    /// Keep the KV cache in f32
    #[arg(long)]
    f32_kv: bool,

    /// Exit with an error if the two runs differ
    #[arg(long)]
    verify: bool,

    /// Write a reference model to --model if none exists
    #[arg(long)]
    init_reference_model: bool,

    /// Print an example YAML config and exit
    #[arg(long)]
    example_config: bool,
}

impl Args {
    /// Resolve the final config: defaults, then YAML, then flags.
    fn into_config(self) -> Result<ReplayConfig, String> {
        let mut config = match &self.config {
            Some(path) => ReplayConfig::from_yaml(path)?,
            None => ReplayConfig::default(),
        };

        if let Some(model) = self.model {
            config.model_path = model;
        }
        if let Some(seed) = self.seed {
            config.context.seed = seed;
        }
        if let Some(threads) = self.threads {
            config.context.n_threads = threads;
        }
        if let Some(prompt) = self.prompt {
            config.prompt = prompt;
        }
        if let Some(n_predict) = self.n_predict {
            config.n_predict = ReplayConfig::resolve_n_predict(n_predict);
        }
        if let Some(ctx_size) = self.ctx_size {
            config.context.context_length = ctx_size;
        }
        if let Some(repeat_last_n) = self.repeat_last_n {
            config.repeat_last_n = repeat_last_n;
        }
        if let Some(snapshot) = self.snapshot {
            config.snapshot_path = snapshot;
        }
        if self.no_mmap {
            config.context.use_mmap = false;
        }
        if self.mlock {
            config.context.use_mlock = true;
        }
        if self.f32_kv {
            config.context.use_half_precision_cache = false;
        }
        Ok(config)
    }
}

#[cfg(not(feature = "llama-inference"))]
fn init_reference_model(config: &ReplayConfig) -> Result<(), String> {
    if config.model_path.exists() {
        info!("Model already present at {}", config.model_path.display());
        return Ok(());
    }
    ReferenceModelSpec::default()
        .write_to(&config.model_path)
        .map_err(|e| format!("Failed to write reference model: {}", e))?;
    info!("Wrote reference model to {}", config.model_path.display());
    Ok(())
}

#[cfg(feature = "llama-inference")]
fn init_reference_model(_config: &ReplayConfig) -> Result<(), String> {
    Err("--init-reference-model requires the reference engine build".to_string())
}

fn print_piece(piece: &str) {
    let mut stdout = std::io::stdout().lock();
    let _ = write!(stdout, "{}", piece);
    let _ = stdout.flush();
}

fn run(config: &ReplayConfig) -> Result<ReplayReport, ReplayError> {
    let harness = SessionReplayHarness::<Backend>::new(config.clone());
    harness.run_with(|event| match event {
        ReplayEvent::Prompt(prompt) => print_piece(prompt),
        ReplayEvent::Token { text, .. } => print_piece(text),
        ReplayEvent::RunComplete(run) => {
            print_piece("\n\n");
            if run == Run::Live {
                info!("Live run done, restoring snapshot");
            }
        }
    })
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if args.example_config {
        print!("{}", ReplayConfig::example_yaml());
        return;
    }

    let verify = args.verify;
    let init_model = args.init_reference_model;
    let config = match args.into_config() {
        Ok(c) => c,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    info!("=== Session save/load replay ===");
    info!("Model: {}", config.model_path.display());
    info!(
        "seed={} n_ctx={} n_threads={} n_predict={} repeat_last_n={}",
        config.context.seed,
        config.context.context_length,
        config.context.n_threads,
        config.n_predict,
        config.repeat_last_n
    );

    if init_model {
        if let Err(e) = init_reference_model(&config) {
            error!("{}", e);
            std::process::exit(1);
        }
    }

    let report = match run(&config) {
        Ok(r) => r,
        Err(e) => {
            error!("{}", e);
            std::process::exit(e.exit_code());
        }
    };

    info!(
        "Snapshot: {} bytes at n_past={} ({})",
        report.state_size,
        report.n_past_saved,
        config.snapshot_path.display()
    );

    if verify {
        if let Err(e) = report.verify() {
            error!("{}", e);
            std::process::exit(e.exit_code());
        }
        info!("Verified: both runs produced {} identical tokens", report.first.len());
    }
}
