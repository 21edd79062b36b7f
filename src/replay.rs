//! Save, restore and compare.
//!
//! The harness evaluates a prompt in one session, snapshots it to disk,
//! generates from the live session, throws that session away, restores the
//! snapshot into a fresh session and generates again. Both runs use the same
//! [`GenerationLoop`], so any difference in output is a difference in
//! restored state.

use std::fmt;
use std::marker::PhantomData;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{ContextParams, ReplayConfig};
use crate::engine::{InferenceBackend, SamplingEngine, TokenId};
use crate::generation::{GenerationError, GenerationLoop, GenerationOutput};
use crate::session::{InferenceSession, SessionError, TokenHistory};
use crate::snapshot::{Snapshot, SnapshotError, SnapshotStore};

/// Errors from a replay run
#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Generation error: {0}")]
    Generation(#[from] GenerationError),

    #[error("Runs diverged at token {index}: {first:?} vs {second:?}")]
    Diverged {
        index: usize,
        first: Option<TokenId>,
        second: Option<TokenId>,
    },
}

impl ReplayError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        1
    }
}

/// Which of the two generation runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Run {
    /// Continuation of the live session
    Live,
    /// Continuation of the restored session
    Restored,
}

impl fmt::Display for Run {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Run::Live => write!(f, "live"),
            Run::Restored => write!(f, "restored"),
        }
    }
}

/// Progress reported to the caller while the harness runs
#[derive(Debug, Clone, Copy)]
pub enum ReplayEvent<'a> {
    Prompt(&'a str),
    Token { run: Run, id: TokenId, text: &'a str },
    RunComplete(Run),
}

/// Where the snapshot was taken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub state_size: usize,
    pub n_past: usize,
}

/// Outcome of both runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayReport {
    pub first: GenerationOutput,
    pub second: GenerationOutput,
    pub state_size: usize,
    pub n_past_saved: usize,
}

impl ReplayReport {
    pub fn is_consistent(&self) -> bool {
        self.first.tokens == self.second.tokens
    }

    /// Index of the first token where the runs differ.
    pub fn first_divergence(&self) -> Option<usize> {
        let a = &self.first.tokens;
        let b = &self.second.tokens;
        a.iter()
            .zip(b)
            .position(|(x, y)| x != y)
            .or_else(|| (a.len() != b.len()).then(|| a.len().min(b.len())))
    }

    /// Fail with [`ReplayError::Diverged`] unless both runs match.
    pub fn verify(&self) -> Result<(), ReplayError> {
        match self.first_divergence() {
            None => Ok(()),
            Some(index) => Err(ReplayError::Diverged {
                index,
                first: self.first.tokens.get(index).copied(),
                second: self.second.tokens.get(index).copied(),
            }),
        }
    }
}

/// Drives the save/restore/compare sequence for one backend type.
pub struct SessionReplayHarness<B: InferenceBackend> {
    config: ReplayConfig,
    sampler: SamplingEngine,
    _backend: PhantomData<B>,
}

impl<B: InferenceBackend> SessionReplayHarness<B> {
    pub fn new(config: ReplayConfig) -> Self {
        let sampler = SamplingEngine::new(config.sampling.clone());
        Self {
            config,
            sampler,
            _backend: PhantomData,
        }
    }

    pub fn config(&self) -> &ReplayConfig {
        &self.config
    }

    /// Run both generations and report them.
    pub fn run(&self) -> Result<ReplayReport, ReplayError> {
        self.run_with(|_| {})
    }

    /// Like [`SessionReplayHarness::run`], reporting progress to `on_event`.
    ///
    /// Divergence is reported, not treated as an error; use
    /// [`ReplayReport::verify`] for that.
    pub fn run_with<F>(&self, mut on_event: F) -> Result<ReplayReport, ReplayError>
    where
        F: FnMut(ReplayEvent<'_>),
    {
        on_event(ReplayEvent::Prompt(&self.config.prompt));

        let (mut session_a, mut history, checkpoint) = self.prime_and_snapshot()?;
        let first = self.generate(Run::Live, &mut session_a, &mut history, &mut on_event)?;
        session_a.destroy();

        let (mut session_b, mut history) =
            self.restore_session(&self.config.context, checkpoint.state_size)?;
        let second = self.generate(Run::Restored, &mut session_b, &mut history, &mut on_event)?;

        let report = ReplayReport {
            first,
            second,
            state_size: checkpoint.state_size,
            n_past_saved: checkpoint.n_past,
        };
        match report.first_divergence() {
            None => info!("Replay consistent: {} tokens matched", report.first.len()),
            Some(index) => warn!("Replay diverged at token {}", index),
        }
        Ok(report)
    }

    /// Create the first session, evaluate the prompt and write the snapshot.
    pub fn prime_and_snapshot(
        &self,
    ) -> Result<(InferenceSession<B>, TokenHistory, Checkpoint), ReplayError> {
        let mut session = InferenceSession::<B>::create(&self.config.model_path, &self.config.context)?;

        let tokens = session.tokenize(&self.config.prompt)?;
        info!("Prompt: {} tokens", tokens.len());
        session.evaluate(&tokens)?;

        let mut history = TokenHistory::zeroed(self.config.repeat_last_n);
        history.extend(&tokens);

        let state = session.capture_state()?;
        let checkpoint = Checkpoint {
            state_size: state.len(),
            n_past: session.n_past(),
        };
        SnapshotStore::save_snapshot(
            &self.config.snapshot_path,
            &Snapshot {
                state,
                history: history.snapshot_copy(),
                n_past: checkpoint.n_past,
            },
        )?;
        info!(
            "Snapshot taken at n_past={} ({} bytes) -> {}",
            checkpoint.n_past,
            checkpoint.state_size,
            self.config.snapshot_path.display()
        );

        Ok((session, history, checkpoint))
    }

    /// Create a fresh session with `params` and restore the snapshot into it.
    ///
    /// `saved_state_size` is the size of the blob captured earlier; it must
    /// equal the new session's state size before anything is read from disk.
    pub fn restore_session(
        &self,
        params: &ContextParams,
        saved_state_size: usize,
    ) -> Result<(InferenceSession<B>, TokenHistory), ReplayError> {
        let mut session = InferenceSession::<B>::create(&self.config.model_path, params)?;

        let expected = session.state_size();
        if saved_state_size != expected {
            error!(
                "State size mismatch: snapshot has {} bytes, new session expects {}",
                saved_state_size, expected
            );
            return Err(SessionError::StateSizeMismatch {
                expected,
                actual: saved_state_size,
            }
            .into());
        }

        let snapshot = SnapshotStore::load_snapshot(&self.config.snapshot_path, expected)?;
        session.restore_state(&snapshot.state)?;
        session.set_n_past(snapshot.n_past)?;
        debug!("Restored session at n_past={}", snapshot.n_past);

        Ok((session, snapshot.history))
    }

    fn generate<F>(
        &self,
        run: Run,
        session: &mut InferenceSession<B>,
        history: &mut TokenHistory,
        on_event: &mut F,
    ) -> Result<GenerationOutput, ReplayError>
    where
        F: FnMut(ReplayEvent<'_>),
    {
        let mut gen = GenerationLoop::new(self.config.n_predict, self.sampler.clone());
        let output = gen
            .run(session, history, |id, text| {
                on_event(ReplayEvent::Token { run, id, text })
            })
            .map_err(|e| {
                error!("Generation failed in the {} run: {}", run, e);
                e
            })?;
        on_event(ReplayEvent::RunComplete(run));
        Ok(output)
    }
}
