//! Stage-level checkpoints.
//!
//! A checkpoint identifies one stage call within a run by a sequence number
//! (incremented once per distinct stage call) and the stage name. Only the
//! presence of a checkpoint matters: if it exists the stage is restored from
//! materialized files instead of being dispatched again. Checkpoints are
//! written after every item of a stage succeeds and never on failure.

use std::fmt;
use std::future::Future;

use seqflow_types::config::BackendKind;

// ---------------------------------------------------------------------------
// CheckpointKey
// ---------------------------------------------------------------------------

/// Identity of one stage call within a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CheckpointKey {
    pub sequence: u32,
    pub stage: String,
}

impl CheckpointKey {
    pub fn new(sequence: u32, stage: impl Into<String>) -> Self {
        Self {
            sequence,
            stage: stage.into(),
        }
    }

    /// Marker file name, e.g. `3-align.done`.
    pub fn file_name(&self) -> String {
        format!("{}-{}.done", self.sequence, self.stage)
    }

    /// Parse a marker file name back into a key.
    pub fn parse_file_name(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(".done")?;
        let (seq, stage) = stem.split_once('-')?;
        if stage.is_empty() {
            return None;
        }
        Some(Self::new(seq.parse().ok()?, stage))
    }
}

impl fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.sequence, self.stage)
    }
}

/// Directory name holding checkpoints for a backend, e.g. `checkpoints_local`.
pub fn checkpoint_dir_name(kind: BackendKind) -> String {
    format!("checkpoints_{}", kind.as_str())
}

// ---------------------------------------------------------------------------
// CheckpointStore port
// ---------------------------------------------------------------------------

/// Persistence for checkpoint markers.
///
/// Implemented by the filesystem store in the infrastructure layer and by an
/// in-memory store in tests.
pub trait CheckpointStore: Send + Sync {
    fn exists(
        &self,
        key: &CheckpointKey,
    ) -> impl Future<Output = Result<bool, CheckpointError>> + Send;

    fn mark(&self, key: &CheckpointKey) -> impl Future<Output = Result<(), CheckpointError>> + Send;

    /// All recorded checkpoints, ordered by sequence.
    fn list(&self) -> impl Future<Output = Result<Vec<CheckpointKey>, CheckpointError>> + Send;
}

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Hands out sequence numbers and wraps a `CheckpointStore`.
///
/// The sequence counter is driver-local: one manager per run, used from a
/// single task.
pub struct CheckpointManager<S: CheckpointStore> {
    store: S,
    sequence: u32,
}

impl<S: CheckpointStore> CheckpointManager<S> {
    pub fn new(store: S) -> Self {
        Self { store, sequence: 0 }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Allocate the key for the next stage call.
    pub fn next_key(&mut self, stage: &str) -> CheckpointKey {
        self.sequence += 1;
        CheckpointKey::new(self.sequence, stage)
    }

    pub async fn is_done(&self, key: &CheckpointKey) -> Result<bool, CheckpointError> {
        let done = self.store.exists(key).await?;
        if done {
            tracing::debug!(checkpoint = %key, "checkpoint present");
        }
        Ok(done)
    }

    pub async fn mark_done(&self, key: &CheckpointKey) -> Result<(), CheckpointError> {
        self.store.mark(key).await?;
        tracing::debug!(checkpoint = %key, "checkpoint written");
        Ok(())
    }
}

/// Errors from checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint store error: {0}")]
    Store(String),

    #[error("checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
