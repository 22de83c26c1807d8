//! Execution backends.
//!
//! Every backend maps one stage over a list of work items and returns a flat
//! list of result records. Any item failure fails the whole call; there is no
//! partial success. Items that report `StageError::EmptyInput` contribute no
//! records and are not failures.
//!
//! - `LocalBackend`: synchronous when one worker is allocated, a bounded
//!   tokio task pool otherwise.
//! - `QueueBackend`: jobs submitted to a `JobBroker`, polled on an interval,
//!   siblings revoked on the first failure.
//! - `ClusterBackend`: a per-stage engine pool started through an
//!   `EngineLauncher`, torn down whatever the outcome.

pub mod cluster;
pub mod local;
pub mod queue;

use std::future::Future;
use std::sync::Arc;

use seqflow_types::config::BackendKind;
use seqflow_types::error::StageError;
use seqflow_types::record::{DataRecord, WorkItem};

use crate::resources::Allocation;
use crate::retry::Transient;
use crate::stage::Stage;

pub use cluster::{
    ClusterBackend, ClusterError, ClusterPlacement, EngineLauncher, EnginePool, EngineSpec,
};
pub use local::LocalBackend;
pub use queue::{BrokerError, JobBroker, QueueBackend};

/// A pluggable execution substrate.
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Run `stage` over every item and flatten the results.
    fn map(
        &self,
        stage: Arc<dyn Stage>,
        items: Vec<WorkItem>,
        alloc: &Allocation,
    ) -> impl Future<Output = Result<Vec<DataRecord>, BackendError>> + Send;
}

/// Errors from backend dispatch.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// A broker or cluster service stayed unreachable after retries.
    #[error("backend unavailable: {0}")]
    Transient(String),

    #[error("stage '{stage}' failed on {item}: {error}")]
    ItemFailed {
        stage: String,
        item: String,
        error: String,
    },

    #[error("stage dispatch cancelled")]
    Cancelled,

    #[error("worker task failed: {0}")]
    Join(String),

    #[error("backend misconfigured: {0}")]
    Config(String),
}

impl Transient for BackendError {
    fn is_transient(&self) -> bool {
        matches!(self, BackendError::Transient(_))
    }
}

/// Turn one item's stage result into records or a stage-level failure.
pub(crate) fn settle(
    stage: &str,
    item: &str,
    result: Result<Vec<DataRecord>, StageError>,
) -> Result<Vec<DataRecord>, BackendError> {
    match result {
        Ok(records) => Ok(records),
        Err(e) if e.is_empty_input() => {
            tracing::debug!(stage, item, reason = %e, "skipping empty input");
            Ok(Vec::new())
        }
        Err(e) => Err(BackendError::ItemFailed {
            stage: stage.to_string(),
            item: item.to_string(),
            error: e.to_string(),
        }),
    }
}
