//! Broker job identifiers and states.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::record::DataRecord;

/// Identifier for a job submitted to a message broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// A fresh, time-sortable job id.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Observed state of a broker job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    /// Queued, not yet picked up by a worker.
    Pending,
    /// A worker is executing the job.
    Running,
    /// Finished; carries the records the stage returned.
    Succeeded { records: Vec<DataRecord> },
    /// The stage raised; carries the rendered error.
    Failed { error: String },
    /// Revoked before it could finish.
    Revoked,
}

impl JobState {
    /// Whether the job will not change state again.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded { .. } | JobState::Failed { .. } | JobState::Revoked
        )
    }
}
