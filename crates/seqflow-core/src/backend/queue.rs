//! Message-broker execution.
//!
//! Each work item becomes one asynchronous job. The driver polls the job set
//! on a fixed interval; the first failed job triggers explicit revocation of
//! every job that has not finished, then the failure is returned.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use seqflow_types::config::{BackendKind, RetryPolicy};
use seqflow_types::job::{JobId, JobState};
use seqflow_types::record::{DataRecord, WorkItem};
use tokio_util::sync::CancellationToken;

use super::{Backend, BackendError};
use crate::resources::Allocation;
use crate::retry::{retry_transient, Transient};
use crate::stage::Stage;

/// A job broker that runs registered stages by name.
///
/// Workers behind the broker resolve the stage name through the same
/// `StageRegistry` the driver was built with.
pub trait JobBroker: Send + Sync {
    fn submit(
        &self,
        stage: &str,
        item: &WorkItem,
        alloc: &Allocation,
    ) -> impl Future<Output = Result<JobId, BrokerError>> + Send;

    fn status(&self, id: JobId) -> impl Future<Output = Result<JobState, BrokerError>> + Send;

    /// Revoke a job. Revoking a finished job is a no-op.
    fn revoke(&self, id: JobId) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Drop bookkeeping for jobs the driver no longer polls.
    ///
    /// Called once per job set, whatever its outcome. Unfinished jobs among
    /// `ids` are abandoned.
    fn forget(&self, ids: Vec<JobId>) -> impl Future<Output = ()> + Send {
        let _ = ids;
        async {}
    }
}

/// Errors from a broker.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("unknown job {0}")]
    UnknownJob(JobId),

    #[error("job rejected: {0}")]
    Rejected(String),
}

impl Transient for BrokerError {
    fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Unavailable(_))
    }
}

impl From<BrokerError> for BackendError {
    fn from(e: BrokerError) -> Self {
        match e {
            BrokerError::Unavailable(msg) => BackendError::Transient(msg),
            other => BackendError::Config(other.to_string()),
        }
    }
}

struct Submitted {
    id: JobId,
    label: String,
}

/// Dispatches items as broker jobs.
pub struct QueueBackend<B: JobBroker> {
    broker: Arc<B>,
    poll_interval: Duration,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl<B: JobBroker> QueueBackend<B> {
    pub fn new(
        broker: Arc<B>,
        poll_interval: Duration,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            broker,
            poll_interval,
            retry,
            cancel,
        }
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    /// Best-effort revocation of `ids`.
    async fn revoke_all(&self, ids: Vec<JobId>) {
        let mut revoked = 0usize;
        for id in ids {
            match self.broker.revoke(id).await {
                Ok(()) => revoked += 1,
                Err(e) => tracing::warn!(job = %id, error = %e, "failed to revoke job"),
            }
        }
        tracing::info!(revoked, "revoked outstanding jobs");
    }

    async fn submit_all(
        &self,
        stage: &str,
        items: &[WorkItem],
        alloc: &Allocation,
    ) -> Result<Vec<Submitted>, BackendError> {
        let mut jobs = Vec::with_capacity(items.len());
        for item in items {
            let submitted = retry_transient(&self.retry, &self.cancel, "submit job", || {
                self.broker.submit(stage, item, alloc)
            })
            .await;
            match submitted {
                Ok(id) => {
                    tracing::debug!(stage, item = item.label().as_str(), job = %id, "submitted job");
                    jobs.push(Submitted {
                        id,
                        label: item.label(),
                    });
                }
                Err(e) => {
                    let ids: Vec<JobId> = jobs.iter().map(|j| j.id).collect();
                    self.revoke_all(ids.clone()).await;
                    self.broker.forget(ids).await;
                    return Err(e.into());
                }
            }
        }
        Ok(jobs)
    }

    async fn poll_until_done(
        &self,
        stage: &str,
        jobs: &[Submitted],
    ) -> Result<Vec<DataRecord>, BackendError> {
        let mut outcomes: Vec<Option<Vec<DataRecord>>> = jobs.iter().map(|_| None).collect();
        let mut pending: Vec<usize> = (0..jobs.len()).collect();

        loop {
            let mut still_pending = Vec::new();
            for &index in &pending {
                let job = &jobs[index];
                let state = match retry_transient(&self.retry, &self.cancel, "poll job", || {
                    self.broker.status(job.id)
                })
                .await
                {
                    Ok(state) => state,
                    Err(e) => {
                        self.revoke_unfinished(jobs, &outcomes, None).await;
                        return Err(e.into());
                    }
                };

                let error = match state {
                    JobState::Succeeded { records } => {
                        outcomes[index] = Some(records);
                        continue;
                    }
                    JobState::Pending | JobState::Running => {
                        still_pending.push(index);
                        continue;
                    }
                    JobState::Failed { error } => error,
                    JobState::Revoked => "job was revoked".to_string(),
                };

                tracing::error!(stage, item = job.label.as_str(), job = %job.id, error = error.as_str(), "job failed");
                self.revoke_unfinished(jobs, &outcomes, Some(index)).await;
                return Err(BackendError::ItemFailed {
                    stage: stage.to_string(),
                    item: job.label.clone(),
                    error,
                });
            }

            if still_pending.is_empty() {
                break;
            }
            pending = still_pending;
            tracing::debug!(stage, pending = pending.len(), "waiting for jobs");

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.revoke_unfinished(jobs, &outcomes, None).await;
                    return Err(BackendError::Cancelled);
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        Ok(outcomes.into_iter().flatten().flatten().collect())
    }

    async fn revoke_unfinished(
        &self,
        jobs: &[Submitted],
        outcomes: &[Option<Vec<DataRecord>>],
        failed: Option<usize>,
    ) {
        let ids: Vec<JobId> = jobs
            .iter()
            .enumerate()
            .filter(|(i, _)| outcomes[*i].is_none() && Some(*i) != failed)
            .map(|(_, job)| job.id)
            .collect();
        self.revoke_all(ids).await;
    }
}

impl<B: JobBroker> Backend for QueueBackend<B> {
    fn kind(&self) -> BackendKind {
        BackendKind::Queue
    }

    async fn map(
        &self,
        stage: Arc<dyn Stage>,
        items: Vec<WorkItem>,
        alloc: &Allocation,
    ) -> Result<Vec<DataRecord>, BackendError> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let jobs = self.submit_all(stage.name(), &items, alloc).await?;
        tracing::info!(stage = stage.name(), jobs = jobs.len(), "job set submitted");
        let result = self.poll_until_done(stage.name(), &jobs).await;
        self.broker.forget(jobs.iter().map(|j| j.id).collect()).await;
        result
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
