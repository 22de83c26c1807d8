//! In-process job broker.
//!
//! Jobs go onto an unbounded queue drained by a fixed set of worker tasks.
//! Each worker resolves the job's stage through the shared `StageRegistry`,
//! so the broker runs exactly the implementations the driver registered.
//! Job state lives in a `DashMap` the driver polls through `status`; entries
//! are dropped once the driver forgets their job set.

use std::sync::Arc;

use dashmap::DashMap;
use seqflow_core::backend::{BrokerError, JobBroker};
use seqflow_core::resources::Allocation;
use seqflow_core::stage::StageRegistry;
use seqflow_types::job::{JobId, JobState};
use seqflow_types::record::WorkItem;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct JobEntry {
    state: JobState,
    revoke: CancellationToken,
}

struct QueuedJob {
    id: JobId,
    stage: String,
    item: WorkItem,
    alloc: Allocation,
}

type JobTable = Arc<DashMap<JobId, JobEntry>>;

/// Broker whose workers are tokio tasks in this process.
pub struct InProcessBroker {
    jobs: JobTable,
    sender: mpsc::UnboundedSender<QueuedJob>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl InProcessBroker {
    /// Start `concurrency` workers serving stages from `registry`.
    ///
    /// Cancelling `cancel` stops the workers and revokes running jobs.
    pub fn start(registry: StageRegistry, concurrency: usize, cancel: &CancellationToken) -> Self {
        let concurrency = concurrency.max(1);
        let jobs: JobTable = Arc::new(DashMap::new());
        let (sender, receiver) = mpsc::unbounded_channel();
        let receiver = Arc::new(Mutex::new(receiver));
        let shutdown = cancel.child_token();

        let workers = (0..concurrency)
            .map(|worker| {
                tokio::spawn(work(
                    worker,
                    registry.clone(),
                    Arc::clone(&jobs),
                    Arc::clone(&receiver),
                    shutdown.clone(),
                ))
            })
            .collect();
        tracing::info!(workers = concurrency, "in-process broker started");

        Self {
            jobs,
            sender,
            workers: std::sync::Mutex::new(workers),
            shutdown,
        }
    }

    /// Number of jobs the broker is still tracking.
    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Stop the workers and wait for them to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = match self.workers.lock() {
            Ok(mut workers) => workers.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "broker worker panicked");
            }
        }
        tracing::info!("in-process broker stopped");
    }
}

impl JobBroker for InProcessBroker {
    async fn submit(&self, stage: &str, item: &WorkItem, alloc: &Allocation) -> Result<JobId, BrokerError> {
        if self.shutdown.is_cancelled() {
            return Err(BrokerError::Unavailable("broker is shut down".to_string()));
        }
        let id = JobId::new();
        self.jobs.insert(
            id,
            JobEntry {
                state: JobState::Pending,
                revoke: self.shutdown.child_token(),
            },
        );
        let job = QueuedJob {
            id,
            stage: stage.to_string(),
            item: item.clone(),
            alloc: alloc.clone(),
        };
        if self.sender.send(job).is_err() {
            self.jobs.remove(&id);
            return Err(BrokerError::Unavailable("broker queue is closed".to_string()));
        }
        Ok(id)
    }

    async fn status(&self, id: JobId) -> Result<JobState, BrokerError> {
        self.jobs
            .get(&id)
            .map(|entry| entry.state.clone())
            .ok_or(BrokerError::UnknownJob(id))
    }

    async fn revoke(&self, id: JobId) -> Result<(), BrokerError> {
        let mut entry = self.jobs.get_mut(&id).ok_or(BrokerError::UnknownJob(id))?;
        if !entry.state.is_finished() {
            entry.state = JobState::Revoked;
            entry.revoke.cancel();
            tracing::debug!(job = %id, "job revoked");
        }
        Ok(())
    }

    async fn forget(&self, ids: Vec<JobId>) {
        for id in ids {
            if let Some((_, entry)) = self.jobs.remove(&id) {
                // A worker still holding the job sees the token and stops.
                entry.revoke.cancel();
            }
        }
    }
}

/// Set a job's state unless it was revoked in the meantime.
fn transition(jobs: &JobTable, id: JobId, state: JobState) {
    if let Some(mut entry) = jobs.get_mut(&id) {
        if entry.state != JobState::Revoked {
            entry.state = state;
        }
    }
}

async fn work(
    worker: usize,
    registry: StageRegistry,
    jobs: JobTable,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<QueuedJob>>>,
    shutdown: CancellationToken,
) {
    loop {
        let next = {
            let mut rx = receiver.lock().await;
            tokio::select! {
                _ = shutdown.cancelled() => None,
                job = rx.recv() => job,
            }
        };
        let Some(job) = next else { break };

        let Some(revoke) = jobs.get(&job.id).map(|e| e.revoke.clone()) else {
            continue;
        };
        if revoke.is_cancelled() {
            continue;
        }
        transition(&jobs, job.id, JobState::Running);

        let label = job.item.label();
        let Some(stage) = registry.get(&job.stage) else {
            tracing::warn!(worker, stage = job.stage.as_str(), "job names an unregistered stage");
            transition(
                &jobs,
                job.id,
                JobState::Failed {
                    error: format!("unknown stage '{}'", job.stage),
                },
            );
            continue;
        };

        tracing::debug!(worker, job = %job.id, stage = job.stage.as_str(), item = label.as_str(), "job started");
        let outcome = tokio::select! {
            _ = revoke.cancelled() => None,
            result = stage.run(job.item, &job.alloc) => Some(result),
        };
        let state = match outcome {
            None => JobState::Revoked,
            Some(Ok(records)) => JobState::Succeeded { records },
            Some(Err(e)) if e.is_empty_input() => {
                tracing::debug!(job = %job.id, reason = %e, "empty input, no records");
                JobState::Succeeded { records: Vec::new() }
            }
            Some(Err(e)) => JobState::Failed { error: e.to_string() },
        };
        tracing::debug!(worker, job = %job.id, item = label.as_str(), failed = matches!(state, JobState::Failed { .. }), "job finished");
        transition(&jobs, job.id, state);
    }
    tracing::trace!(worker, "broker worker exiting");
}
