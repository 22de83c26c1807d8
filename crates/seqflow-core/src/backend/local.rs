//! In-process execution: synchronous for one worker, pooled otherwise.

use std::sync::Arc;

use seqflow_types::config::BackendKind;
use seqflow_types::error::StageError;
use seqflow_types::record::{DataRecord, WorkItem};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::{settle, Backend, BackendError};
use crate::resources::Allocation;
use crate::stage::Stage;

/// Runs stages on the current machine.
///
/// With `workers <= 1` items run one after another in order and the first
/// error is returned as soon as it happens. With more workers, items run as
/// tokio tasks bounded by a semaphore and results are collected in completion
/// order. After a failure no further items start, while items already
/// running are allowed to finish. Cancelling the token aborts every task.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    cancel: CancellationToken,
}

impl LocalBackend {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    async fn run_sequential(
        &self,
        stage: Arc<dyn Stage>,
        items: Vec<WorkItem>,
        alloc: &Allocation,
    ) -> Result<Vec<DataRecord>, BackendError> {
        let mut results = Vec::new();
        for item in items {
            let label = item.label();
            tracing::debug!(stage = stage.name(), item = label.as_str(), "running item");
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return Err(BackendError::Cancelled),
                result = stage.run(item, alloc) => result,
            };
            results.extend(settle(stage.name(), &label, result)?);
        }
        Ok(results)
    }

    async fn run_pooled(
        &self,
        stage: Arc<dyn Stage>,
        items: Vec<WorkItem>,
        alloc: &Allocation,
    ) -> Result<Vec<DataRecord>, BackendError> {
        let semaphore = Arc::new(Semaphore::new(alloc.workers));
        let failed = self.cancel.child_token();
        let alloc = Arc::new(alloc.clone());
        let mut join_set: JoinSet<Option<(String, Result<Vec<DataRecord>, StageError>)>> =
            JoinSet::new();

        for item in items {
            let stage = Arc::clone(&stage);
            let semaphore = Arc::clone(&semaphore);
            let failed = failed.clone();
            let alloc = Arc::clone(&alloc);

            join_set.spawn(async move {
                let _permit = tokio::select! {
                    biased;
                    _ = failed.cancelled() => return None,
                    permit = semaphore.acquire_owned() => permit.ok()?,
                };
                if failed.is_cancelled() {
                    return None;
                }
                let label = item.label();
                tracing::debug!(stage = stage.name(), item = label.as_str(), "running item");
                let result = stage.run(item, &alloc).await;
                Some((label, result))
            });
        }

        let mut results = Vec::new();
        let mut first_error: Option<BackendError> = None;

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => {
                    join_set.abort_all();
                    while join_set.join_next().await.is_some() {}
                    return Err(BackendError::Cancelled);
                }
                next = join_set.join_next() => next,
            };
            let Some(joined) = next else { break };

            match joined {
                Ok(Some((label, result))) => match settle(stage.name(), &label, result) {
                    Ok(records) => results.extend(records),
                    Err(e) => {
                        if first_error.is_none() {
                            tracing::error!(
                                stage = stage.name(),
                                item = label.as_str(),
                                error = %e,
                                "item failed, not starting remaining items"
                            );
                            failed.cancel();
                            first_error = Some(e);
                        }
                    }
                },
                Ok(None) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    failed.cancel();
                    first_error.get_or_insert(BackendError::Join(e.to_string()));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(results),
        }
    }
}

impl Backend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
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
        if alloc.workers <= 1 {
            self.run_sequential(stage, items, alloc).await
        } else {
            tracing::debug!(
                stage = stage.name(),
                items = items.len(),
                workers = alloc.workers,
                "dispatching to local pool"
            );
            self.run_pooled(stage, items, alloc).await
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
