//! Cluster-engine execution.
//!
//! A pool of remote engines is started per stage call, sized and typed from
//! the stage's allocation (distinct stages may need distinct core counts).
//! The driver waits for the engines to register with bounded retry, submits
//! one load-balanced map call and stops the pool afterwards, on success,
//! failure or cancellation alike.

use std::future::Future;
use std::sync::Arc;

use seqflow_types::config::{BackendKind, RetryPolicy, SchedulerFamily};
use seqflow_types::error::StageError;
use seqflow_types::record::{DataRecord, WorkItem};
use seqflow_types::resources::MemorySize;
use tokio_util::sync::CancellationToken;

use super::{settle, Backend, BackendError};
use crate::resources::Allocation;
use crate::retry::{retry_transient, Transient};
use crate::stage::Stage;

/// What a launcher needs to start one engine pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSpec {
    pub stage: String,
    pub engines: usize,
    pub cores_per_engine: u32,
    pub memory_per_engine: Option<MemorySize>,
    pub scheduler: SchedulerFamily,
    pub queue: String,
    /// Extra scheduler resource flags passed through verbatim.
    pub extra: Vec<String>,
}

/// Starts engine pools on a grid scheduler.
pub trait EngineLauncher: Send + Sync {
    type Pool: EnginePool;

    fn start(&self, spec: &EngineSpec) -> impl Future<Output = Result<Self::Pool, ClusterError>> + Send;
}

/// A running set of engines.
pub trait EnginePool: Send + Sync {
    /// Engines registered and ready to take work.
    fn ready_engines(&self) -> impl Future<Output = Result<usize, ClusterError>> + Send;

    /// Load-balanced map over the engines. Results are returned in item order.
    fn map(
        &self,
        stage: Arc<dyn Stage>,
        items: Vec<WorkItem>,
        alloc: &Allocation,
    ) -> impl Future<Output = Result<Vec<Result<Vec<DataRecord>, StageError>>, ClusterError>> + Send;

    /// Tear the pool down.
    fn stop(self) -> impl Future<Output = Result<(), ClusterError>> + Send;
}

/// Errors from engine pools.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("failed to launch engines: {0}")]
    Launch(String),

    #[error("only {ready} of {wanted} engines ready")]
    NotReady { ready: usize, wanted: usize },

    #[error("scheduler unavailable: {0}")]
    Unavailable(String),

    #[error("engine pool error: {0}")]
    Pool(String),
}

impl Transient for ClusterError {
    fn is_transient(&self) -> bool {
        matches!(self, ClusterError::NotReady { .. } | ClusterError::Unavailable(_))
    }
}

impl From<ClusterError> for BackendError {
    fn from(e: ClusterError) -> Self {
        match e {
            ClusterError::NotReady { .. } | ClusterError::Unavailable(_) => {
                BackendError::Transient(e.to_string())
            }
            other => BackendError::Config(other.to_string()),
        }
    }
}

/// Scheduler placement shared by every pool this backend starts.
#[derive(Debug, Clone)]
pub struct ClusterPlacement {
    pub scheduler: SchedulerFamily,
    pub queue: String,
    pub extra: Vec<String>,
}

/// Dispatches each stage call to a freshly started engine pool.
pub struct ClusterBackend<L: EngineLauncher> {
    launcher: L,
    placement: ClusterPlacement,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl<L: EngineLauncher> ClusterBackend<L> {
    pub fn new(
        launcher: L,
        placement: ClusterPlacement,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            launcher,
            placement,
            retry,
            cancel,
        }
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    fn engine_spec(&self, stage: &str, alloc: &Allocation) -> EngineSpec {
        EngineSpec {
            stage: stage.to_string(),
            engines: alloc.workers.max(1),
            cores_per_engine: alloc.cores_per_worker,
            memory_per_engine: alloc.memory_per_worker,
            scheduler: self.placement.scheduler,
            queue: self.placement.queue.clone(),
            extra: self.placement.extra.clone(),
        }
    }

    async fn run_on_pool(
        &self,
        pool: &L::Pool,
        spec: &EngineSpec,
        stage: Arc<dyn Stage>,
        items: Vec<WorkItem>,
        alloc: &Allocation,
    ) -> Result<Vec<DataRecord>, BackendError> {
        retry_transient(&self.retry, &self.cancel, "wait for engines", || async {
            let ready = pool.ready_engines().await?;
            if ready >= spec.engines {
                Ok(ready)
            } else {
                Err(ClusterError::NotReady {
                    ready,
                    wanted: spec.engines,
                })
            }
        })
        .await?;
        tracing::info!(stage = spec.stage.as_str(), engines = spec.engines, "engines ready");

        let labels: Vec<String> = items.iter().map(WorkItem::label).collect();
        let outcomes = tokio::select! {
            _ = self.cancel.cancelled() => return Err(BackendError::Cancelled),
            outcomes = pool.map(Arc::clone(&stage), items, alloc) => outcomes?,
        };
        if outcomes.len() != labels.len() {
            return Err(BackendError::Join(format!(
                "engine pool returned {} results for {} items",
                outcomes.len(),
                labels.len()
            )));
        }

        let mut results = Vec::new();
        for (label, outcome) in labels.iter().zip(outcomes) {
            results.extend(settle(stage.name(), label, outcome)?);
        }
        Ok(results)
    }
}

impl<L: EngineLauncher> Backend for ClusterBackend<L> {
    fn kind(&self) -> BackendKind {
        BackendKind::Cluster
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
        let spec = self.engine_spec(stage.name(), alloc);
        tracing::info!(
            stage = spec.stage.as_str(),
            engines = spec.engines,
            cores = spec.cores_per_engine,
            queue = spec.queue.as_str(),
            "starting engine pool"
        );

        let pool = retry_transient(&self.retry, &self.cancel, "start engines", || {
            self.launcher.start(&spec)
        })
        .await?;

        let outcome = self.run_on_pool(&pool, &spec, stage, items, alloc).await;

        if let Err(e) = pool.stop().await {
            tracing::warn!(stage = spec.stage.as_str(), error = %e, "failed to stop engine pool");
        } else {
            tracing::debug!(stage = spec.stage.as_str(), "engine pool stopped");
        }
        outcome
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_allocation, EchoStage, FailingStage, FakeLauncher};

    fn backend(launcher: FakeLauncher) -> ClusterBackend<FakeLauncher> {
        ClusterBackend::new(
            launcher,
            ClusterPlacement {
                scheduler: SchedulerFamily::Slurm,
                queue: "batch".into(),
                extra: vec!["--time=2:00:00".into()],
            },
            RetryPolicy {
                max_attempts: 3,
                backoff_secs: 0,
            },
            CancellationToken::new(),
        )
    }

    fn items(n: usize) -> Vec<WorkItem> {
        (0..n)
            .map(|i| WorkItem::new("align", DataRecord::new(format!("s{i}"))))
            .collect()
    }

    #[tokio::test]
    async fn test_pool_sized_from_allocation_and_stopped() {
        let launcher = FakeLauncher::ready_after(0);
        let backend = backend(launcher.clone());
        let mut alloc = test_allocation(3);
        alloc.cores_per_worker = 8;

        let records = backend
            .map(Arc::new(EchoStage::new("align")), items(5), &alloc)
            .await
            .unwrap();
        assert_eq!(records.len(), 5);

        let specs = launcher.started();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].engines, 3);
        assert_eq!(specs[0].cores_per_engine, 8);
        assert_eq!(specs[0].queue, "batch");
        assert_eq!(launcher.stopped(), 1);
    }

    #[tokio::test]
    async fn test_slow_start_is_retried() {
        let launcher = FakeLauncher::ready_after(2);
        let records = backend(launcher.clone())
            .map(Arc::new(EchoStage::new("align")), items(2), &test_allocation(2))
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(launcher.stopped(), 1);
    }

    #[tokio::test]
    async fn test_never_ready_fails_and_still_stops_pool() {
        let launcher = FakeLauncher::ready_after(100);
        let err = backend(launcher.clone())
            .map(Arc::new(EchoStage::new("align")), items(2), &test_allocation(2))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Transient(_)));
        assert_eq!(launcher.stopped(), 1);
    }

    #[tokio::test]
    async fn test_item_failure_fails_stage_and_stops_pool() {
        let launcher = FakeLauncher::ready_after(0);
        let err = backend(launcher.clone())
            .map(Arc::new(FailingStage::new("align", &["s1"])), items(3), &test_allocation(2))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::ItemFailed { ref item, .. } if item == "s1"));
        assert_eq!(launcher.stopped(), 1);
    }
}
