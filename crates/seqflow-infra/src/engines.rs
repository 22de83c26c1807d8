//! In-process engine pools.
//!
//! Each engine is a tokio task that registers itself as ready and then pulls
//! tasks from a queue shared by the pool, which gives load balancing for
//! free. Scheduler placement is recorded in the logs only; the engines run
//! on the local host.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use seqflow_core::backend::{ClusterError, EngineLauncher, EnginePool, EngineSpec};
use seqflow_core::resources::Allocation;
use seqflow_core::stage::Stage;
use seqflow_types::error::StageError;
use seqflow_types::record::{DataRecord, WorkItem};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type TaskResult = Result<Vec<DataRecord>, StageError>;

struct EngineTask {
    stage: Arc<dyn Stage>,
    item: WorkItem,
    alloc: Allocation,
    reply: oneshot::Sender<TaskResult>,
}

/// Launches pools of in-process engines.
#[derive(Debug, Clone, Default)]
pub struct InProcessLauncher {
    /// Delay before each engine reports ready, simulating scheduler latency.
    pub startup_delay: Duration,
}

impl InProcessLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay = delay;
        self
    }
}

impl EngineLauncher for InProcessLauncher {
    type Pool = InProcessPool;

    async fn start(&self, spec: &EngineSpec) -> Result<InProcessPool, ClusterError> {
        if spec.engines == 0 {
            return Err(ClusterError::Launch("engine count must be positive".to_string()));
        }
        tracing::info!(
            stage = spec.stage.as_str(),
            engines = spec.engines,
            cores = spec.cores_per_engine,
            memory = ?spec.memory_per_engine.map(|m| m.to_string()),
            scheduler = ?spec.scheduler,
            queue = spec.queue.as_str(),
            extra = ?spec.extra,
            "launching engine pool"
        );

        let (sender, receiver) = mpsc::unbounded_channel();
        let receiver = Arc::new(Mutex::new(receiver));
        let ready = Arc::new(AtomicUsize::new(0));
        let stop = CancellationToken::new();

        let engines = (0..spec.engines)
            .map(|engine| {
                tokio::spawn(run_engine(
                    engine,
                    self.startup_delay,
                    Arc::clone(&ready),
                    Arc::clone(&receiver),
                    stop.clone(),
                ))
            })
            .collect();

        Ok(InProcessPool {
            sender,
            ready,
            engines,
            stop,
        })
    }
}

/// A running pool started by `InProcessLauncher`.
pub struct InProcessPool {
    sender: mpsc::UnboundedSender<EngineTask>,
    ready: Arc<AtomicUsize>,
    engines: Vec<JoinHandle<()>>,
    stop: CancellationToken,
}

impl EnginePool for InProcessPool {
    async fn ready_engines(&self) -> Result<usize, ClusterError> {
        Ok(self.ready.load(Ordering::SeqCst))
    }

    async fn map(
        &self,
        stage: Arc<dyn Stage>,
        items: Vec<WorkItem>,
        alloc: &Allocation,
    ) -> Result<Vec<TaskResult>, ClusterError> {
        let mut replies = Vec::with_capacity(items.len());
        for item in items {
            let (reply, receiver) = oneshot::channel();
            let task = EngineTask {
                stage: Arc::clone(&stage),
                item,
                alloc: alloc.clone(),
                reply,
            };
            self.sender
                .send(task)
                .map_err(|_| ClusterError::Pool("engine queue is closed".to_string()))?;
            replies.push(receiver);
        }

        let mut results = Vec::with_capacity(replies.len());
        for receiver in replies {
            let result = receiver
                .await
                .map_err(|_| ClusterError::Pool("engine exited before replying".to_string()))?;
            results.push(result);
        }
        Ok(results)
    }

    async fn stop(self) -> Result<(), ClusterError> {
        self.stop.cancel();
        drop(self.sender);
        let mut panicked = 0;
        for engine in self.engines {
            if engine.await.is_err() {
                panicked += 1;
            }
        }
        if panicked > 0 {
            return Err(ClusterError::Pool(format!("{panicked} engines panicked")));
        }
        Ok(())
    }
}

async fn run_engine(
    engine: usize,
    startup_delay: Duration,
    ready: Arc<AtomicUsize>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<EngineTask>>>,
    stop: CancellationToken,
) {
    tokio::select! {
        _ = stop.cancelled() => return,
        _ = tokio::time::sleep(startup_delay) => {}
    }
    ready.fetch_add(1, Ordering::SeqCst);
    tracing::trace!(engine, "engine ready");

    loop {
        let next = {
            let mut rx = receiver.lock().await;
            tokio::select! {
                _ = stop.cancelled() => None,
                task = rx.recv() => task,
            }
        };
        let Some(task) = next else { break };

        let result = tokio::select! {
            _ = stop.cancelled() => break,
            result = task.stage.run(task.item, &task.alloc) => result,
        };
        // The map call may have been abandoned.
        let _ = task.reply.send(result);
    }
    ready.fetch_sub(1, Ordering::SeqCst);
    tracing::trace!(engine, "engine stopped");
}
