//! Stage-by-stage pipeline driver.
//!
//! For each stage call the runner:
//!
//! 1. Takes the next checkpoint key.
//! 2. If the checkpoint exists, restores every record locally through
//!    `Stage::restore` and dispatches nothing.
//! 3. Otherwise plans work items (splitting by region or size, or grouping by
//!    batch), allocates workers and maps the stage over the backend.
//! 4. Combines chunk manifests or ungroups batch results.
//! 5. Writes the checkpoint, only after everything above succeeded.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use seqflow_types::config::{SplitConfig, SplitStrategy};
use seqflow_types::error::StageError;
use seqflow_types::manifest::ChunkManifest;
use seqflow_types::record::{DataRecord, WorkItem};
use seqflow_types::resources::MemorySize;
use serde::Serialize;
use tracing::Instrument;

use crate::backend::{Backend, BackendError};
use crate::checkpoint::{CheckpointError, CheckpointKey, CheckpointManager, CheckpointStore};
use crate::group::{ungroup, BatchGrouper, BatchPlan, GroupError};
use crate::resources::{Allocation, AllocationRequest, ResourceAllocator};
use crate::split::{Combiner, SplitError, SplitOutcome, Splitter};
use crate::stage::{RegistryError, Stage, StageRegistry};
use crate::tools::FormatTools;

/// How worker counts are derived for each stage.
#[derive(Debug, Clone)]
pub enum AllocationMode {
    /// One core budget shared by all workers (local pool, broker workers).
    SharedCores {
        total_cores: u32,
        /// Free memory of the executing machine, when it is this one.
        free_memory: Option<MemorySize>,
    },
    /// A fixed number of remote engines, optionally sized per stage.
    Engines {
        engines: usize,
        stage_cores: BTreeMap<String, u32>,
    },
}

/// What happened during one stage call.
#[derive(Debug, Clone, Serialize)]
pub struct StageOutcome {
    pub stage: String,
    pub sequence: u32,
    /// Restored from a checkpoint instead of dispatched.
    pub restored: bool,
    /// Work items dispatched (zero when restored).
    pub items: usize,
    pub allocation: Option<Allocation>,
    #[serde(skip)]
    pub records: Vec<DataRecord>,
    pub results: usize,
    #[serde(with = "duration_secs")]
    pub elapsed: Duration,
}

mod duration_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}

/// Records returned by a full run plus per-stage outcomes.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub stages: Vec<StageOutcome>,
    pub records: Vec<DataRecord>,
}

/// Per-sample bookkeeping for split stages, in input order.
enum SplitEntry {
    Done(DataRecord),
    Pending(DataRecord, ChunkManifest),
}

struct StagePlan {
    items: Vec<WorkItem>,
    splits: Option<Vec<SplitEntry>>,
    batch: Option<BatchPlan>,
}

/// Drives stages through a backend with checkpointing.
pub struct PipelineRunner<B: Backend, C: CheckpointStore, T: FormatTools> {
    backend: B,
    checkpoints: CheckpointManager<C>,
    registry: StageRegistry,
    allocator: ResourceAllocator,
    mode: AllocationMode,
    tools: Arc<T>,
    split: SplitConfig,
    work_dir: PathBuf,
}

impl<B: Backend, C: CheckpointStore, T: FormatTools> PipelineRunner<B, C, T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: B,
        checkpoints: CheckpointManager<C>,
        registry: StageRegistry,
        allocator: ResourceAllocator,
        mode: AllocationMode,
        tools: Arc<T>,
        split: SplitConfig,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            backend,
            checkpoints,
            registry,
            allocator,
            mode,
            tools,
            split,
            work_dir: work_dir.into(),
        }
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Run `stages` in order, feeding each stage's records to the next.
    pub async fn run(
        &mut self,
        stages: &[String],
        records: Vec<DataRecord>,
    ) -> Result<RunReport, PipelineError> {
        let mut records = records;
        let mut outcomes = Vec::with_capacity(stages.len());
        for name in stages {
            let outcome = self.run_stage(name, records).await?;
            records = outcome.records.clone();
            outcomes.push(outcome);
        }
        Ok(RunReport {
            stages: outcomes,
            records,
        })
    }

    /// Run one stage call over `records`.
    pub async fn run_stage(
        &mut self,
        name: &str,
        records: Vec<DataRecord>,
    ) -> Result<StageOutcome, PipelineError> {
        let stage = self.registry.resolve(name)?;
        let key = self.checkpoints.next_key(name);
        let span = tracing::info_span!("stage", name, seq = key.sequence);
        self.execute(stage, key, records).instrument(span).await
    }

    async fn execute(
        &self,
        stage: Arc<dyn Stage>,
        key: CheckpointKey,
        records: Vec<DataRecord>,
    ) -> Result<StageOutcome, PipelineError> {
        let started = Instant::now();

        if self.checkpoints.is_done(&key).await? {
            let records = self.restore(stage.as_ref(), records).await?;
            tracing::info!(results = records.len(), "restored from checkpoint");
            return Ok(StageOutcome {
                stage: key.stage,
                sequence: key.sequence,
                restored: true,
                items: 0,
                allocation: None,
                results: records.len(),
                records,
                elapsed: started.elapsed(),
            });
        }

        let plan = self.plan(stage.as_ref(), records).await?;
        let item_count = plan.items.len();
        let alloc = self.allocate(stage.as_ref(), item_count);
        tracing::info!(
            items = item_count,
            workers = alloc.workers,
            cores_per_worker = alloc.cores_per_worker,
            "dispatching stage"
        );

        let results = self
            .backend
            .map(Arc::clone(&stage), plan.items, &alloc)
            .await?;

        let records = if let Some(entries) = plan.splits {
            self.combine(stage.as_ref(), entries, &alloc).await?
        } else if let Some(batch) = plan.batch {
            let role = output_role(stage.as_ref())?;
            ungroup(self.tools.as_ref(), &batch, role, results).await?
        } else {
            results
        };

        self.checkpoints.mark_done(&key).await?;
        tracing::info!(
            results = records.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "stage complete"
        );

        Ok(StageOutcome {
            stage: key.stage,
            sequence: key.sequence,
            restored: false,
            items: item_count,
            allocation: Some(alloc),
            results: records.len(),
            records,
            elapsed: started.elapsed(),
        })
    }

    /// Where `record`'s output for `stage` lives.
    ///
    /// Regional records carry the region in the file name, so one sample's
    /// records for different regions never share an output.
    pub fn target_for(&self, stage: &dyn Stage, record: &DataRecord) -> Option<PathBuf> {
        stage.output().map(|output| {
            let stem = match &record.region {
                Some(region) => format!("{}-{}", record.name, region.chunk_key()),
                None => record.name.clone(),
            };
            self.work_dir
                .join(stage.name())
                .join(format!("{stem}{}", output.extension))
        })
    }

    fn whole_item(&self, stage: &dyn Stage, record: DataRecord) -> WorkItem {
        let target = self.target_for(stage, &record);
        let region = record.region.clone();
        WorkItem {
            stage: stage.name().to_string(),
            record,
            region,
            target,
        }
    }

    async fn restore(
        &self,
        stage: &dyn Stage,
        records: Vec<DataRecord>,
    ) -> Result<Vec<DataRecord>, PipelineError> {
        let mut restored = Vec::with_capacity(records.len());
        for record in records {
            let item = self.whole_item(stage, record);
            let label = item.label();
            match stage.restore(item).await {
                Ok(records) => restored.extend(records),
                Err(e) if e.is_empty_input() => {}
                Err(source) => {
                    return Err(PipelineError::Restore {
                        stage: stage.name().to_string(),
                        item: label,
                        source,
                    });
                }
            }
        }
        Ok(restored)
    }

    async fn plan(&self, stage: &dyn Stage, records: Vec<DataRecord>) -> Result<StagePlan, PipelineError> {
        let strategy = stage.split();
        if strategy == SplitStrategy::None {
            let items = records.into_iter().map(|r| self.whole_item(stage, r)).collect();
            return Ok(StagePlan {
                items,
                splits: None,
                batch: None,
            });
        }

        let role = output_role(stage)?;
        if strategy == SplitStrategy::Batch {
            let items: Vec<WorkItem> = records.into_iter().map(|r| self.whole_item(stage, r)).collect();
            let batch = BatchGrouper::group(items, stage.input_role());
            return Ok(StagePlan {
                items: batch.items.clone(),
                splits: None,
                batch: Some(batch),
            });
        }

        let splitter = Splitter::new(Arc::clone(&self.tools), self.split.clone());
        let sort_cores = self.allocator.cores_per_worker(stage.programs());
        let mut items = Vec::new();
        let mut entries = Vec::with_capacity(records.len());
        for record in records {
            let Some(parent) = self.target_for(stage, &record) else {
                continue;
            };
            let outcome = if strategy == SplitStrategy::Chromosome {
                splitter
                    .by_chromosome(stage.name(), &record, stage.input_role(), &parent)
                    .await?
            } else {
                splitter
                    .by_size(stage.name(), &record, stage.input_role(), &parent, sort_cores)
                    .await?
            };
            match outcome {
                SplitOutcome::AlreadyCombined { parent } => {
                    let mut done = record;
                    done.set_file(role, parent);
                    entries.push(SplitEntry::Done(done));
                }
                SplitOutcome::Chunks(plan) => {
                    items.extend(plan.items);
                    entries.push(SplitEntry::Pending(record, plan.manifest));
                }
            }
        }
        Ok(StagePlan {
            items,
            splits: Some(entries),
            batch: None,
        })
    }

    async fn combine(
        &self,
        stage: &dyn Stage,
        entries: Vec<SplitEntry>,
        alloc: &Allocation,
    ) -> Result<Vec<DataRecord>, PipelineError> {
        let role = output_role(stage)?;
        let combiner = Combiner::new(Arc::clone(&self.tools), self.split.clone());
        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry {
                SplitEntry::Done(record) => records.push(record),
                SplitEntry::Pending(mut record, manifest) => {
                    let parent = combiner.combine(&manifest, alloc.cores_per_worker).await?;
                    record.set_file(role, parent);
                    records.push(record);
                }
            }
        }
        Ok(records)
    }

    fn allocate(&self, stage: &dyn Stage, item_count: usize) -> Allocation {
        match &self.mode {
            AllocationMode::SharedCores {
                total_cores,
                free_memory,
            } => self.allocator.allocate(&AllocationRequest {
                programs: stage.programs(),
                total_cores: *total_cores,
                item_count,
                free_memory: *free_memory,
            }),
            AllocationMode::Engines {
                engines,
                stage_cores,
            } => self.allocator.allocate_engines(
                stage.programs(),
                *engines,
                stage_cores.get(stage.name()).copied(),
                item_count,
            ),
        }
    }
}

fn output_role(stage: &dyn Stage) -> Result<&str, PipelineError> {
    stage
        .output()
        .map(|o| o.role.as_str())
        .ok_or_else(|| PipelineError::NoOutput(stage.name().to_string()))
}

/// Errors that abort a run.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Split(#[from] SplitError),

    #[error(transparent)]
    Group(#[from] GroupError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("stage '{stage}' could not restore {item}: {source}")]
    Restore {
        stage: String,
        item: String,
        #[source]
        source: StageError,
    },

    #[error("stage '{0}' splits or groups its input but declares no output")]
    NoOutput(String),
}

impl PipelineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Backend(BackendError::Cancelled))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
