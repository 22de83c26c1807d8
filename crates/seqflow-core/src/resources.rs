//! Resource allocation: worker counts and cores-per-worker for a stage.
//!
//! Given the total core budget, the stage's declared program resources and
//! the number of items, the allocator picks how many workers to run and how
//! many cores each one gets:
//!
//! 1. `cores_per_worker` is the maximum declared cores across the stage's
//!    programs (default 1).
//! 2. If `total_cores > cores_per_worker`, `workers = max(1, min(items,
//!    total_cores / cores_per_worker))`; otherwise one worker gets every core.
//! 3. With a declared memory need and a known free-memory figure (single
//!    machine only), workers shrink until `workers * memory <= free`.
//! 4. Zero items means zero workers.

use std::collections::BTreeSet;
use std::future::Future;

use seqflow_types::config::{EngineCount, SchedulerFamily};
use seqflow_types::record::DataRecord;
use seqflow_types::resources::{MemorySize, ResourceTable};
use serde::{Deserialize, Serialize};

/// Sizing decision for one stage dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub workers: usize,
    pub cores_per_worker: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_per_worker: Option<MemorySize>,
    /// JVM options for the stage's programs, passed through unchanged.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub jvm_opts: Vec<String>,
}

impl Allocation {
    /// Single worker, single core: the synchronous in-process shape.
    pub fn synchronous() -> Self {
        Self {
            workers: 1,
            cores_per_worker: 1,
            memory_per_worker: None,
            jvm_opts: Vec::new(),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.workers == 0
    }
}

/// Inputs to a single-machine or shared-budget allocation.
#[derive(Debug, Clone)]
pub struct AllocationRequest<'a> {
    pub programs: &'a [String],
    pub total_cores: u32,
    pub item_count: usize,
    /// Free memory on the executing machine; `None` skips memory shrinking.
    pub free_memory: Option<MemorySize>,
}

/// Computes allocations from the declared resource table.
#[derive(Debug, Clone, Default)]
pub struct ResourceAllocator {
    resources: ResourceTable,
}

impl ResourceAllocator {
    pub fn new(resources: ResourceTable) -> Self {
        Self { resources }
    }

    /// Largest declared core count across `programs` (default 1).
    pub fn cores_per_worker(&self, programs: &[String]) -> u32 {
        programs
            .iter()
            .filter_map(|p| self.resources.get(p))
            .map(|spec| spec.cores())
            .max()
            .unwrap_or(1)
    }

    /// Largest declared per-worker memory across `programs`.
    pub fn memory_per_worker(&self, programs: &[String]) -> Option<MemorySize> {
        programs
            .iter()
            .filter_map(|p| self.resources.get(p))
            .filter_map(|spec| spec.worker_memory())
            .max()
    }

    fn jvm_opts(&self, programs: &[String]) -> Vec<String> {
        programs
            .iter()
            .filter_map(|p| self.resources.get(p))
            .find(|spec| !spec.jvm_opts.is_empty())
            .map(|spec| spec.jvm_opts.clone())
            .unwrap_or_default()
    }

    /// Allocate workers from a shared core budget.
    pub fn allocate(&self, request: &AllocationRequest<'_>) -> Allocation {
        let total_cores = request.total_cores.max(1);
        let mut cores_per_worker = self.cores_per_worker(request.programs);
        let memory_per_worker = self.memory_per_worker(request.programs);
        let jvm_opts = self.jvm_opts(request.programs);

        if request.item_count == 0 {
            return Allocation {
                workers: 0,
                cores_per_worker,
                memory_per_worker,
                jvm_opts,
            };
        }

        let mut workers = if total_cores > cores_per_worker {
            let by_cores = (total_cores / cores_per_worker) as usize;
            by_cores.min(request.item_count).max(1)
        } else {
            cores_per_worker = total_cores;
            1
        };

        if let (Some(per_worker), Some(free)) = (memory_per_worker, request.free_memory) {
            if per_worker.as_mb() > 0 {
                let fit = (free.as_mb() / per_worker.as_mb()) as usize;
                let capped = workers.min(fit).max(1);
                if capped < workers {
                    tracing::debug!(
                        requested = workers,
                        capped,
                        memory_per_worker = %per_worker,
                        free_memory = %free,
                        "reducing workers to fit free memory"
                    );
                }
                workers = capped;
            }
        }

        Allocation {
            workers,
            cores_per_worker,
            memory_per_worker,
            jvm_opts,
        }
    }

    /// Allocate remote engines: one worker per engine, sized per stage.
    ///
    /// `cores_override` is the configured per-stage core count; without one
    /// the declared program cores are used. Memory is never shrunk here since
    /// engines run on separate machines.
    pub fn allocate_engines(
        &self,
        programs: &[String],
        engines: usize,
        cores_override: Option<u32>,
        item_count: usize,
    ) -> Allocation {
        let cores_per_worker = cores_override
            .unwrap_or_else(|| self.cores_per_worker(programs))
            .max(1);
        let workers = if item_count == 0 {
            0
        } else {
            engines.max(1).min(item_count)
        };
        Allocation {
            workers,
            cores_per_worker,
            memory_per_worker: self.memory_per_worker(programs),
            jvm_opts: self.jvm_opts(programs),
        }
    }
}

// ---------------------------------------------------------------------------
// Grid slot query
// ---------------------------------------------------------------------------

/// Queries a grid scheduler for free job slots.
pub trait SlotQuery: Send + Sync {
    fn free_slots(
        &self,
        scheduler: SchedulerFamily,
        queue: &str,
    ) -> impl Future<Output = Result<u32, String>> + Send;
}

/// Resolve a configured engine count into a concrete number.
///
/// `All` uses free grid slots minus one; if the query fails it falls back to
/// one engine per distinct sample name.
pub async fn resolve_engine_count<Q: SlotQuery>(
    count: EngineCount,
    query: &Q,
    scheduler: SchedulerFamily,
    queue: &str,
    records: &[DataRecord],
) -> usize {
    match count {
        EngineCount::Count(n) => n as usize,
        EngineCount::All => match query.free_slots(scheduler, queue).await {
            Ok(slots) => {
                let engines = slots.saturating_sub(1).max(1) as usize;
                tracing::info!(slots, engines, queue, "using all free grid slots");
                engines
            }
            Err(e) => {
                let samples: BTreeSet<&str> = records.iter().map(|r| r.name.as_str()).collect();
                let engines = samples.len().max(1);
                tracing::warn!(
                    error = e.as_str(),
                    engines,
                    "grid slot query failed, using one engine per sample"
                );
                engines
            }
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use seqflow_types::resources::ResourceSpec;

    fn table(entries: &[(&str, u32, Option<&str>)]) -> ResourceTable {
        entries
            .iter()
            .map(|(name, cores, memory)| {
                (
                    name.to_string(),
                    ResourceSpec {
                        cores: Some(*cores),
                        memory: memory.map(|m| m.parse().unwrap()),
                        ..ResourceSpec::default()
                    },
                )
            })
            .collect()
    }

    fn programs(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_scenario_six_chunks_on_four_cores() {
        let allocator = ResourceAllocator::new(table(&[("samtools", 1, None)]));
        let progs = programs(&["samtools"]);
        let alloc = allocator.allocate(&AllocationRequest {
            programs: &progs,
            total_cores: 4,
            item_count: 6,
            free_memory: None,
        });
        assert_eq!(alloc.workers, 4);
        assert_eq!(alloc.cores_per_worker, 1);
    }

    #[test]
    fn test_uses_max_cores_across_programs() {
        let allocator = ResourceAllocator::new(table(&[("bwa", 8, None), ("samtools", 2, None)]));
        let progs = programs(&["bwa", "samtools"]);
        let alloc = allocator.allocate(&AllocationRequest {
            programs: &progs,
            total_cores: 32,
            item_count: 10,
            free_memory: None,
        });
        assert_eq!(alloc.cores_per_worker, 8);
        assert_eq!(alloc.workers, 4);
    }

    #[test]
    fn test_workers_capped_by_item_count() {
        let allocator = ResourceAllocator::default();
        let alloc = allocator.allocate(&AllocationRequest {
            programs: &[],
            total_cores: 16,
            item_count: 3,
            free_memory: None,
        });
        assert_eq!(alloc.workers, 3);
        assert_eq!(alloc.cores_per_worker, 1);
    }

    #[test]
    fn test_budget_below_program_cores_gives_one_worker_all_cores() {
        let allocator = ResourceAllocator::new(table(&[("bwa", 16, None)]));
        let progs = programs(&["bwa"]);
        let alloc = allocator.allocate(&AllocationRequest {
            programs: &progs,
            total_cores: 6,
            item_count: 5,
            free_memory: None,
        });
        assert_eq!(alloc.workers, 1);
        assert_eq!(alloc.cores_per_worker, 6);
    }

    #[test]
    fn test_zero_items_zero_workers() {
        let allocator = ResourceAllocator::default();
        let alloc = allocator.allocate(&AllocationRequest {
            programs: &[],
            total_cores: 8,
            item_count: 0,
            free_memory: None,
        });
        assert_eq!(alloc.workers, 0);
        assert!(alloc.is_noop());
    }

    #[test]
    fn test_memory_shrinks_workers() {
        let allocator = ResourceAllocator::new(table(&[("gatk", 1, Some("4g"))]));
        let progs = programs(&["gatk"]);
        let alloc = allocator.allocate(&AllocationRequest {
            programs: &progs,
            total_cores: 16,
            item_count: 16,
            free_memory: Some(MemorySize::from_gb(10)),
        });
        assert_eq!(alloc.workers, 2);
        assert_eq!(alloc.memory_per_worker, Some(MemorySize::from_gb(4)));
    }

    #[test]
    fn test_memory_never_drops_below_one_worker() {
        let allocator = ResourceAllocator::new(table(&[("gatk", 1, Some("64g"))]));
        let progs = programs(&["gatk"]);
        let alloc = allocator.allocate(&AllocationRequest {
            programs: &progs,
            total_cores: 8,
            item_count: 8,
            free_memory: Some(MemorySize::from_gb(2)),
        });
        assert_eq!(alloc.workers, 1);
    }

    #[test]
    fn test_engines_sized_per_stage() {
        let allocator = ResourceAllocator::new(table(&[("bwa", 8, Some("2g"))]));
        let progs = programs(&["bwa"]);
        let alloc = allocator.allocate_engines(&progs, 10, None, 4);
        assert_eq!(alloc.workers, 4);
        assert_eq!(alloc.cores_per_worker, 8);

        let overridden = allocator.allocate_engines(&progs, 10, Some(16), 40);
        assert_eq!(overridden.workers, 10);
        assert_eq!(overridden.cores_per_worker, 16);
    }

    struct FixedSlots(Result<u32, String>);

    impl SlotQuery for FixedSlots {
        async fn free_slots(&self, _scheduler: SchedulerFamily, _queue: &str) -> Result<u32, String> {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn test_all_engines_uses_slots_minus_one() {
        let engines = resolve_engine_count(
            EngineCount::All,
            &FixedSlots(Ok(48)),
            SchedulerFamily::Sge,
            "all.q",
            &[],
        )
        .await;
        assert_eq!(engines, 47);
    }

    #[tokio::test]
    async fn test_all_engines_falls_back_to_distinct_samples() {
        let records = vec![
            DataRecord::new("a"),
            DataRecord::new("b"),
            DataRecord::new("a"),
        ];
        let engines = resolve_engine_count(
            EngineCount::All,
            &FixedSlots(Err("qstat not found".to_string())),
            SchedulerFamily::Sge,
            "all.q",
            &records,
        )
        .await;
        assert_eq!(engines, 2);
    }

    #[tokio::test]
    async fn test_explicit_count_skips_query() {
        let engines = resolve_engine_count(
            EngineCount::Count(5),
            &FixedSlots(Err("unused".to_string())),
            SchedulerFamily::Slurm,
            "long",
            &[],
        )
        .await;
        assert_eq!(engines, 5);
    }
}
