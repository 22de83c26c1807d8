//! Stage abstraction and the explicit stage registry.
//!
//! A stage wraps one external analysis step: it receives a `WorkItem`, runs
//! its tool and returns zero or more updated `DataRecord`s. Stages are looked
//! up by stable name through a `StageRegistry` that is constructed at startup
//! and handed to whichever backend dispatches work, so every backend resolves
//! a name to the same implementation.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use seqflow_types::config::SplitStrategy;
use seqflow_types::error::StageError;
use seqflow_types::record::{DataRecord, WorkItem};

use crate::resources::Allocation;

/// Boxed future returned by stage methods (object-safe for `dyn Stage`).
pub type StageFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<DataRecord>, StageError>> + Send + 'a>>;

/// Where a stage writes its per-item output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSpec {
    /// File role the output is attached under, e.g. `"work_bam"`.
    pub role: String,
    /// Extension including the dot, e.g. `".bam"` or `".vcf.gz"`.
    pub extension: String,
}

impl OutputSpec {
    pub fn new(role: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            extension: extension.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Stage trait
// ---------------------------------------------------------------------------

/// A named pipeline step.
///
/// Uses boxed futures rather than RPITIT so that stages can live in the
/// registry as `Arc<dyn Stage>`.
pub trait Stage: Send + Sync {
    /// Stable registry name.
    fn name(&self) -> &str;

    /// External programs this stage runs; keys into the resource table.
    fn programs(&self) -> &[String] {
        &[]
    }

    /// How per-sample input is partitioned before dispatch.
    fn split(&self) -> SplitStrategy {
        SplitStrategy::None
    }

    /// Input file role consumed by splitting.
    fn input_role(&self) -> &str {
        "input"
    }

    /// Output written per item, if the stage produces a file.
    fn output(&self) -> Option<&OutputSpec> {
        None
    }

    /// Process one work item.
    fn run<'a>(&'a self, item: WorkItem, resources: &'a Allocation) -> StageFuture<'a>;

    /// Re-derive this item's result from already-materialized files.
    ///
    /// Called instead of `run` when the stage's checkpoint exists. The default
    /// re-attaches the item's target output, which must exist.
    fn restore<'a>(&'a self, item: WorkItem) -> StageFuture<'a> {
        Box::pin(async move {
            let mut record = item.record;
            if let (Some(output), Some(target)) = (self.output(), item.target) {
                if !tokio::fs::try_exists(&target).await.unwrap_or(false) {
                    return Err(StageError::MissingPrerequisite(format!(
                        "checkpointed output {} is missing",
                        target.display()
                    )));
                }
                record.set_file(output.role.clone(), target);
            }
            Ok(vec![record])
        })
    }
}

// ---------------------------------------------------------------------------
// StageRegistry
// ---------------------------------------------------------------------------

/// Name -> stage lookup shared by all backends.
#[derive(Clone, Default)]
pub struct StageRegistry {
    stages: HashMap<String, Arc<dyn Stage>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stage under its own name.
    pub fn register(&mut self, stage: impl Stage + 'static) -> Result<(), RegistryError> {
        self.register_arc(Arc::new(stage))
    }

    /// Register an already shared stage.
    pub fn register_arc(&mut self, stage: Arc<dyn Stage>) -> Result<(), RegistryError> {
        let name = stage.name().to_string();
        if self.stages.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        tracing::debug!(stage = name.as_str(), "registered stage");
        self.stages.insert(name, stage);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Stage>> {
        self.stages.get(name).cloned()
    }

    /// Look up a stage, failing with `UnknownStage` when absent.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Stage>, RegistryError> {
        self.get(name)
            .ok_or_else(|| RegistryError::UnknownStage(name.to_string()))
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.stages.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl std::fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRegistry")
            .field("stages", &self.names())
            .finish()
    }
}

/// Errors from registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("stage '{0}' is already registered")]
    Duplicate(String),

    #[error("unknown stage '{0}'")]
    UnknownStage(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
