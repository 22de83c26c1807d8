//! Per-sample records and the dispatchable work units built from them.
//!
//! A `DataRecord` is the mutable per-sample state threaded through every
//! stage. A `WorkItem` pairs a record with the stage that should process it,
//! an optional genomic region and the output path the stage should produce.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// DataRecord
// ---------------------------------------------------------------------------

/// Per-sample state passed into and returned from every stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRecord {
    /// Sample name. Unique within a run except for combined batch records.
    pub name: String,
    /// Batch identifier for joint processing (e.g. a family or cohort).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<String>,
    /// External program responsible for this record's current stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,
    /// Region this record is restricted to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<Region>,
    /// Named file paths (role -> path), e.g. `"work_bam"` or `"vcf"`.
    #[serde(default)]
    pub files: BTreeMap<String, PathBuf>,
    /// Per-sample algorithm configuration.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub config: Map<String, Value>,
    /// Free-form metadata carried between stages.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    /// Contributing samples, present only on combined batch records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<Vec<GroupMember>>,
}

impl DataRecord {
    /// Create a record for a sample with no files or configuration.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            batch: None,
            program: None,
            region: None,
            files: BTreeMap::new(),
            config: Map::new(),
            metadata: Map::new(),
            group: None,
        }
    }

    /// Builder-style helper that attaches a file under `role`.
    pub fn with_file(mut self, role: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.files.insert(role.into(), path.into());
        self
    }

    /// Builder-style helper that sets the batch identifier.
    pub fn with_batch(mut self, batch: impl Into<String>) -> Self {
        self.batch = Some(batch.into());
        self
    }

    /// Builder-style helper that sets the responsible program.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = Some(program.into());
        self
    }

    /// Look up a file by role.
    pub fn file(&self, role: &str) -> Option<&Path> {
        self.files.get(role).map(PathBuf::as_path)
    }

    /// Attach or replace a file under `role`.
    pub fn set_file(&mut self, role: impl Into<String>, path: impl Into<PathBuf>) {
        self.files.insert(role.into(), path.into());
    }

    /// Whether this record is a combined batch record.
    pub fn is_grouped(&self) -> bool {
        self.group.is_some()
    }
}

/// One original contributor to a combined batch record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    /// Original sample name.
    pub sample: String,
    /// Where this sample's share of the combined output is expected.
    pub expected_output: PathBuf,
}

// ---------------------------------------------------------------------------
// Region
// ---------------------------------------------------------------------------

/// A genomic region used to partition per-sample work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Region {
    /// A whole reference sequence (chromosome or contig).
    Contig { name: String },
    /// A half-open interval on a reference sequence.
    Span { name: String, start: u64, end: u64 },
    /// Reads without a mapped position.
    Unmapped,
}

impl Region {
    /// Whole-contig region.
    pub fn contig(name: impl Into<String>) -> Self {
        Region::Contig { name: name.into() }
    }

    /// Filesystem-safe key used in chunk file names.
    pub fn chunk_key(&self) -> String {
        match self {
            Region::Contig { name } => sanitize(name),
            Region::Span { name, start, end } => format!("{}_{start}_{end}", sanitize(name)),
            Region::Unmapped => "unmapped".to_string(),
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Region::Contig { name } => write!(f, "{name}"),
            Region::Span { name, start, end } => write!(f, "{name}:{start}-{end}"),
            Region::Unmapped => write!(f, "unmapped"),
        }
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// WorkItem
// ---------------------------------------------------------------------------

/// One dispatchable unit of work for a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Registered stage name.
    pub stage: String,
    /// The record to process.
    pub record: DataRecord,
    /// Region restriction for chunked work.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<Region>,
    /// Output path the stage should produce for this item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<PathBuf>,
}

impl WorkItem {
    /// A whole-record work item with no region or explicit target.
    pub fn new(stage: impl Into<String>, record: DataRecord) -> Self {
        Self {
            stage: stage.into(),
            record,
            region: None,
            target: None,
        }
    }

    /// Short human-readable label for logs and error messages.
    pub fn label(&self) -> String {
        match &self.region {
            Some(region) => format!("{}@{}", self.record.name, region),
            None => self.record.name.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
