//! System configuration and run description types.
//!
//! `SystemConfig` is the top-level `seqflow.toml`: working directory,
//! declared program resources, backend selection and tuning knobs.
//! `RunDescription` lists the samples and stages of one run.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ResourceError;
use crate::record::DataRecord;
use crate::resources::ResourceTable;

// ---------------------------------------------------------------------------
// SystemConfig
// ---------------------------------------------------------------------------

/// Top-level configuration. All sections have defaults.
#[derive(Debug, Deserialize)]
pub struct SystemConfig {
    /// Shared working directory for outputs and checkpoints.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Declared resources per external program.
    #[serde(default)]
    pub resources: ResourceTable,

    #[serde(default)]
    pub backend: BackendConfig,

    /// Retry policy for transient backend errors.
    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub split: SplitConfig,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("work")
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            resources: ResourceTable::new(),
            backend: BackendConfig::default(),
            retry: RetryPolicy::default(),
            split: SplitConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Backend selection
// ---------------------------------------------------------------------------

/// Which execution substrate dispatches work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Local,
    Queue,
    Cluster,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::Queue => "queue",
            BackendKind::Cluster => "cluster",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(BackendKind::Local),
            "queue" | "broker" => Ok(BackendKind::Queue),
            "cluster" | "ipython" => Ok(BackendKind::Cluster),
            other => Err(format!("unknown backend '{other}'")),
        }
    }
}

/// Backend configuration section.
#[derive(Debug, Default, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,
    /// Total core budget. `None` means all cores on this machine.
    #[serde(default)]
    pub cores: Option<u32>,
    #[serde(default)]
    pub broker: Option<BrokerConfig>,
    #[serde(default)]
    pub cluster: Option<ClusterConfig>,
}

/// Message-broker connection and worker settings.
#[derive(Debug, Deserialize)]
pub struct BrokerConfig {
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    #[serde(default = "default_broker_user")]
    pub user: String,
    #[serde(default, deserialize_with = "deserialize_secret")]
    pub password: Option<SecretString>,
    #[serde(default = "default_vhost")]
    pub vhost: String,
    /// Concurrent jobs per worker machine.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Run configuration every worker loads identically.
    #[serde(default)]
    pub run_config: Option<PathBuf>,
    /// Seconds between job-set status polls.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_broker_port() -> u16 {
    5672
}

fn default_broker_user() -> String {
    "guest".to_string()
}

fn default_vhost() -> String {
    "/".to_string()
}

fn default_concurrency() -> usize {
    1
}

fn default_poll_interval() -> u64 {
    2
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.map(SecretString::from))
}

impl BrokerConfig {
    /// Poll interval as a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

/// Cluster-engine pool settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    pub scheduler: SchedulerFamily,
    pub queue: String,
    /// Number of engines to request, or `"all"` for free grid slots minus one.
    #[serde(default)]
    pub num_jobs: EngineCount,
    /// Per-stage core counts overriding the allocator.
    #[serde(default)]
    pub stage_cores: BTreeMap<String, u32>,
    /// Extra scheduler resource flags passed through on submission.
    #[serde(default)]
    pub extra: Vec<String>,
}

/// Grid scheduler families a cluster pool can be launched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerFamily {
    Sge,
    Slurm,
    Lsf,
    Torque,
    Pbspro,
}

impl FromStr for SchedulerFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sge" => Ok(SchedulerFamily::Sge),
            "slurm" => Ok(SchedulerFamily::Slurm),
            "lsf" => Ok(SchedulerFamily::Lsf),
            "torque" => Ok(SchedulerFamily::Torque),
            "pbspro" => Ok(SchedulerFamily::Pbspro),
            other => Err(format!("unknown scheduler '{other}'")),
        }
    }
}

/// Requested engine count for a cluster pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineCount {
    Count(u32),
    /// Use every free grid slot except one.
    All,
}

impl Default for EngineCount {
    fn default() -> Self {
        EngineCount::Count(1)
    }
}

impl FromStr for EngineCount {
    type Err = ResourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("all") {
            return Ok(EngineCount::All);
        }
        match s.trim().parse::<u32>() {
            Ok(n) if n > 0 => Ok(EngineCount::Count(n)),
            _ => Err(ResourceError::InvalidEngineCount(s.to_string())),
        }
    }
}

impl<'de> Deserialize<'de> for EngineCount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u32),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(0) => Err(serde::de::Error::custom("num_jobs must be at least 1")),
            Raw::Number(n) => Ok(EngineCount::Count(n)),
            Raw::Text(text) => text.parse().map_err(serde::de::Error::custom),
        }
    }
}

// ---------------------------------------------------------------------------
// Tuning sections
// ---------------------------------------------------------------------------

/// Fixed-backoff retry policy for transient backend errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_secs() -> u64 {
    5
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_secs: default_backoff_secs(),
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }
}

/// What happens to partial chunk files after a successful combine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkCleanup {
    Keep,
    Remove,
    /// Replace each partial file with a one-line text marker.
    #[default]
    Marker,
}

/// Splitting and combining knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitConfig {
    /// Reads per chunk for by-size splitting.
    #[serde(default = "default_reads_per_chunk")]
    pub reads_per_chunk: u64,
    /// Add the synthetic unmapped region to by-chromosome splits.
    #[serde(default = "default_true")]
    pub include_unmapped: bool,
    #[serde(default)]
    pub cleanup: ChunkCleanup,
    /// Header line prefix kept only from the first chunk on text concat.
    #[serde(default = "default_header_prefix")]
    pub header_prefix: String,
}

fn default_reads_per_chunk() -> u64 {
    5_000_000
}

fn default_true() -> bool {
    true
}

fn default_header_prefix() -> String {
    "#".to_string()
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            reads_per_chunk: default_reads_per_chunk(),
            include_unmapped: true,
            cleanup: ChunkCleanup::default(),
            header_prefix: default_header_prefix(),
        }
    }
}

// ---------------------------------------------------------------------------
// Run description
// ---------------------------------------------------------------------------

/// How a stage partitions its per-sample input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitStrategy {
    #[default]
    None,
    /// One chunk per reference sequence, plus unmapped.
    Chromosome,
    /// Fixed read-count chunks of raw sequence data.
    Size,
    /// Joint processing of records sharing batch, region and program.
    Batch,
}

/// A command-template stage declared in the run description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDefinition {
    pub name: String,
    /// Shell command template, e.g. `"bwa mem -t {cores} ref.fa {input:fastq1} > {output}"`.
    pub command: String,
    /// External programs the command runs (used for resource allocation).
    #[serde(default)]
    pub programs: Vec<String>,
    #[serde(default)]
    pub split: SplitStrategy,
    /// File role the stage reads (default `"input"`).
    #[serde(default = "default_input_role")]
    pub input: String,
    /// File role the stage writes.
    pub output: String,
    /// Output file extension including the dot, e.g. `".bam"`.
    pub extension: String,
}

fn default_input_role() -> String {
    "input".to_string()
}

/// Samples and stages for one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunDescription {
    #[serde(default)]
    pub samples: Vec<DataRecord>,
    #[serde(default)]
    pub stages: Vec<StageDefinition>,
}
