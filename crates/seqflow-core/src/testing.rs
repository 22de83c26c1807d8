//! In-memory fakes for the core's ports, shared by unit tests.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use seqflow_types::config::SplitStrategy;
use seqflow_types::error::StageError;
use seqflow_types::job::{JobId, JobState};
use seqflow_types::record::{DataRecord, Region, WorkItem};

use crate::backend::{BrokerError, ClusterError, EngineLauncher, EnginePool, EngineSpec, JobBroker};
use crate::checkpoint::{CheckpointError, CheckpointKey, CheckpointStore};
use crate::resources::Allocation;
use crate::stage::{OutputSpec, Stage, StageFuture};
use crate::tools::{FormatTools, ReadChunkPlan, ToolError};

pub fn test_allocation(workers: usize) -> Allocation {
    Allocation {
        workers,
        cores_per_worker: 1,
        memory_per_worker: None,
        jvm_opts: Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

/// Returns its input record, writing the item target when it has an output.
pub struct EchoStage {
    name: String,
    programs: Vec<String>,
    split: SplitStrategy,
    input_role: String,
    output: Option<OutputSpec>,
    calls: AtomicUsize,
}

impl EchoStage {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            programs: Vec::new(),
            split: SplitStrategy::None,
            input_role: "input".to_string(),
            output: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_output(mut self, role: &str, extension: &str) -> Self {
        self.output = Some(OutputSpec::new(role, extension));
        self
    }

    pub fn with_split(mut self, split: SplitStrategy, input_role: &str) -> Self {
        self.split = split;
        self.input_role = input_role.to_string();
        self
    }

    pub fn with_programs(mut self, programs: &[&str]) -> Self {
        self.programs = programs.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Stage for EchoStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn programs(&self) -> &[String] {
        &self.programs
    }

    fn split(&self) -> SplitStrategy {
        self.split
    }

    fn input_role(&self) -> &str {
        &self.input_role
    }

    fn output(&self) -> Option<&OutputSpec> {
        self.output.as_ref()
    }

    fn run<'a>(&'a self, item: WorkItem, _resources: &'a Allocation) -> StageFuture<'a> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut record = item.record;
            if let (Some(output), Some(target)) = (&self.output, item.target) {
                if let Some(dir) = target.parent() {
                    std::fs::create_dir_all(dir)?;
                }
                std::fs::write(&target, format!("{}\n", record.name))?;
                record.set_file(output.role.clone(), target);
            }
            Ok(vec![record])
        })
    }
}

/// Copies the reads of its item's region from a fake aligned file.
pub struct RegionFilterStage {
    name: String,
    programs: Vec<String>,
    output: OutputSpec,
}

impl RegionFilterStage {
    pub fn new(name: &str, programs: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            programs: programs.iter().map(|p| p.to_string()).collect(),
            output: OutputSpec::new("work_bam", ".bam"),
        }
    }
}

impl Stage for RegionFilterStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn programs(&self) -> &[String] {
        &self.programs
    }

    fn split(&self) -> SplitStrategy {
        SplitStrategy::Chromosome
    }

    fn input_role(&self) -> &str {
        "work_bam"
    }

    fn output(&self) -> Option<&OutputSpec> {
        Some(&self.output)
    }

    fn run<'a>(&'a self, item: WorkItem, _resources: &'a Allocation) -> StageFuture<'a> {
        Box::pin(async move {
            let input = item
                .record
                .file("work_bam")
                .ok_or_else(|| StageError::MissingPrerequisite("no work_bam".into()))?
                .to_path_buf();
            let target = item
                .target
                .clone()
                .ok_or_else(|| StageError::Failed("no target".into()))?;
            let wanted = match &item.region {
                Some(Region::Contig { name }) => name.clone(),
                Some(Region::Unmapped) => "*".to_string(),
                _ => return Err(StageError::Failed("unexpected region".into())),
            };

            let text = std::fs::read_to_string(&input)?;
            let mut out = String::new();
            let mut reads = 0;
            for line in text.lines() {
                if line.starts_with('@') {
                    out.push_str(line);
                    out.push('\n');
                } else if line.split('\t').next() == Some(wanted.as_str()) {
                    out.push_str(line);
                    out.push('\n');
                    reads += 1;
                }
            }
            if reads == 0 {
                std::fs::write(&target, "")?;
            } else {
                std::fs::write(&target, out)?;
            }

            let mut record = item.record;
            record.set_file(self.output.role.clone(), target);
            Ok(vec![record])
        })
    }
}

/// Fails (or reports empty input) for the listed sample names.
pub struct FailingStage {
    name: String,
    fail_for: Vec<String>,
    empty_input: bool,
    calls: AtomicUsize,
}

impl FailingStage {
    pub fn new(name: &str, fail_for: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            fail_for: fail_for.iter().map(|s| s.to_string()).collect(),
            empty_input: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn empty_input(name: &str, samples: &[&str]) -> Self {
        Self {
            empty_input: true,
            ..Self::new(name, samples)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Stage for FailingStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn run<'a>(&'a self, item: WorkItem, _resources: &'a Allocation) -> StageFuture<'a> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_for.contains(&item.record.name) {
                if self.empty_input {
                    return Err(StageError::EmptyInput(item.label()));
                }
                return Err(StageError::Failed(format!("{} exploded", item.label())));
            }
            Ok(vec![item.record])
        })
    }
}

/// Sleeps before echoing, for cancellation tests.
pub struct SlowStage {
    name: String,
    delay: Duration,
}

impl SlowStage {
    pub fn new(name: &str, delay: Duration) -> Self {
        Self {
            name: name.to_string(),
            delay,
        }
    }
}

impl Stage for SlowStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn run<'a>(&'a self, item: WorkItem, _resources: &'a Allocation) -> StageFuture<'a> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            Ok(vec![item.record])
        })
    }
}

// ---------------------------------------------------------------------------
// Checkpoint store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointStore {
    keys: Arc<Mutex<BTreeSet<CheckpointKey>>>,
}

impl CheckpointStore for MemoryCheckpointStore {
    async fn exists(&self, key: &CheckpointKey) -> Result<bool, CheckpointError> {
        Ok(self.keys.lock().unwrap().contains(key))
    }

    async fn mark(&self, key: &CheckpointKey) -> Result<(), CheckpointError> {
        self.keys.lock().unwrap().insert(key.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<CheckpointKey>, CheckpointError> {
        Ok(self.keys.lock().unwrap().iter().cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// Format tools
// ---------------------------------------------------------------------------

/// Text-file stand-ins for the external format tools.
///
/// A fake aligned file has `@SQ\tSN:<name>` header lines and one
/// `<contig>\t<read>` line per read (`*` for unmapped).
#[derive(Debug, Default)]
pub struct FakeTools {
    calls: Mutex<Vec<String>>,
}

impl FakeTools {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }
}

fn read_lines(path: &Path) -> Result<Vec<String>, ToolError> {
    Ok(std::fs::read_to_string(path)?
        .lines()
        .map(str::to_string)
        .collect())
}

fn write_lines(path: &Path, lines: &[String]) -> Result<(), ToolError> {
    let mut text = lines.join("\n");
    if !lines.is_empty() {
        text.push('\n');
    }
    std::fs::write(path, text)?;
    Ok(())
}

impl FormatTools for FakeTools {
    async fn reference_names(&self, aligned: &Path) -> Result<Vec<String>, ToolError> {
        self.record("reference_names");
        Ok(read_lines(aligned)?
            .iter()
            .filter_map(|l| l.strip_prefix("@SQ\tSN:").map(str::to_string))
            .collect())
    }

    async fn name_sort(&self, input: &Path, output: &Path, _cores: u32) -> Result<(), ToolError> {
        self.record("name_sort");
        std::fs::copy(input, output)?;
        Ok(())
    }

    async fn to_fastq(&self, input: &Path, outputs: &[PathBuf; 2]) -> Result<bool, ToolError> {
        self.record("to_fastq");
        let mut fastq = Vec::new();
        for line in read_lines(input)?.iter().filter(|l| !l.starts_with('@')) {
            let read = line.split('\t').nth(1).unwrap_or("read");
            fastq.extend([format!("@{read}"), "ACGT".into(), "+".into(), "IIII".into()]);
        }
        write_lines(&outputs[0], &fastq)?;
        Ok(false)
    }

    async fn count_reads(&self, fastq: &Path) -> Result<u64, ToolError> {
        self.record("count_reads");
        Ok(read_lines(fastq)?.len() as u64 / 4)
    }

    async fn write_read_chunks(
        &self,
        inputs: &[PathBuf],
        chunks: &[ReadChunkPlan],
    ) -> Result<(), ToolError> {
        self.record("write_read_chunks");
        for (mate, input) in inputs.iter().enumerate() {
            let lines = read_lines(input)?;
            for chunk in chunks {
                let start = (chunk.start * 4) as usize;
                let end = ((chunk.start + chunk.count) * 4) as usize;
                write_lines(&chunk.outputs[mate], &lines[start..end.min(lines.len())])?;
            }
        }
        Ok(())
    }

    async fn merge_sorted(&self, inputs: &[PathBuf], output: &Path, _cores: u32) -> Result<(), ToolError> {
        self.record("merge_sorted");
        let mut header = Vec::new();
        let mut reads = Vec::new();
        for (i, input) in inputs.iter().enumerate() {
            for line in read_lines(input)? {
                if line.starts_with('@') {
                    if i == 0 {
                        header.push(line);
                    }
                } else {
                    reads.push(line);
                }
            }
        }
        header.extend(reads);
        write_lines(output, &header)
    }

    async fn concat(&self, inputs: &[PathBuf], output: &Path, header_prefix: &str) -> Result<(), ToolError> {
        self.record("concat");
        let mut out = Vec::new();
        for (i, input) in inputs.iter().enumerate() {
            out.extend(
                read_lines(input)?
                    .into_iter()
                    .filter(|l| i == 0 || !l.starts_with(header_prefix)),
            );
        }
        write_lines(output, &out)
    }

    async fn extract_sample(&self, _combined: &Path, sample: &str, output: &Path) -> Result<(), ToolError> {
        self.record("extract_sample");
        std::fs::write(output, format!("sample: {sample}\n"))?;
        Ok(())
    }

    async fn link(&self, src: &Path, dest: &Path) -> Result<(), ToolError> {
        self.record("link");
        std::fs::copy(src, dest)?;
        Ok(())
    }

    async fn write_placeholder(&self, output: &Path) -> Result<(), ToolError> {
        self.record("write_placeholder");
        std::fs::write(output, "")?;
        Ok(())
    }
}

/// Write a fake aligned file with the given reference names and per-contig
/// read counts.
pub fn write_fake_bam(path: &Path, contigs: &[&str], reads: &[(&str, usize)]) {
    let mut text = String::new();
    for contig in contigs {
        text.push_str(&format!("@SQ\tSN:{contig}\n"));
    }
    for (contig, n) in reads {
        for i in 0..*n {
            text.push_str(&format!("{contig}\tread_{contig}_{i}\n"));
        }
    }
    std::fs::write(path, text).unwrap();
}

pub fn write_fastq(path: &Path, reads: usize) {
    let mut text = String::new();
    for i in 0..reads {
        text.push_str(&format!("@r{i}\nACGT\n+\nIIII\n"));
    }
    std::fs::write(path, text).unwrap();
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

/// Scripted behaviour for one fake broker job.
#[derive(Debug, Clone)]
pub enum JobScript {
    /// Report `Running` for this many polls, then succeed.
    SucceedAfter(usize),
    Fail(String),
    RunForever,
}

struct FakeJob {
    id: JobId,
    item: WorkItem,
    script: JobScript,
    polls: usize,
    revoked: bool,
}

/// Broker whose jobs follow a script chosen by submission index.
pub struct FakeBroker {
    script: Box<dyn Fn(usize) -> JobScript + Send + Sync>,
    jobs: Mutex<Vec<FakeJob>>,
    revoked: Mutex<Vec<JobId>>,
    forgotten: Mutex<Vec<JobId>>,
    submit_failures: AtomicUsize,
}

impl FakeBroker {
    pub fn new(script: impl Fn(usize) -> JobScript + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            jobs: Mutex::new(Vec::new()),
            revoked: Mutex::new(Vec::new()),
            forgotten: Mutex::new(Vec::new()),
            submit_failures: AtomicUsize::new(0),
        }
    }

    /// Make the next `n` submissions fail as unavailable.
    pub fn fail_next_submits(&self, n: usize) {
        self.submit_failures.store(n, Ordering::SeqCst);
    }

    pub fn submitted(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    pub fn revoked(&self) -> Vec<JobId> {
        self.revoked.lock().unwrap().clone()
    }

    pub fn forgotten(&self) -> Vec<JobId> {
        self.forgotten.lock().unwrap().clone()
    }
}

impl JobBroker for FakeBroker {
    async fn submit(&self, _stage: &str, item: &WorkItem, _alloc: &Allocation) -> Result<JobId, BrokerError> {
        let failures = self.submit_failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.submit_failures.store(failures - 1, Ordering::SeqCst);
            return Err(BrokerError::Unavailable("connection refused".into()));
        }
        let mut jobs = self.jobs.lock().unwrap();
        let id = JobId::new();
        let script = (self.script)(jobs.len());
        jobs.push(FakeJob {
            id,
            item: item.clone(),
            script,
            polls: 0,
            revoked: false,
        });
        Ok(id)
    }

    async fn status(&self, id: JobId) -> Result<JobState, BrokerError> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or(BrokerError::UnknownJob(id))?;
        if job.revoked {
            return Ok(JobState::Revoked);
        }
        Ok(match &job.script {
            JobScript::SucceedAfter(n) if job.polls >= *n => JobState::Succeeded {
                records: vec![job.item.record.clone()],
            },
            JobScript::SucceedAfter(_) => {
                job.polls += 1;
                JobState::Running
            }
            JobScript::Fail(error) => JobState::Failed {
                error: error.clone(),
            },
            JobScript::RunForever => JobState::Running,
        })
    }

    async fn revoke(&self, id: JobId) -> Result<(), BrokerError> {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs.iter_mut().find(|j| j.id == id) {
            job.revoked = true;
        }
        self.revoked.lock().unwrap().push(id);
        Ok(())
    }

    async fn forget(&self, ids: Vec<JobId>) {
        self.forgotten.lock().unwrap().extend(ids);
    }
}

// ---------------------------------------------------------------------------
// Engine launcher
// ---------------------------------------------------------------------------

/// Launcher whose pools become ready after a number of readiness polls.
#[derive(Clone)]
pub struct FakeLauncher {
    ready_after: usize,
    started: Arc<Mutex<Vec<EngineSpec>>>,
    stopped: Arc<AtomicUsize>,
}

impl FakeLauncher {
    pub fn ready_after(polls: usize) -> Self {
        Self {
            ready_after: polls,
            started: Arc::new(Mutex::new(Vec::new())),
            stopped: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn started(&self) -> Vec<EngineSpec> {
        self.started.lock().unwrap().clone()
    }

    pub fn stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }
}

pub struct FakePool {
    engines: usize,
    polls_left: AtomicUsize,
    stopped: Arc<AtomicUsize>,
}

impl EngineLauncher for FakeLauncher {
    type Pool = FakePool;

    async fn start(&self, spec: &EngineSpec) -> Result<FakePool, ClusterError> {
        self.started.lock().unwrap().push(spec.clone());
        Ok(FakePool {
            engines: spec.engines,
            polls_left: AtomicUsize::new(self.ready_after),
            stopped: Arc::clone(&self.stopped),
        })
    }
}

impl EnginePool for FakePool {
    async fn ready_engines(&self) -> Result<usize, ClusterError> {
        let left = self.polls_left.load(Ordering::SeqCst);
        if left > 0 {
            self.polls_left.store(left - 1, Ordering::SeqCst);
            return Ok(0);
        }
        Ok(self.engines)
    }

    async fn map(
        &self,
        stage: Arc<dyn Stage>,
        items: Vec<WorkItem>,
        alloc: &Allocation,
    ) -> Result<Vec<Result<Vec<DataRecord>, StageError>>, ClusterError> {
        let mut outcomes = Vec::with_capacity(items.len());
        for item in items {
            outcomes.push(stage.run(item, alloc).await);
        }
        Ok(outcomes)
    }

    async fn stop(self) -> Result<(), ClusterError> {
        self.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
