//! Region and size splitting of per-sample inputs, and recombination.
//!
//! A split turns one record into a list of chunk work items plus a
//! `ChunkManifest` naming each chunk's output. The manifest is handed to the
//! `Combiner` after the stage has run over every chunk. If the combined
//! parent output already exists, nothing is split.

pub mod boundaries;
pub mod combine;
pub mod layout;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use seqflow_types::config::SplitConfig;
use seqflow_types::error::{ManifestError, StageError};
use seqflow_types::manifest::ChunkManifest;
use seqflow_types::record::{DataRecord, Region, WorkItem};

use crate::tools::{FormatTools, ReadChunkPlan, ToolError};

pub use boundaries::{ChunkBoundaries, SizeChunk};
pub use combine::Combiner;
pub use layout::{chunk_path, split_dir, split_extension};

/// Chunk work items and the manifest to combine them with.
#[derive(Debug, Clone)]
pub struct SplitPlan {
    pub manifest: ChunkManifest,
    pub items: Vec<WorkItem>,
}

/// Result of asking to split one record.
#[derive(Debug, Clone)]
pub enum SplitOutcome {
    /// The parent output exists already; nothing to recompute.
    AlreadyCombined { parent: PathBuf },
    Chunks(SplitPlan),
}

/// File role holding the second mate of paired reads for `role`.
pub fn pair_role(role: &str) -> String {
    format!("{role}_pair")
}

/// Builds chunk plans for one record at a time.
pub struct Splitter<T: FormatTools> {
    tools: Arc<T>,
    config: SplitConfig,
}

impl<T: FormatTools> Splitter<T> {
    pub fn new(tools: Arc<T>, config: SplitConfig) -> Self {
        Self { tools, config }
    }

    /// One chunk per reference sequence of the record's aligned input, plus
    /// the unmapped region when configured.
    pub async fn by_chromosome(
        &self,
        stage: &str,
        record: &DataRecord,
        input_role: &str,
        parent: &Path,
    ) -> Result<SplitOutcome, SplitError> {
        if tokio::fs::try_exists(parent).await? {
            tracing::debug!(parent = %parent.display(), "combined output exists, not splitting");
            return Ok(SplitOutcome::AlreadyCombined {
                parent: parent.to_path_buf(),
            });
        }
        let input = required_input(record, input_role)?;

        let mut regions: Vec<Region> = self
            .tools
            .reference_names(input)
            .await?
            .into_iter()
            .map(Region::contig)
            .collect();
        if self.config.include_unmapped {
            regions.push(Region::Unmapped);
        }

        let mut manifest = ChunkManifest::new(parent);
        let mut items = Vec::with_capacity(regions.len());
        for region in regions {
            let key = region.chunk_key();
            let target = chunk_path(parent, &key);
            manifest.push(key.clone(), &target)?;

            let mut chunk_record = record.clone();
            chunk_record.region = Some(region.clone());
            chunk_record
                .metadata
                .insert("chunk".to_string(), key.clone().into());
            items.push(WorkItem {
                stage: stage.to_string(),
                record: chunk_record,
                region: Some(region),
                target: Some(target),
            });
        }

        tokio::fs::create_dir_all(split_dir(parent)).await?;
        tracing::debug!(
            sample = record.name.as_str(),
            chunks = items.len(),
            "split by chromosome"
        );
        Ok(SplitOutcome::Chunks(SplitPlan { manifest, items }))
    }

    /// Fixed read-count chunks of raw sequence data.
    ///
    /// Aligned input is name-sorted and converted to FASTQ first so mates
    /// stay together. Each chunk item reads its own FASTQ chunk (and mate
    /// chunk) and writes the chunk target.
    pub async fn by_size(
        &self,
        stage: &str,
        record: &DataRecord,
        input_role: &str,
        parent: &Path,
        cores: u32,
    ) -> Result<SplitOutcome, SplitError> {
        if tokio::fs::try_exists(parent).await? {
            tracing::debug!(parent = %parent.display(), "combined output exists, not splitting");
            return Ok(SplitOutcome::AlreadyCombined {
                parent: parent.to_path_buf(),
            });
        }
        let input = required_input(record, input_role)?;
        let mate_role = pair_role(input_role);
        tokio::fs::create_dir_all(split_dir(parent)).await?;
        let mut manifest = ChunkManifest::new(parent);

        let inputs: Vec<PathBuf> = if is_aligned(input) {
            let sorted = layout::scratch_path(parent, "namesort.bam");
            let fastq = [
                layout::scratch_path(parent, "1.fastq"),
                layout::scratch_path(parent, "2.fastq"),
            ];
            manifest.push_scratch(&sorted);
            for path in &fastq {
                manifest.push_scratch(path);
            }
            self.tools.name_sort(input, &sorted, cores).await?;
            let paired = self.tools.to_fastq(&sorted, &fastq).await?;
            let [first, second] = fastq;
            if paired { vec![first, second] } else { vec![first] }
        } else {
            let mut inputs = vec![input.to_path_buf()];
            if let Some(mate) = record.file(&mate_role) {
                inputs.push(mate.to_path_buf());
            }
            inputs
        };

        let total = self.tools.count_reads(&inputs[0]).await?;
        let (_, read_ext) = split_extension(&inputs[0]);
        let read_ext = read_ext.trim_end_matches(".gz").to_string();

        let mut items = Vec::new();
        let mut plans = Vec::new();
        for chunk in ChunkBoundaries::new(total, self.config.reads_per_chunk) {
            let key = chunk.key();
            let outputs: Vec<PathBuf> = (1..=inputs.len())
                .map(|mate| layout::scratch_path(parent, &format!("{key}-{mate}{read_ext}")))
                .collect();
            let target = chunk_path(parent, &key);
            manifest.push(key.clone(), &target)?;
            for output in &outputs {
                manifest.push_scratch(output);
            }

            let mut chunk_record = record.clone();
            chunk_record.set_file(input_role, &outputs[0]);
            match outputs.get(1) {
                Some(mate) => chunk_record.set_file(mate_role.clone(), mate),
                None => {
                    chunk_record.files.remove(&mate_role);
                }
            }
            chunk_record
                .metadata
                .insert("chunk".to_string(), key.clone().into());

            items.push(WorkItem {
                stage: stage.to_string(),
                record: chunk_record,
                region: None,
                target: Some(target),
            });
            plans.push(ReadChunkPlan {
                start: chunk.start,
                count: chunk.count,
                outputs,
            });
        }

        if !plans.is_empty() {
            self.tools.write_read_chunks(&inputs, &plans).await?;
        }
        tracing::debug!(
            sample = record.name.as_str(),
            reads = total,
            chunks = items.len(),
            "split by size"
        );
        Ok(SplitOutcome::Chunks(SplitPlan { manifest, items }))
    }
}

fn required_input<'r>(record: &'r DataRecord, role: &str) -> Result<&'r Path, SplitError> {
    record.file(role).ok_or_else(|| SplitError::MissingInput {
        sample: record.name.clone(),
        role: role.to_string(),
    })
}

fn is_aligned(path: &Path) -> bool {
    matches!(split_extension(path).1.as_str(), ".bam" | ".cram")
}

/// Errors from splitting or combining.
#[derive(Debug, thiserror::Error)]
pub enum SplitError {
    #[error("sample '{sample}' has no '{role}' file to split")]
    MissingInput { sample: String, role: String },

    #[error(
        "cannot combine {}: {} chunk(s) missing, first {}",
        .parent.display(),
        .missing.len(),
        first_missing(.missing)
    )]
    MissingChunks { parent: PathBuf, missing: Vec<PathBuf> },

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn first_missing(missing: &[PathBuf]) -> String {
    missing
        .first()
        .map(|p| p.display().to_string())
        .unwrap_or_default()
}

impl SplitError {
    /// Whether the error means required data was absent.
    pub fn is_missing_prerequisite(&self) -> bool {
        matches!(self, SplitError::MissingInput { .. } | SplitError::MissingChunks { .. })
    }
}

impl From<SplitError> for StageError {
    fn from(e: SplitError) -> Self {
        match e {
            SplitError::Tool(tool) => tool.into(),
            SplitError::Io(io) => StageError::Io(io),
            other => StageError::MissingPrerequisite(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{write_fastq, write_fake_bam, FakeTools};
    use tempfile::TempDir;

    fn splitter(tools: Arc<FakeTools>) -> Splitter<FakeTools> {
        Splitter::new(tools, SplitConfig::default())
    }

    #[tokio::test]
    async fn test_by_chromosome_one_chunk_per_contig_plus_unmapped() {
        let tmp = TempDir::new().unwrap();
        let bam = tmp.path().join("in.bam");
        write_fake_bam(&bam, &["chr1", "chr2", "chrM"], &[("chr1", 3), ("chr2", 1)]);
        let record = DataRecord::new("s1").with_file("work_bam", &bam);
        let parent = tmp.path().join("call").join("s1.vcf");

        let outcome = splitter(Arc::new(FakeTools::default()))
            .by_chromosome("call", &record, "work_bam", &parent)
            .await
            .unwrap();
        let SplitOutcome::Chunks(plan) = outcome else {
            panic!("expected chunks");
        };

        let keys: Vec<&str> = plan.manifest.chunks().iter().map(|c| c.key.as_str()).collect();
        assert_eq!(keys, ["chr1", "chr2", "chrM", "unmapped"]);
        assert_eq!(plan.items.len(), 4);
        assert_eq!(
            plan.items[0].target.as_deref(),
            Some(tmp.path().join("call/s1-split/s1-chr1.vcf").as_path())
        );
        assert_eq!(plan.items[3].region, Some(Region::Unmapped));
        assert_eq!(plan.items[1].record.region, Some(Region::contig("chr2")));
        assert_eq!(plan.items[1].record.metadata["chunk"], "chr2");
        assert!(split_dir(&parent).is_dir());
    }

    #[tokio::test]
    async fn test_unmapped_can_be_disabled() {
        let tmp = TempDir::new().unwrap();
        let bam = tmp.path().join("in.bam");
        write_fake_bam(&bam, &["chr1"], &[]);
        let record = DataRecord::new("s1").with_file("work_bam", &bam);
        let config = SplitConfig {
            include_unmapped: false,
            ..SplitConfig::default()
        };
        let outcome = Splitter::new(Arc::new(FakeTools::default()), config)
            .by_chromosome("call", &record, "work_bam", &tmp.path().join("s1.vcf"))
            .await
            .unwrap();
        let SplitOutcome::Chunks(plan) = outcome else {
            panic!("expected chunks");
        };
        assert_eq!(plan.manifest.len(), 1);
    }

    #[tokio::test]
    async fn test_existing_parent_skips_split() {
        let tmp = TempDir::new().unwrap();
        let parent = tmp.path().join("s1.vcf");
        std::fs::write(&parent, "##done\n").unwrap();
        let tools = Arc::new(FakeTools::default());
        let record = DataRecord::new("s1").with_file("work_bam", tmp.path().join("in.bam"));

        let outcome = splitter(tools.clone())
            .by_chromosome("call", &record, "work_bam", &parent)
            .await
            .unwrap();
        assert!(matches!(outcome, SplitOutcome::AlreadyCombined { parent: p } if p == parent));
        assert!(tools.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_input_is_prerequisite_error() {
        let tmp = TempDir::new().unwrap();
        let err = splitter(Arc::new(FakeTools::default()))
            .by_chromosome("call", &DataRecord::new("s1"), "work_bam", &tmp.path().join("s1.vcf"))
            .await
            .unwrap_err();
        assert!(err.is_missing_prerequisite());
    }

    #[tokio::test]
    async fn test_by_size_paired_fastq() {
        let tmp = TempDir::new().unwrap();
        let r1 = tmp.path().join("s1_1.fastq");
        let r2 = tmp.path().join("s1_2.fastq");
        write_fastq(&r1, 5);
        write_fastq(&r2, 5);
        let record = DataRecord::new("s1")
            .with_file("fastq", &r1)
            .with_file("fastq_pair", &r2);
        let config = SplitConfig {
            reads_per_chunk: 2,
            ..SplitConfig::default()
        };
        let parent = tmp.path().join("align").join("s1.bam");

        let outcome = Splitter::new(Arc::new(FakeTools::default()), config)
            .by_size("align", &record, "fastq", &parent, 1)
            .await
            .unwrap();
        let SplitOutcome::Chunks(plan) = outcome else {
            panic!("expected chunks");
        };

        assert_eq!(plan.items.len(), 3);
        let last = &plan.items[2].record;
        let mate = last.file("fastq_pair").unwrap();
        let first = last.file("fastq").unwrap();
        assert_eq!(std::fs::read_to_string(first).unwrap().lines().count(), 4);
        assert_eq!(std::fs::read_to_string(mate).unwrap().lines().count(), 4);
        assert_eq!(last.metadata["chunk"], "0002");
        assert_eq!(
            plan.items[0].target.as_deref(),
            Some(tmp.path().join("align/s1-split/s1-0000.bam").as_path())
        );
    }

    #[tokio::test]
    async fn test_by_size_name_sorts_aligned_input() {
        let tmp = TempDir::new().unwrap();
        let bam = tmp.path().join("s1.bam");
        write_fake_bam(&bam, &["chr1"], &[("chr1", 4)]);
        let record = DataRecord::new("s1").with_file("input", &bam);
        let tools = Arc::new(FakeTools::default());

        let outcome = Splitter::new(tools.clone(), SplitConfig::default())
            .by_size("align", &record, "input", &tmp.path().join("s1-re.bam"), 2)
            .await
            .unwrap();
        let SplitOutcome::Chunks(plan) = outcome else {
            panic!("expected chunks");
        };
        assert_eq!(plan.items.len(), 1);
        let scratch: Vec<String> = plan
            .manifest
            .scratch()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            scratch,
            ["s1-re-namesort.bam", "s1-re-1.fastq", "s1-re-2.fastq", "s1-re-0000-1.fastq"]
        );
        let calls = tools.calls();
        assert_eq!(calls[0], "name_sort");
        assert_eq!(calls[1], "to_fastq");
        assert!(plan.items[0].record.file("input_pair").is_none());
    }

    #[tokio::test]
    async fn test_by_size_empty_input_has_no_chunks() {
        let tmp = TempDir::new().unwrap();
        let r1 = tmp.path().join("s1.fastq");
        write_fastq(&r1, 0);
        let record = DataRecord::new("s1").with_file("fastq", &r1);
        let outcome = splitter(Arc::new(FakeTools::default()))
            .by_size("align", &record, "fastq", &tmp.path().join("s1.bam"), 1)
            .await
            .unwrap();
        let SplitOutcome::Chunks(plan) = outcome else {
            panic!("expected chunks");
        };
        assert!(plan.manifest.is_empty());
        assert!(plan.items.is_empty());
    }
}
