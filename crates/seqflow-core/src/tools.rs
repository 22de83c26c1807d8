//! Port for the file-format operations splitting, combining and ungrouping
//! depend on.
//!
//! The core never touches alignment or variant files itself. Everything that
//! needs to read a header, sort, merge or extract goes through `FormatTools`,
//! implemented in the infrastructure layer by shelling out to the usual
//! command-line tools.

use std::future::Future;
use std::path::{Path, PathBuf};

use seqflow_types::error::StageError;

/// One by-size chunk to write from a read stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadChunkPlan {
    /// Zero-based record index of the first read in the chunk.
    pub start: u64,
    pub count: u64,
    /// One output per input file (one for single-end, two for paired).
    pub outputs: Vec<PathBuf>,
}

/// File-format operations backed by external tools.
pub trait FormatTools: Send + Sync {
    /// Reference sequence names from an aligned-reads header, in order.
    fn reference_names(
        &self,
        aligned: &Path,
    ) -> impl Future<Output = Result<Vec<String>, ToolError>> + Send;

    /// Sort aligned reads by name so mates are adjacent.
    fn name_sort(
        &self,
        input: &Path,
        output: &Path,
        cores: u32,
    ) -> impl Future<Output = Result<(), ToolError>> + Send;

    /// Convert name-sorted aligned reads to FASTQ.
    ///
    /// Writes `outputs[0]` and, for paired data, `outputs[1]`. Returns
    /// whether the data was paired.
    fn to_fastq(
        &self,
        input: &Path,
        outputs: &[PathBuf; 2],
    ) -> impl Future<Output = Result<bool, ToolError>> + Send;

    /// Number of reads in a FASTQ file (or the first of a pair).
    fn count_reads(&self, fastq: &Path) -> impl Future<Output = Result<u64, ToolError>> + Send;

    /// Write by-size chunks of one or two FASTQ files in a single pass.
    fn write_read_chunks(
        &self,
        inputs: &[PathBuf],
        chunks: &[ReadChunkPlan],
    ) -> impl Future<Output = Result<(), ToolError>> + Send;

    /// Sorted-block merge of aligned-read chunks.
    fn merge_sorted(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        cores: u32,
    ) -> impl Future<Output = Result<(), ToolError>> + Send;

    /// Concatenate text outputs, keeping header lines from the first
    /// non-empty input only.
    fn concat(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        header_prefix: &str,
    ) -> impl Future<Output = Result<(), ToolError>> + Send;

    /// Extract one sample's subset of a multi-sample output.
    fn extract_sample(
        &self,
        combined: &Path,
        sample: &str,
        output: &Path,
    ) -> impl Future<Output = Result<(), ToolError>> + Send;

    /// Hard link `src` to `dest`, copying when linking is impossible.
    fn link(&self, src: &Path, dest: &Path) -> impl Future<Output = Result<(), ToolError>> + Send;

    /// Write a well-formed empty output.
    fn write_placeholder(&self, output: &Path) -> impl Future<Output = Result<(), ToolError>> + Send;
}

/// Errors from format tools.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("{tool} exited with {status}: {stderr}")]
    Failed {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("could not start {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed input {}: {message}", .path.display())]
    Malformed { path: PathBuf, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ToolError> for StageError {
    fn from(e: ToolError) -> Self {
        match e {
            ToolError::Failed { tool, status, stderr } => StageError::Tool {
                tool,
                message: format!("exited with {status}: {stderr}"),
            },
            ToolError::Spawn { tool, source } => StageError::Tool {
                tool,
                message: source.to_string(),
            },
            ToolError::Malformed { path, message } => {
                StageError::MissingPrerequisite(format!("{}: {message}", path.display()))
            }
            ToolError::Io(e) => StageError::Io(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_error_maps_to_stage_error() {
        let err: StageError = ToolError::Failed {
            tool: "samtools".into(),
            status: "exit status: 1".into(),
            stderr: "truncated file".into(),
        }
        .into();
        assert!(matches!(err, StageError::Tool { ref tool, .. } if tool == "samtools"));

        let err: StageError = ToolError::Malformed {
            path: PathBuf::from("a.fastq"),
            message: "mate count mismatch".into(),
        }
        .into();
        assert!(matches!(err, StageError::MissingPrerequisite(_)));
    }
}
