//! Native FASTQ counting and chunk writing.
//!
//! Records are four lines each. Gzipped input is streamed through a
//! `gzip -cd` child so chunks never need the whole file in memory.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use seqflow_core::tools::{ReadChunkPlan, ToolError};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, BufWriter, Lines};
use tokio::process::Child;

use crate::transaction::with_transaction;

const LINES_PER_READ: u64 = 4;

/// Line stream over a possibly gzipped FASTQ file.
struct ReadStream {
    path: PathBuf,
    lines: Lines<BufReader<Box<dyn AsyncRead + Unpin + Send>>>,
    child: Option<Child>,
}

impl ReadStream {
    async fn open(path: &Path) -> Result<Self, ToolError> {
        let gzipped = path
            .extension()
            .is_some_and(|ext| ext == "gz" || ext == "bgz");
        let (reader, child): (Box<dyn AsyncRead + Unpin + Send>, Option<Child>) = if gzipped {
            let mut child = tokio::process::Command::new("gzip")
                .arg("-cd")
                .arg(path)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|source| ToolError::Spawn {
                    tool: "gzip".to_string(),
                    source,
                })?;
            let stdout = child.stdout.take().ok_or_else(|| ToolError::Malformed {
                path: path.to_path_buf(),
                message: "gzip produced no output stream".to_string(),
            })?;
            (Box::new(stdout), Some(child))
        } else {
            (Box::new(tokio::fs::File::open(path).await?), None)
        };
        Ok(Self {
            path: path.to_path_buf(),
            lines: BufReader::new(reader).lines(),
            child,
        })
    }

    async fn next_line(&mut self) -> Result<Option<String>, ToolError> {
        Ok(self.lines.next_line().await?)
    }

    /// Wait for the decompressor, surfacing a corrupt-archive failure.
    async fn finish(mut self) -> Result<(), ToolError> {
        let Some(child) = self.child.take() else {
            return Ok(());
        };
        drop(self.lines);
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(ToolError::Failed {
                tool: "gzip".to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    fn malformed(&self, message: impl Into<String>) -> ToolError {
        ToolError::Malformed {
            path: self.path.clone(),
            message: message.into(),
        }
    }
}

/// Count the reads in a FASTQ file.
pub async fn count_reads(path: &Path) -> Result<u64, ToolError> {
    let mut stream = ReadStream::open(path).await?;
    let mut lines = 0u64;
    while stream.next_line().await?.is_some() {
        lines += 1;
    }
    if lines % LINES_PER_READ != 0 {
        return Err(stream.malformed(format!("{lines} lines is not a whole number of reads")));
    }
    stream.finish().await?;
    Ok(lines / LINES_PER_READ)
}

/// Write every chunk of every mate file in one pass per mate.
///
/// Chunks must be contiguous and ordered by `start`. A mate that runs out
/// early, or has reads left over, is malformed. No chunk file appears unless
/// every mate was written in full.
pub async fn write_chunks(inputs: &[PathBuf], chunks: &[ReadChunkPlan]) -> Result<(), ToolError> {
    let mates = inputs.len();
    let mut finals = Vec::with_capacity(chunks.len() * mates);
    for chunk in chunks {
        if let Some(input) = inputs.get(chunk.outputs.len()) {
            return Err(ToolError::Malformed {
                path: input.clone(),
                message: format!("chunk plan has no output for mate {}", chunk.outputs.len() + 1),
            });
        }
        finals.extend(chunk.outputs.iter().take(mates).cloned());
    }
    if finals.is_empty() {
        return Ok(());
    }

    with_transaction(&finals, |paths| async move {
        for (mate, input) in inputs.iter().enumerate() {
            let mut stream = ReadStream::open(input).await?;
            let mut position = 0u64;
            for (index, chunk) in chunks.iter().enumerate() {
                if chunk.start != position {
                    return Err(stream.malformed(format!(
                        "chunk plan starts at read {} but stream is at read {position}",
                        chunk.start
                    )));
                }
                let output = &paths[index * mates + mate];
                let mut writer = BufWriter::new(tokio::fs::File::create(output).await?);
                for _ in 0..chunk.count * LINES_PER_READ {
                    let Some(line) = stream.next_line().await? else {
                        return Err(stream.malformed(format!(
                            "ended before read {} expected by mate 1",
                            position + chunk.count
                        )));
                    };
                    writer.write_all(line.as_bytes()).await?;
                    writer.write_all(b"\n").await?;
                }
                writer.flush().await?;
                position += chunk.count;
            }
            if stream.next_line().await?.is_some() {
                return Err(stream.malformed(format!("has more than the {position} reads of mate 1")));
            }
            stream.finish().await?;
        }
        Ok::<_, ToolError>(())
    })
    .await
}
