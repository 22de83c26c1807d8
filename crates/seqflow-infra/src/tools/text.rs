//! Plain-file operations: header-aware concatenation, linking and
//! placeholders.

use std::path::Path;

use seqflow_core::tools::ToolError;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};

use crate::transaction::with_transaction;

/// Concatenate `inputs` into `output`.
///
/// Lines starting with `header_prefix` are kept only from the first input
/// that contributes any line at all. `output` appears only once every input
/// has been read.
pub async fn concat(
    inputs: &[impl AsRef<Path>],
    output: &Path,
    header_prefix: &str,
) -> Result<(), ToolError> {
    with_transaction(&[output.to_path_buf()], |paths| async move {
        concat_into(inputs, &paths[0], header_prefix).await
    })
    .await
}

async fn concat_into(
    inputs: &[impl AsRef<Path>],
    output: &Path,
    header_prefix: &str,
) -> Result<(), ToolError> {
    let mut writer = BufWriter::new(tokio::fs::File::create(output).await?);
    let mut header_written = false;
    for input in inputs {
        let file = tokio::fs::File::open(input.as_ref()).await?;
        let mut lines = BufReader::new(file).lines();
        let mut wrote_any = false;
        while let Some(line) = lines.next_line().await? {
            if header_written && !header_prefix.is_empty() && line.starts_with(header_prefix) {
                continue;
            }
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            wrote_any = true;
        }
        header_written |= wrote_any;
    }
    writer.flush().await?;
    Ok(())
}

/// Hard link `src` at `dest`, copying when the link fails.
///
/// An existing `dest` is replaced only once the link or copy is complete.
pub async fn link(src: &Path, dest: &Path) -> Result<(), ToolError> {
    with_transaction(&[dest.to_path_buf()], |paths| async move {
        if let Err(e) = tokio::fs::hard_link(src, &paths[0]).await {
            tracing::debug!(src = %src.display(), error = %e, "hard link failed, copying");
            tokio::fs::copy(src, &paths[0]).await?;
        }
        Ok::<_, ToolError>(())
    })
    .await
}

/// Write a zero-length output. Combining skips zero-length chunks.
pub async fn write_placeholder(output: &Path) -> Result<(), ToolError> {
    if let Some(dir) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir).await?;
    }
    tokio::fs::File::create(output).await?;
    Ok(())
}
