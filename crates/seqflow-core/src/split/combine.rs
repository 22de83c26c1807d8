//! Recombination of chunk outputs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use seqflow_types::config::{ChunkCleanup, SplitConfig};
use seqflow_types::manifest::ChunkManifest;

use super::{split_extension, SplitError};
use crate::tools::FormatTools;

/// Merges chunk outputs back into their parent file.
///
/// Nothing is written unless every chunk in the manifest exists. Aligned
/// reads are merged with a sorted-block merge; everything else is
/// concatenated in manifest order. Zero-length chunks are placeholders from
/// empty inputs and contribute nothing.
pub struct Combiner<T: FormatTools> {
    tools: Arc<T>,
    config: SplitConfig,
}

impl<T: FormatTools> Combiner<T> {
    pub fn new(tools: Arc<T>, config: SplitConfig) -> Self {
        Self { tools, config }
    }

    /// Combine the chunks of `manifest` into its parent and return the
    /// parent path.
    pub async fn combine(&self, manifest: &ChunkManifest, cores: u32) -> Result<PathBuf, SplitError> {
        manifest.validate()?;
        let parent = manifest.parent();
        if tokio::fs::try_exists(parent).await? {
            tracing::debug!(parent = %parent.display(), "already combined");
            return Ok(parent.to_path_buf());
        }

        let mut missing = Vec::new();
        let mut inputs = Vec::with_capacity(manifest.len());
        for chunk in manifest.chunks() {
            match tokio::fs::metadata(&chunk.path).await {
                Ok(meta) if meta.len() > 0 => inputs.push(chunk.path.clone()),
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => missing.push(chunk.path.clone()),
                Err(e) => return Err(e.into()),
            }
        }
        if !missing.is_empty() {
            return Err(SplitError::MissingChunks {
                parent: parent.to_path_buf(),
                missing,
            });
        }

        if let Some(dir) = parent.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        if inputs.is_empty() {
            self.tools.write_placeholder(parent).await?;
        } else if is_aligned(parent) {
            self.tools.merge_sorted(&inputs, parent, cores).await?;
        } else {
            self.tools
                .concat(&inputs, parent, &self.config.header_prefix)
                .await?;
        }
        tracing::info!(
            parent = %parent.display(),
            chunks = manifest.len(),
            merged = inputs.len(),
            "combined chunks"
        );

        self.clean_up(manifest).await;
        Ok(parent.to_path_buf())
    }

    /// Best-effort removal or replacement of partial files after a combine.
    ///
    /// Scratch files go whenever chunks are cleaned up; markers only stand in
    /// for chunk outputs.
    async fn clean_up(&self, manifest: &ChunkManifest) {
        if self.config.cleanup == ChunkCleanup::Keep {
            return;
        }
        let marker = format!("seqflow: combined into {}\n", manifest.parent().display());
        for path in manifest.paths() {
            let result = match self.config.cleanup {
                ChunkCleanup::Marker => tokio::fs::write(path, &marker).await,
                _ => tokio::fs::remove_file(path).await,
            };
            if let Err(e) = result {
                tracing::warn!(chunk = %path.display(), error = %e, "failed to clean up chunk");
            }
        }
        for path in manifest.scratch() {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(scratch = %path.display(), error = %e, "failed to remove scratch file"),
            }
        }
    }
}

fn is_aligned(path: &Path) -> bool {
    split_extension(path).1 == ".bam"
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
