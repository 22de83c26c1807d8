//! Transactional file output.
//!
//! A transaction substitutes private temporary paths for one or more final
//! paths. Committing moves every temp file that was written, plus any
//! recognized sidecar index next to it, onto its final path. Dropping the
//! handle without committing removes the temp directory and leaves the final
//! paths untouched.
//!
//! Temp directories live next to the first final path, named
//! `.seqflow-tx-<final_name>-<random>`, so renames stay on one filesystem.
//! Leftovers from an interrupted attempt at the same final name are removed
//! when a new transaction begins.

use std::future::Future;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

const PREFIX: &str = ".seqflow-tx-";
/// Length of the random suffix on temp directory names.
const SUFFIX_LEN: usize = 6;

/// Sidecar suffix rules: `(primary extension, sidecar builder)`.
///
/// `Append` adds a suffix to the full file name, `Replace` swaps the
/// primary extension.
enum Sidecar {
    Append(&'static str),
    Replace(&'static str),
}

const SIDECARS: &[(&str, &[Sidecar])] = &[
    (".bam", &[Sidecar::Append(".bai"), Sidecar::Replace(".bai")]),
    (".cram", &[Sidecar::Append(".crai")]),
    (".vcf.gz", &[Sidecar::Append(".tbi")]),
    (".vcf", &[Sidecar::Append(".idx")]),
    (".fa", &[Sidecar::Append(".fai")]),
];

/// Known sidecar paths for `primary`, e.g. `s1.bam.bai` and `s1.bai`.
pub fn sidecars(primary: &Path) -> Vec<PathBuf> {
    let Some(name) = primary.file_name().and_then(|n| n.to_str()) else {
        return Vec::new();
    };
    let Some((ext, rules)) = SIDECARS.iter().find(|(ext, _)| name.ends_with(ext)) else {
        return Vec::new();
    };
    rules
        .iter()
        .map(|rule| match rule {
            Sidecar::Append(suffix) => primary.with_file_name(format!("{name}{suffix}")),
            Sidecar::Replace(suffix) => {
                let stem = &name[..name.len() - ext.len()];
                primary.with_file_name(format!("{stem}{suffix}"))
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// FileTransaction
// ---------------------------------------------------------------------------

/// Entry point for transactional writes.
pub struct FileTransaction;

impl FileTransaction {
    /// Allocate temp paths for `finals`.
    pub async fn begin(finals: &[PathBuf]) -> Result<TransactionHandle, TransactionError> {
        let first = finals.first().ok_or(TransactionError::NoPaths)?;
        let name = file_name(first)?;
        let dir = first
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();

        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| TransactionError::Io {
                path: dir.clone(),
                source,
            })?;
        remove_stale(&dir, &name).await;

        let prefix = format!("{PREFIX}{name}-");
        let temp_dir = tempfile::Builder::new()
            .prefix(&prefix)
            .rand_bytes(SUFFIX_LEN)
            .tempdir_in(&dir)
            .map_err(|source| TransactionError::Io {
                path: dir.clone(),
                source,
            })?;

        let mut temps = Vec::with_capacity(finals.len());
        for (i, path) in finals.iter().enumerate() {
            let slot = temp_dir.path().join(i.to_string());
            tokio::fs::create_dir(&slot)
                .await
                .map_err(|source| TransactionError::Io {
                    path: slot.clone(),
                    source,
                })?;
            temps.push(slot.join(file_name(path)?));
        }

        tracing::trace!(dir = %temp_dir.path().display(), paths = finals.len(), "transaction started");
        Ok(TransactionHandle {
            dir: temp_dir,
            finals: finals.to_vec(),
            temps,
        })
    }
}

/// Temp paths standing in for a set of final paths.
///
/// Dropping without `commit` rolls back.
#[derive(Debug)]
pub struct TransactionHandle {
    dir: TempDir,
    finals: Vec<PathBuf>,
    temps: Vec<PathBuf>,
}

impl TransactionHandle {
    /// Temp path standing in for the `index`th final path.
    pub fn path(&self, index: usize) -> &Path {
        &self.temps[index]
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.temps
    }

    /// Scratch file inside the temp directory, discarded on commit.
    pub fn scratch(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Move every written temp file (and its sidecars) to its final path.
    ///
    /// Temp paths that were never written are skipped.
    pub async fn commit(self) -> Result<(), TransactionError> {
        for (temp, final_path) in self.temps.iter().zip(&self.finals) {
            if !exists(temp).await {
                continue;
            }
            if let Some(parent) = final_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| TransactionError::Io {
                        path: parent.to_path_buf(),
                        source,
                    })?;
            }
            move_file(temp, final_path).await?;

            for (temp_side, final_side) in sidecars(temp).into_iter().zip(sidecars(final_path)) {
                if exists(&temp_side).await {
                    move_file(&temp_side, &final_side).await?;
                }
            }
            tracing::debug!(path = %final_path.display(), "committed output");
        }
        Ok(())
    }
}

/// Run `f` with temp paths for `finals`, committing only if it succeeds.
///
/// An error from `f` is returned unchanged after the temp files are removed.
pub async fn with_transaction<T, E, F, Fut>(finals: &[PathBuf], f: F) -> Result<T, E>
where
    F: FnOnce(Vec<PathBuf>) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<TransactionError>,
{
    let handle = FileTransaction::begin(finals).await?;
    let value = f(handle.paths().to_vec()).await?;
    handle.commit().await?;
    Ok(value)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn file_name(path: &Path) -> Result<String, TransactionError> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| TransactionError::InvalidPath(path.to_path_buf()))
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Whether `entry` is a temp directory name for final file `name`.
///
/// The random suffix must follow the prefix directly, so a final named
/// `s1.vcf-x` never matches the temp directories of `s1.vcf`.
fn is_temp_dir_for(entry: &str, name: &str) -> bool {
    entry
        .strip_prefix(PREFIX)
        .and_then(|rest| rest.strip_prefix(name))
        .and_then(|rest| rest.strip_prefix('-'))
        .is_some_and(|suffix| {
            suffix.len() == SUFFIX_LEN && suffix.chars().all(|c| c.is_ascii_alphanumeric())
        })
}

/// Remove temp directories for `name` left by interrupted attempts.
async fn remove_stale(dir: &Path, name: &str) {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if !is_temp_dir_for(&entry.file_name().to_string_lossy(), name) {
            continue;
        }
        let path = entry.path();
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => tracing::debug!(path = %path.display(), "removed stale transaction directory"),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove stale transaction directory"),
        }
    }
}

/// Rename, falling back to copy-and-remove across filesystems.
async fn move_file(from: &Path, to: &Path) -> Result<(), TransactionError> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(from, to)
        .await
        .map_err(|source| TransactionError::Io {
            path: to.to_path_buf(),
            source,
        })?;
    if let Err(e) = tokio::fs::remove_file(from).await {
        tracing::warn!(path = %from.display(), error = %e, "failed to remove moved temp file");
    }
    Ok(())
}

/// Errors from transactional writes.
#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    #[error("transaction needs at least one output path")]
    NoPaths,

    #[error("output path {} has no file name", .0.display())]
    InvalidPath(PathBuf),

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<TransactionError> for seqflow_core::tools::ToolError {
    fn from(e: TransactionError) -> Self {
        match e {
            TransactionError::Io { source, .. } => Self::Io(source),
            other => Self::Io(std::io::Error::other(other.to_string())),
        }
    }
}

impl From<TransactionError> for seqflow_types::error::StageError {
    fn from(e: TransactionError) -> Self {
        match e {
            TransactionError::Io { source, .. } => Self::Io(source),
            other => Self::Failed(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
