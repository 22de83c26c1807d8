//! Filesystem checkpoint store.
//!
//! Markers live at `<work_dir>/checkpoints_<backend>/<seq>-<stage>.done` and
//! hold the RFC 3339 time they were written. Only their presence matters.

use std::path::{Path, PathBuf};

use chrono::Utc;
use seqflow_core::checkpoint::{CheckpointError, CheckpointKey, CheckpointStore, checkpoint_dir_name};
use seqflow_types::config::BackendKind;

use crate::transaction::FileTransaction;

#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// Store for `backend` under `work_dir`.
    pub fn new(work_dir: &Path, backend: BackendKind) -> Self {
        Self {
            dir: work_dir.join(checkpoint_dir_name(backend)),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn marker(&self, key: &CheckpointKey) -> PathBuf {
        self.dir.join(key.file_name())
    }
}

impl CheckpointStore for FileCheckpointStore {
    async fn exists(&self, key: &CheckpointKey) -> Result<bool, CheckpointError> {
        Ok(tokio::fs::try_exists(self.marker(key)).await?)
    }

    async fn mark(&self, key: &CheckpointKey) -> Result<(), CheckpointError> {
        let marker = self.marker(key);
        let tx = FileTransaction::begin(std::slice::from_ref(&marker))
            .await
            .map_err(|e| CheckpointError::Store(e.to_string()))?;
        tokio::fs::write(tx.path(0), format!("{}\n", Utc::now().to_rfc3339())).await?;
        tx.commit()
            .await
            .map_err(|e| CheckpointError::Store(e.to_string()))?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<CheckpointKey>, CheckpointError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(key) = CheckpointKey::parse_file_name(&entry.file_name().to_string_lossy()) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}
