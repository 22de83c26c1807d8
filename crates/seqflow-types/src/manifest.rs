//! Ordered chunk manifests linking a split to its combine.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ManifestError;

/// One partial output awaiting combination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEntry {
    /// Unique key within the manifest (region key or chunk number).
    pub key: String,
    /// Partial output path produced for this chunk.
    pub path: PathBuf,
}

/// Ordered list of partial outputs for a single parent output.
///
/// Order is the combine order. Keys are unique; `push` rejects duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkManifest {
    parent: PathBuf,
    chunks: Vec<ChunkEntry>,
    /// Intermediate files the split produced that are not chunk outputs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    scratch: Vec<PathBuf>,
}

impl ChunkManifest {
    /// An empty manifest for `parent`.
    pub fn new(parent: impl Into<PathBuf>) -> Self {
        Self {
            parent: parent.into(),
            chunks: Vec::new(),
            scratch: Vec::new(),
        }
    }

    /// Build a manifest from `(key, path)` pairs, rejecting duplicate keys.
    pub fn from_entries<I, K, P>(parent: impl Into<PathBuf>, entries: I) -> Result<Self, ManifestError>
    where
        I: IntoIterator<Item = (K, P)>,
        K: Into<String>,
        P: Into<PathBuf>,
    {
        let mut manifest = Self::new(parent);
        for (key, path) in entries {
            manifest.push(key, path)?;
        }
        Ok(manifest)
    }

    /// Append a chunk. Fails if `key` is already present.
    pub fn push(&mut self, key: impl Into<String>, path: impl Into<PathBuf>) -> Result<(), ManifestError> {
        let key = key.into();
        if self.chunks.iter().any(|c| c.key == key) {
            return Err(ManifestError::DuplicateKey(key));
        }
        self.chunks.push(ChunkEntry {
            key,
            path: path.into(),
        });
        Ok(())
    }

    /// Record an intermediate file to clean up alongside the chunks.
    pub fn push_scratch(&mut self, path: impl Into<PathBuf>) {
        self.scratch.push(path.into());
    }

    /// Intermediate files recorded with `push_scratch`.
    pub fn scratch(&self) -> &[PathBuf] {
        &self.scratch
    }

    /// The combined output this manifest reassembles into.
    pub fn parent(&self) -> &Path {
        &self.parent
    }

    /// Chunks in combine order.
    pub fn chunks(&self) -> &[ChunkEntry] {
        &self.chunks
    }

    /// Partial output paths in combine order.
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.chunks.iter().map(|c| c.path.as_path())
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Check the key-uniqueness invariant (used after deserialization).
    pub fn validate(&self) -> Result<(), ManifestError> {
        let mut seen = HashSet::new();
        for chunk in &self.chunks {
            if !seen.insert(chunk.key.as_str()) {
                return Err(ManifestError::DuplicateKey(chunk.key.clone()));
            }
        }
        Ok(())
    }
}
