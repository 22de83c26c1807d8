//! Configuration loading.
//!
//! The system config (`seqflow.toml`) and the run description are TOML files
//! read with `tokio::fs` and deserialized with `toml`. Both are required when
//! named: a missing file is an error, missing sections fall back to serde
//! defaults. Samples can also be discovered from an input directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use seqflow_types::config::{RunDescription, SystemConfig};
use seqflow_types::record::DataRecord;
use serde::de::DeserializeOwned;

/// Errors from loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("run description {} defines stage '{name}' twice", .path.display())]
    DuplicateStage { path: PathBuf, name: String },
}

async fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Load the system config from `path`.
pub async fn load_system_config(path: &Path) -> Result<SystemConfig, ConfigError> {
    let config: SystemConfig = load_toml(path).await?;
    tracing::debug!(
        path = %path.display(),
        backend = %config.backend.kind,
        programs = config.resources.len(),
        "loaded system config"
    );
    Ok(config)
}

/// Load a run description (samples and stage definitions) from `path`.
pub async fn load_run_description(path: &Path) -> Result<RunDescription, ConfigError> {
    let run: RunDescription = load_toml(path).await?;
    let mut seen = std::collections::BTreeSet::new();
    for stage in &run.stages {
        if !seen.insert(stage.name.as_str()) {
            return Err(ConfigError::DuplicateStage {
                path: path.to_path_buf(),
                name: stage.name.clone(),
            });
        }
    }
    tracing::debug!(
        path = %path.display(),
        samples = run.samples.len(),
        stages = run.stages.len(),
        "loaded run description"
    );
    Ok(run)
}

// ---------------------------------------------------------------------------
// Sample discovery
// ---------------------------------------------------------------------------

const READ_EXTENSIONS: &[&str] = &[".fastq.gz", ".fq.gz", ".fastq", ".fq"];
const ALIGNED_EXTENSIONS: &[&str] = &[".bam", ".cram"];
const MATE_SUFFIXES: &[(&str, &str)] = &[("_R1", "_R2"), ("_1", "_2")];

/// Split `name` into (stem, extension) for recognized input files.
fn input_stem(name: &str) -> Option<(&str, &str)> {
    READ_EXTENSIONS
        .iter()
        .chain(ALIGNED_EXTENSIONS)
        .find_map(|ext| name.strip_suffix(ext).map(|stem| (stem, *ext)))
}

/// Build one record per sample from the files in `dir`.
///
/// Aligned files (`.bam`, `.cram`) and single read files become `input`.
/// Read pairs named `<sample>_1`/`<sample>_2` (or `_R1`/`_R2`) become
/// `input` and `input_pair`. Records are ordered by sample name.
pub async fn discover_samples(dir: &Path) -> Result<Vec<DataRecord>, ConfigError> {
    let read_err = |source| ConfigError::Read {
        path: dir.to_path_buf(),
        source,
    };
    let mut entries = tokio::fs::read_dir(dir).await.map_err(read_err)?;
    let mut files: BTreeMap<String, PathBuf> = BTreeMap::new();
    while let Some(entry) = entries.next_entry().await.map_err(read_err)? {
        if entry.file_type().await.map_err(read_err)?.is_file() {
            files.insert(entry.file_name().to_string_lossy().into_owned(), entry.path());
        }
    }

    let mut samples: BTreeMap<String, DataRecord> = BTreeMap::new();
    for (name, path) in &files {
        let Some((stem, ext)) = input_stem(name) else { continue };

        let mate = MATE_SUFFIXES.iter().find_map(|(first, second)| {
            if let Some(sample) = stem.strip_suffix(first) {
                Some((sample, 1))
            } else {
                stem.strip_suffix(second).map(|sample| (sample, 2))
            }
        });
        let (sample, role) = match mate {
            Some((sample, mate)) if READ_EXTENSIONS.contains(&ext) => {
                (sample, if mate == 1 { "input" } else { "input_pair" })
            }
            _ => (stem, "input"),
        };

        let record = samples
            .entry(sample.to_string())
            .or_insert_with(|| DataRecord::new(sample));
        if record.file(role).is_some() {
            tracing::warn!(sample, file = %path.display(), "sample already has this input, skipping");
            continue;
        }
        record.set_file(role, path);
    }

    let records: Vec<DataRecord> = samples.into_values().collect();
    tracing::info!(dir = %dir.display(), samples = records.len(), "discovered samples");
    Ok(records)
}
