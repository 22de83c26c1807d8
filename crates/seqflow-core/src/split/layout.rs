//! Chunk path layout.
//!
//! Chunks of `<dir>/<base><ext>` live at
//! `<dir>/<base>-split/<base>-<key><ext>`.

use std::path::{Path, PathBuf};

/// Compressed wrappers that keep the inner extension, e.g. `.vcf.gz`.
const COMPRESSED: &[&str] = &["gz", "bgz", "bz2"];

/// Split a file name into its base and full extension (including the dot).
///
/// Compound extensions such as `.vcf.gz` stay together.
pub fn split_extension(path: &Path) -> (String, String) {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let Some((stem, last)) = name.rsplit_once('.') else {
        return (name, String::new());
    };
    if stem.is_empty() {
        return (name, String::new());
    }
    if COMPRESSED.contains(&last) {
        if let Some((base, inner)) = stem.rsplit_once('.') {
            if !base.is_empty() && !inner.is_empty() {
                return (base.to_string(), format!(".{inner}.{last}"));
            }
        }
    }
    (stem.to_string(), format!(".{last}"))
}

/// Directory holding the chunks of `parent`.
pub fn split_dir(parent: &Path) -> PathBuf {
    let (base, _) = split_extension(parent);
    parent_dir(parent).join(format!("{base}-split"))
}

/// Path of the chunk of `parent` identified by `key`.
pub fn chunk_path(parent: &Path, key: &str) -> PathBuf {
    let (base, ext) = split_extension(parent);
    split_dir(parent).join(format!("{base}-{key}{ext}"))
}

/// Scratch path inside the split directory, e.g. for name-sorted input.
pub fn scratch_path(parent: &Path, suffix: &str) -> PathBuf {
    let (base, _) = split_extension(parent);
    split_dir(parent).join(format!("{base}-{suffix}"))
}

fn parent_dir(path: &Path) -> &Path {
    path.parent().unwrap_or_else(|| Path::new("."))
}
