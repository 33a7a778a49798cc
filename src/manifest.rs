//! Building descriptor lists for the binary, and writing back the ones that
//! failed so a later run can retry only those.

use crate::types::{TransferResult, UploadDescriptor};
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::io::Write as _;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Remote key for `relative`, always `/`-separated, under `prefix`.
pub fn object_key(prefix: &str, relative: &Path) -> String {
    let mut parts: Vec<String> = prefix
        .split('/')
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();
    for component in relative.components() {
        if let Component::Normal(part) = component {
            parts.push(part.to_string_lossy().into_owned());
        }
    }
    parts.join("/")
}

/// One upload per regular file under `root`, in file-name order.
/// Symlinks are not followed; unreadable entries are skipped.
pub fn enumerate_uploads(root: &Path, prefix: &str) -> Result<Vec<UploadDescriptor>> {
    let meta = std::fs::metadata(root)
        .with_context(|| format!("Cannot read upload source {}", root.display()))?;
    if meta.is_file() {
        let name = root.file_name().map(PathBuf::from).unwrap_or_default();
        return Ok(vec![UploadDescriptor::new(root, object_key(prefix, &name))]);
    }

    let mut out = Vec::new();
    for entry in WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        out.push(UploadDescriptor::new(entry.path(), object_key(prefix, relative)));
    }
    Ok(out)
}

/// Total size of the files behind `uploads`, for the job-wide bar.
pub fn total_upload_bytes(uploads: &[UploadDescriptor]) -> u64 {
    uploads
        .iter()
        .filter_map(|d| std::fs::metadata(&d.source_path).ok())
        .map(|m| m.len())
        .sum()
}

/// A JSON array of descriptors.
pub fn read_manifest<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("Invalid manifest {}", path.display()))
}

/// Atomically replace `path` with `items` as pretty JSON.
pub fn write_manifest<T: Serialize>(path: &Path, items: &[T]) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir).ok();
    let data = serde_json::to_vec_pretty(items)?;
    let mut tmp = tempfile::NamedTempFile::new_in(&dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    tmp.write_all(&data)?;
    tmp.flush()?;
    tmp.persist(path)
        .with_context(|| format!("Failed to write manifest {}", path.display()))?;
    Ok(())
}

/// The descriptors whose label matches a failed result.
pub fn failed_subset<T, F>(items: &[T], failures: &[TransferResult], label: F) -> Vec<T>
where
    T: Clone,
    F: Fn(&T) -> String,
{
    let failed: HashSet<&str> = failures
        .iter()
        .filter(|r| !r.is_success())
        .map(TransferResult::source)
        .collect();
    items
        .iter()
        .filter(|item| failed.contains(label(item).as_str()))
        .cloned()
        .collect()
}
