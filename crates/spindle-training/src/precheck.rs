//! Filesystem checks run before and after a job.

use crate::dataset::partition_entries;
use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListedEntry {
    pub name: String,
    pub path: PathBuf,
    pub is_dir: bool,
    pub size: u64,
}

/// Directory contents in name order. A file lists as itself.
pub fn list_dir(path: &Path) -> TrainingResult<Vec<ListedEntry>> {
    let metadata = std::fs::metadata(path)?;
    if metadata.is_file() {
        let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        return Ok(vec![ListedEntry { name, path: path.to_path_buf(), is_dir: false, size: metadata.len() }]);
    }

    let mut entries = Vec::new();
    for entry in WalkDir::new(path).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| TrainingError::Io(e.into()))?;
        let md = entry.metadata().map_err(|e| TrainingError::Io(e.into()))?;
        entries.push(ListedEntry {
            name: entry.file_name().to_string_lossy().to_string(),
            path: entry.path().to_path_buf(),
            is_dir: md.is_dir(),
            size: if md.is_dir() { 0 } else { md.len() },
        });
    }
    Ok(entries)
}

/// Remove `path` recursively. Returns `false` when there was nothing to remove.
pub fn clear_path(path: &Path) -> TrainingResult<bool> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(md) => md,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };

    if metadata.is_dir() {
        std::fs::remove_dir_all(path)?;
    } else {
        std::fs::remove_file(path)?;
    }
    debug!(path = %path.display(), "cleared");
    Ok(true)
}

/// Non-blank lines across the partition files under `path`. A directory with
/// no partitions holds zero lines.
pub fn count_lines(path: &Path) -> TrainingResult<usize> {
    let mut total = 0;
    for file in partition_entries(path)? {
        let reader = BufReader::new(std::fs::File::open(&file)?);
        for line in reader.lines() {
            if !line?.trim().is_empty() {
                total += 1;
            }
        }
    }
    Ok(total)
}
