use crate::error::TrainingResult;
use std::path::{Path, PathBuf};

/// Files inside a model directory.
///
/// ```text
/// <model>/checkpoint.json
/// <model>/run_manifest.json
/// <model>/events.jsonl        (with --tensorboard)
/// ```
#[derive(Debug, Clone)]
pub struct ModelLayout {
    root: PathBuf,
}

impl ModelLayout {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn checkpoint_path(&self) -> PathBuf {
        self.root.join("checkpoint.json")
    }

    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.root.join("run_manifest.json")
    }

    #[must_use]
    pub fn events_path(&self) -> PathBuf {
        self.root.join("events.jsonl")
    }

    pub fn ensure_dirs(&self) -> TrainingResult<()> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }
}

/// Files inside a prediction output directory. Underscore-prefixed names are
/// skipped when the directory is read back as partitions.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn part_path(&self, index: u64) -> PathBuf {
        self.root.join(format!("part-{index:05}"))
    }

    #[must_use]
    pub fn success_marker(&self) -> PathBuf {
        self.root.join("_SUCCESS")
    }

    #[must_use]
    pub fn events_path(&self) -> PathBuf {
        self.root.join("_events.jsonl")
    }

    pub fn ensure_dirs(&self) -> TrainingResult<()> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }
}
