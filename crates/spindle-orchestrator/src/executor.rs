//! End-to-end run execution.
//!
//! `RunExecutor::execute` performs one invocation of the workflow:
//! precondition checks, cluster start, train-or-infer, drained shutdown and
//! the postcondition listing of the resulting artifacts.

use crate::cluster::{Cluster, ClusterResources, ClusterSpec, ClusterSummary, WorkerFn};
use crate::error::Result;
use crate::mnist::MnistWorker;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use spindle_training::artifacts::make_artifact;
use spindle_training::{
    clear_path, count_lines, list_dir, ArtifactKind, InputMode, ListedEntry, ModelLayout, RecordSource, RunConfig,
    RunId, RunManifest, RunMetrics, RunMode,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub mode: RunMode,
    pub input_mode: InputMode,
    pub cluster: ClusterSummary,
    /// Model directory (train) or output directory (inference).
    pub artifact_dir: PathBuf,
    pub artifacts: Vec<ListedEntry>,
    /// Set in train mode.
    pub manifest: Option<PathBuf>,
    /// Set in inference mode.
    pub prediction_lines: Option<usize>,
}

/// Drives a single train or inference run.
pub struct RunExecutor {
    config: Arc<RunConfig>,
    resources: ClusterResources,
    default_cluster_size: Option<u32>,
    worker: Arc<dyn WorkerFn>,
}

impl std::fmt::Debug for RunExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunExecutor")
            .field("config", &self.config)
            .field("resources", &self.resources)
            .field("default_cluster_size", &self.default_cluster_size)
            .finish_non_exhaustive()
    }
}

impl RunExecutor {
    /// An executor running `MnistWorker` on this host's detected slots.
    #[must_use]
    pub fn new(config: RunConfig) -> Self {
        Self {
            config: Arc::new(config),
            resources: ClusterResources::detect(),
            default_cluster_size: None,
            worker: Arc::new(MnistWorker),
        }
    }

    #[must_use]
    pub fn with_resources(mut self, resources: ClusterResources) -> Self {
        self.resources = resources;
        self
    }

    /// Executor count used when `--cluster_size` is not given.
    #[must_use]
    pub fn with_default_cluster_size(mut self, size: Option<u32>) -> Self {
        self.default_cluster_size = size;
        self
    }

    #[must_use]
    pub fn with_worker(mut self, worker: Arc<dyn WorkerFn>) -> Self {
        self.worker = worker;
        self
    }

    #[must_use]
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub async fn execute(&self) -> Result<RunReport> {
        let config = &self.config;
        let run_id = RunId::new();
        info!(run_id = %run_id, mode = %config.mode, input_mode = %config.input_mode, "Starting run");

        self.precheck()?;
        if config.rdma {
            warn!("RDMA requested; in-process workers exchange data over channels, so the flag has no effect");
        }

        let spec = ClusterSpec::from_config(config, self.default_cluster_size);
        let mut cluster = Cluster::run(Arc::clone(&self.worker), Arc::clone(config), spec, &self.resources)?;
        let source: Arc<dyn RecordSource> = Arc::new(config.record_source());

        let dispatched = match (config.input_mode, config.mode) {
            (InputMode::Feed, RunMode::Train) => cluster.train(source, config.epochs).await.map(|_| ()),
            (InputMode::Feed, RunMode::Inference) => cluster.inference(source).await.map(|_| ()),
            (InputMode::Direct, RunMode::Train) => cluster.read_direct(source, config.epochs),
            (InputMode::Direct, RunMode::Inference) => cluster.read_direct(source, 1),
        };
        if let Err(e) = dispatched {
            if let Err(shutdown_err) = cluster.shutdown().await {
                warn!(error = %shutdown_err, "Shutdown after failed run also reported an error");
            }
            return Err(e);
        }

        let summary = cluster.shutdown().await?;
        self.postcheck(run_id, summary)
    }

    /// List the inputs and clear the directory this run will produce.
    fn precheck(&self) -> Result<()> {
        let config = &self.config;
        for input in [&config.images, &config.labels] {
            let entries = list_dir(input)?;
            debug!(path = %input.display(), entries = entries.len(), "Input listed");
        }

        let target = self.artifact_dir();
        let removed = clear_path(&target)?;
        info!(path = %target.display(), removed, "Cleared previous {} output", config.mode);
        Ok(())
    }

    fn postcheck(&self, run_id: RunId, summary: ClusterSummary) -> Result<RunReport> {
        let config = &self.config;
        let artifact_dir = self.artifact_dir();

        let (manifest, prediction_lines) = match config.mode {
            RunMode::Train => {
                let layout = ModelLayout::new(artifact_dir.clone());
                let mut artifacts = vec![make_artifact(ArtifactKind::Checkpoint, layout.checkpoint_path())?];
                if layout.events_path().exists() {
                    artifacts.push(make_artifact(ArtifactKind::Events, layout.events_path())?);
                }
                let manifest = RunManifest {
                    run_id: run_id.clone(),
                    created_at: Utc::now(),
                    mode: config.mode,
                    config: config.as_ref().clone(),
                    metrics: RunMetrics {
                        final_loss: summary.final_loss,
                        global_step: Some(summary.global_step),
                        records_consumed: Some(summary.records_consumed),
                    },
                    artifacts,
                };
                manifest.write(&layout.manifest_path())?;
                (Some(layout.manifest_path()), None)
            }
            RunMode::Inference => (None, Some(count_lines(&artifact_dir)?)),
        };

        let artifacts = list_dir(&artifact_dir)?;
        for entry in &artifacts {
            info!(name = %entry.name, size = entry.size, dir = entry.is_dir, "Artifact");
        }

        Ok(RunReport {
            run_id,
            mode: config.mode,
            input_mode: config.input_mode,
            cluster: summary,
            artifact_dir,
            artifacts,
            manifest,
            prediction_lines,
        })
    }

    fn artifact_dir(&self) -> PathBuf {
        match self.config.mode {
            RunMode::Train => self.config.model.clone(),
            RunMode::Inference => self.config.output.clone(),
        }
    }
}
