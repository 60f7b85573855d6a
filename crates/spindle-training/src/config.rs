use crate::dataset::{FileRecordSource, PairingPolicy};
use crate::error::{TrainingError, TrainingResult};
use clap::{ArgAction, Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;

/// On-disk encoding of the image and label records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum DataFormat {
    /// Comma-separated numeric fields, one record per line.
    #[default]
    #[value(alias = "delimited-text")]
    Csv,
    /// One JSON array per line.
    #[value(alias = "serialized-object")]
    Json,
    /// IDX binaries, the format MNIST is distributed in.
    #[value(alias = "columnar-binary")]
    Idx,
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Csv => f.write_str("csv"),
            Self::Json => f.write_str("json"),
            Self::Idx => f.write_str("idx"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Train,
    Inference,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Train => f.write_str("train"),
            Self::Inference => f.write_str("inference"),
        }
    }
}

/// How records reach the workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum InputMode {
    /// The orchestrator pushes partitions into per-worker queues.
    #[default]
    #[value(alias = "push")]
    Feed,
    /// Each worker reads its own shard from storage.
    #[value(alias = "pull")]
    Direct,
}

impl fmt::Display for InputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Feed => f.write_str("feed"),
            Self::Direct => f.write_str("direct"),
        }
    }
}

/// Parameters for one run. Built once from flags, immutable afterwards.
#[derive(Debug, Clone, PartialEq, Parser, Serialize, Deserialize)]
pub struct RunConfig {
    /// Number of records per batch
    #[arg(long = "batch_size", default_value_t = 100, value_parser = clap::value_parser!(u32).range(1..))]
    pub batch_size: u32,

    /// Number of passes over the training data
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub epochs: u32,

    /// Input data format
    #[arg(long, value_enum, default_value_t = DataFormat::Csv)]
    pub format: DataFormat,

    /// Image records (file or directory of partition files)
    #[arg(long)]
    pub images: PathBuf,

    /// Label records (file or directory of partition files)
    #[arg(long)]
    pub labels: PathBuf,

    /// Whether to train a model or run inference with one
    #[arg(long, value_enum, default_value_t = RunMode::Train)]
    pub mode: RunMode,

    /// Model directory (written by train, read by inference)
    #[arg(long, default_value = "mnist_model")]
    pub model: PathBuf,

    /// Prediction output directory (inference only)
    #[arg(long, default_value = "predictions")]
    pub output: PathBuf,

    /// Partitions buffered per worker queue
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub readers: u32,

    /// Request RDMA transport between workers
    #[arg(
        long,
        action = ArgAction::Set,
        num_args = 0..=1,
        default_value_t = false,
        default_missing_value = "true"
    )]
    pub rdma: bool,

    /// Maximum number of global training steps
    #[arg(long, default_value_t = 1000, value_parser = clap::value_parser!(u64).range(1..))]
    pub steps: u64,

    /// Launch the dashboard event log alongside the cluster
    #[arg(long)]
    pub tensorboard: bool,

    /// SGD learning rate
    #[arg(long = "learning_rate", default_value_t = 0.5)]
    pub learning_rate: f32,

    /// Total executors (workers + parameter servers)
    #[arg(long = "cluster_size", value_parser = clap::value_parser!(u32).range(1..))]
    pub cluster_size: Option<u32>,

    /// Executors reserved for parameter-server shards
    #[arg(long = "num_ps", default_value_t = 1)]
    pub num_ps: u32,

    /// Push partitions to workers (feed) or let workers read their shard (direct)
    #[arg(long = "input_mode", value_enum, default_value_t = InputMode::Feed)]
    pub input_mode: InputMode,

    /// Records per fed partition
    #[arg(long = "partition_size", default_value_t = 1000, value_parser = clap::value_parser!(u32).range(1..))]
    pub partition_size: u32,

    /// Pair images and labels up to the shorter sequence instead of failing
    #[arg(long = "allow_truncation")]
    pub allow_truncation: bool,
}

impl RunConfig {
    /// Build a config from argument tokens (without a program name).
    pub fn from_args<I, T>(args: I) -> TrainingResult<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        let tokens = std::iter::once(OsString::from("spindle")).chain(args.into_iter().map(Into::into));
        let config = Self::try_parse_from(tokens).map_err(|e| TrainingError::InvalidArgument(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the constraints clap cannot express.
    pub fn validate(&self) -> TrainingResult<()> {
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(TrainingError::InvalidArgument(format!(
                "--learning_rate must be a positive number, got {}",
                self.learning_rate
            )));
        }
        if self.model.as_os_str().is_empty() {
            return Err(TrainingError::InvalidArgument("--model must not be empty".to_string()));
        }
        if self.output.as_os_str().is_empty() {
            return Err(TrainingError::InvalidArgument("--output must not be empty".to_string()));
        }
        Ok(())
    }

    #[must_use]
    pub fn pairing_policy(&self) -> PairingPolicy {
        if self.allow_truncation { PairingPolicy::Truncate } else { PairingPolicy::Strict }
    }

    /// Record source over the configured image/label paths.
    #[must_use]
    pub fn record_source(&self) -> FileRecordSource {
        FileRecordSource {
            images: self.images.clone(),
            labels: self.labels.clone(),
            format: self.format,
            policy: self.pairing_policy(),
        }
    }
}
