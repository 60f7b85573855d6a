use std::path::PathBuf;
use thiserror::Error;

pub type TrainingResult<T> = std::result::Result<T, TrainingError>;

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("failed to parse {}:{line}: {reason}", .path.display())]
    Parse { path: PathBuf, line: usize, reason: String },

    #[error("image/label length mismatch: {images} image records vs {labels} label records")]
    LengthMismatch { images: usize, labels: usize },

    #[error("model error: {0}")]
    Model(String),

    #[error("artifact error: {0}")]
    Artifact(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
