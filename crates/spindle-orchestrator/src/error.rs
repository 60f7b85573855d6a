// Error types for cluster orchestration

use crate::lifecycle::RunState;
use spindle_training::{InputMode, RunMode, TrainingError};
use thiserror::Error;

/// Result type for orchestration operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

/// Orchestration errors
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// More executors were requested than the host can run
    #[error("Insufficient resources: {requested} executors requested, {available} slots available")]
    InsufficientResources {
        /// Executors requested
        requested: u32,
        /// Slots available
        available: u32,
    },

    /// The executor/parameter-server split leaves no usable cluster
    #[error("Invalid topology: {0}")]
    InvalidTopology(String),

    /// Lifecycle transition not allowed from the current state
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition {
        /// Current state
        from: RunState,
        /// Requested state
        to: RunState,
    },

    /// Operation not available in the cluster's input mode
    #[error("Operation not supported in {0} input mode")]
    InvalidInputMode(InputMode),

    /// Cluster was started for a different run mode
    #[error("Cluster was started for {expected}, cannot run {requested}")]
    ModeMismatch {
        /// Mode the cluster was started with
        expected: RunMode,
        /// Mode requested by the caller
        requested: RunMode,
    },

    /// A worker failed
    #[error("Worker {worker} failed: {reason}")]
    Worker {
        /// Worker index
        worker: usize,
        /// Failure description
        reason: String,
    },

    /// Records were lost between feeding and consumption
    #[error("Drain incomplete: {submitted} records submitted, {consumed} consumed, {drained} drained")]
    Drain {
        /// Records pushed into worker queues
        submitted: u64,
        /// Records taken by workers
        consumed: u64,
        /// Records discarded by workers
        drained: u64,
    },

    /// A cluster channel closed before its peer finished
    #[error("Cluster is shut down")]
    ClusterShutdown,

    /// Data, model or artifact error
    #[error(transparent)]
    Training(#[from] TrainingError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A spawned task could not be joined
    #[error("Task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Other error
    #[error("Orchestration error: {0}")]
    Other(String),
}
