//! Cluster orchestrator for Spindle.
//!
//! Runs data-parallel MNIST training and inference on an in-process cluster:
//! tokio worker tasks fed through bounded queues, a sharded parameter server
//! for asynchronous SGD, and a drained shutdown that accounts for every record.

pub mod cluster;
pub mod dashboard;
pub mod error;
pub mod executor;
pub mod feed;
pub mod lifecycle;
pub mod mnist;
pub mod parameter_server;
pub mod progress;

pub use cluster::{Cluster, ClusterResources, ClusterSpec, ClusterSummary, PeerGroup, WorkerContext, WorkerFn};
pub use dashboard::Dashboard;
pub use error::{OrchestrationError, Result};
pub use executor::{RunExecutor, RunReport};
pub use feed::{DataFeed, FeedCounters, Partition, PartitionOutput};
pub use lifecycle::{RunLifecycle, RunState};
pub use mnist::MnistWorker;
pub use parameter_server::ParameterServer;
pub use progress::{ClusterEvent, ProgressMetrics, ProgressReporter};
