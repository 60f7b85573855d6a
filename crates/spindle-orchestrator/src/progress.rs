//! Progress reporting for a running cluster.
//!
//! Workers, the feeder and the output collector emit `ClusterEvent`s; the
//! reporter folds them into a metrics snapshot and broadcasts them to
//! subscribers such as the dashboard.

use serde::{Deserialize, Serialize};
use spindle_training::{InputMode, RunMode};
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::trace;

const EVENT_CAPACITY: usize = 1024;

/// Cluster event types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClusterEvent {
    /// All tasks were spawned.
    ClusterStarted {
        mode: RunMode,
        input_mode: InputMode,
        workers: usize,
        parameter_servers: usize,
    },
    /// A partition was queued for a worker.
    PartitionFed { worker: usize, partition: u64, records: usize },
    /// A gradient was applied to the parameter server.
    StepCompleted { worker: usize, step: u64, loss: f64, examples: usize },
    /// Predictions for a partition were written.
    PartitionWritten { partition: u64, lines: usize },
    /// A worker stopped training and will drain its queue.
    TrainingFinished { worker: usize },
    /// A worker returned successfully.
    WorkerFinished { worker: usize, consumed: u64, drained: u64 },
    /// A worker returned an error.
    WorkerFailed { worker: usize, error: String },
    /// All tasks were joined.
    ClusterStopped { submitted: u64, consumed: u64, drained: u64 },
}

/// Progress metrics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressMetrics {
    pub partitions_fed: u64,
    pub partitions_written: u64,
    pub global_step: u64,
    pub last_loss: Option<f64>,
    pub workers_finished: usize,
    pub workers_failed: usize,
}

/// Progress reporter for a cluster.
#[derive(Debug)]
pub struct ProgressReporter {
    broadcast_tx: broadcast::Sender<ClusterEvent>,
    metrics: Mutex<ProgressMetrics>,
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter {
    #[must_use]
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { broadcast_tx, metrics: Mutex::new(ProgressMetrics::default()) }
    }

    /// Subscribes to cluster events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.broadcast_tx.subscribe()
    }

    #[must_use]
    pub fn snapshot(&self) -> ProgressMetrics {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn emit(&self, event: ClusterEvent) {
        {
            let mut metrics = self.metrics.lock().unwrap_or_else(PoisonError::into_inner);
            match &event {
                ClusterEvent::PartitionFed { .. } => metrics.partitions_fed += 1,
                ClusterEvent::StepCompleted { step, loss, .. } => {
                    metrics.global_step = metrics.global_step.max(*step);
                    metrics.last_loss = Some(*loss);
                }
                ClusterEvent::PartitionWritten { .. } => metrics.partitions_written += 1,
                ClusterEvent::WorkerFinished { .. } => metrics.workers_finished += 1,
                ClusterEvent::WorkerFailed { .. } => metrics.workers_failed += 1,
                _ => {}
            }
        }

        trace!(?event, "Cluster event");
        // No subscribers is fine
        let _ = self.broadcast_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_updates_metrics_and_broadcasts() {
        let reporter = ProgressReporter::new();
        let mut rx = reporter.subscribe();

        reporter.emit(ClusterEvent::StepCompleted { worker: 1, step: 3, loss: 0.25, examples: 10 });
        reporter.emit(ClusterEvent::StepCompleted { worker: 0, step: 2, loss: 0.5, examples: 10 });
        reporter.emit(ClusterEvent::WorkerFailed { worker: 0, error: "boom".to_string() });

        let snapshot = reporter.snapshot();
        assert_eq!(snapshot.global_step, 3);
        assert_eq!(snapshot.last_loss, Some(0.5));
        assert_eq!(snapshot.workers_failed, 1);

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, ClusterEvent::StepCompleted { step: 3, .. }));
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = ClusterEvent::PartitionWritten { partition: 4, lines: 100 };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "partition_written");
        assert_eq!(json["lines"], 100);
    }
}
