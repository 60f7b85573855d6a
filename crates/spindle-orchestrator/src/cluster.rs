//! In-process training cluster.
//!
//! `Cluster::run` validates the topology and spawns one tokio task per worker,
//! plus an output collector (inference) and a dashboard (`--tensorboard`).
//! Data reaches workers through bounded per-worker queues, either pushed by
//! `train`/`inference` (feed mode) or read by per-worker reader tasks
//! (direct mode). `shutdown` consumes the handle and joins everything.
//!
//! A failure anywhere in the run raises a cluster-wide flag before the input
//! queues close, so workers never publish artifacts from a failed run and the
//! `_SUCCESS` marker is only written by a clean shutdown.

use crate::dashboard::Dashboard;
use crate::error::{OrchestrationError, Result};
use crate::feed::{self, DataFeed, FeedCounters, Partition, PartitionOutput};
use crate::lifecycle::{RunLifecycle, RunState};
use crate::parameter_server::ParameterServer;
use crate::progress::{ClusterEvent, ProgressMetrics, ProgressReporter};
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use spindle_training::{InputMode, ModelLayout, OutputLayout, RecordSource, RunConfig, RunMode};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Minimum slot count reported by `ClusterResources::detect`.
const MIN_SLOTS: u32 = 4;

/// Shape of the cluster to provision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {
    /// Total executors: workers plus parameter servers.
    pub num_executors: u32,
    /// Executors hosting parameter shards.
    pub num_ps: u32,
    pub tensorboard: bool,
    pub input_mode: InputMode,
}

impl ClusterSpec {
    /// Executor count comes from `--cluster_size`, then `default_size`, then
    /// `num_ps + 2`.
    #[must_use]
    pub fn from_config(config: &RunConfig, default_size: Option<u32>) -> Self {
        let num_executors = config.cluster_size.or(default_size).unwrap_or(config.num_ps + 2);
        Self {
            num_executors,
            num_ps: config.num_ps,
            tensorboard: config.tensorboard,
            input_mode: config.input_mode,
        }
    }

    #[must_use]
    pub fn num_workers(&self) -> u32 {
        self.num_executors.saturating_sub(self.num_ps)
    }

    /// Check the split and that the host can run it.
    pub fn validate(&self, resources: &ClusterResources) -> Result<()> {
        if self.num_workers() == 0 {
            return Err(OrchestrationError::InvalidTopology(format!(
                "{} executors with {} parameter servers leaves no workers",
                self.num_executors, self.num_ps
            )));
        }
        if self.num_executors > resources.slots {
            return Err(OrchestrationError::InsufficientResources {
                requested: self.num_executors,
                available: resources.slots,
            });
        }
        Ok(())
    }
}

/// Executor slots available on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterResources {
    pub slots: u32,
}

impl ClusterResources {
    #[must_use]
    pub fn new(slots: u32) -> Self {
        Self { slots }
    }

    /// `max(available_parallelism, 4)` slots.
    #[must_use]
    pub fn detect() -> Self {
        let cores = std::thread::available_parallelism().map_or(1, |n| n.get() as u32);
        Self { slots: cores.max(MIN_SLOTS) }
    }
}

/// Entry point run by every worker task.
#[async_trait]
pub trait WorkerFn: Send + Sync {
    /// Consume batches from `ctx.feed()` until it is exhausted or the worker
    /// decides to stop. Leftover input is drained after this returns.
    async fn run(&self, ctx: &mut WorkerContext) -> Result<()>;
}

/// Tracks which workers have stopped training, so the chief can wait for them.
#[derive(Debug, Clone)]
pub struct PeerGroup {
    total: usize,
    finished_tx: Arc<watch::Sender<usize>>,
    finished_rx: watch::Receiver<usize>,
}

impl PeerGroup {
    #[must_use]
    pub fn new(total: usize) -> Self {
        let (finished_tx, finished_rx) = watch::channel(0);
        Self { total, finished_tx: Arc::new(finished_tx), finished_rx }
    }

    #[must_use]
    pub fn finished(&self) -> usize {
        *self.finished_rx.borrow()
    }

    fn mark_finished(&self) {
        self.finished_tx.send_modify(|count| *count += 1);
    }

    /// Wait until every worker, including the caller, has finished training.
    pub async fn wait_all(&self) -> Result<()> {
        let mut rx = self.finished_rx.clone();
        let total = self.total;
        rx.wait_for(|count| *count >= total).await.map_err(|_| OrchestrationError::ClusterShutdown)?;
        Ok(())
    }
}

/// Raised once by whichever task hits an error first. Never lowered.
#[derive(Debug, Clone)]
pub(crate) struct FailureFlag(Arc<watch::Sender<bool>>);

impl FailureFlag {
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(watch::Sender::new(false)))
    }

    pub fn raise(&self) {
        self.0.send_replace(true);
    }

    #[must_use]
    pub fn is_raised(&self) -> bool {
        *self.0.borrow()
    }
}

impl Default for FailureFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a worker task can see.
pub struct WorkerContext {
    index: usize,
    num_workers: usize,
    config: Arc<RunConfig>,
    feed: DataFeed,
    params: Arc<ParameterServer>,
    progress: Arc<ProgressReporter>,
    peers: PeerGroup,
    failed: FailureFlag,
    training_finished: bool,
}

impl WorkerContext {
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Worker 0 writes the checkpoint.
    #[must_use]
    pub fn is_chief(&self) -> bool {
        self.index == 0
    }

    #[must_use]
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn feed(&mut self) -> &mut DataFeed {
        &mut self.feed
    }

    #[must_use]
    pub fn params(&self) -> &ParameterServer {
        &self.params
    }

    #[must_use]
    pub fn progress(&self) -> &ProgressReporter {
        &self.progress
    }

    /// Tell peers this worker will not push any more gradients. Idempotent.
    pub fn finish_training(&mut self) {
        if self.training_finished {
            return;
        }
        self.training_finished = true;
        self.peers.mark_finished();
        self.progress.emit(ClusterEvent::TrainingFinished { worker: self.index });
    }

    /// Wait for every worker to call `finish_training`.
    pub async fn wait_for_peers(&self) -> Result<()> {
        self.peers.wait_all().await
    }

    /// Whether feeding, a reader or any worker has failed. Final once
    /// `wait_for_peers` returns.
    #[must_use]
    pub fn run_failed(&self) -> bool {
        self.failed.is_raised()
    }
}

/// Counts reported by a clean shutdown.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub workers: usize,
    pub parameter_servers: usize,
    pub records_submitted: u64,
    pub records_consumed: u64,
    pub records_drained: u64,
    pub global_step: u64,
    pub final_loss: Option<f64>,
    pub partitions_written: u64,
    pub dashboard_events: Option<u64>,
}

/// Handle to a running cluster. Valid until `shutdown`.
pub struct Cluster {
    spec: ClusterSpec,
    config: Arc<RunConfig>,
    lifecycle: RunLifecycle,
    senders: Vec<mpsc::Sender<Partition>>,
    workers: Vec<JoinHandle<Result<()>>>,
    readers: Vec<JoinHandle<Result<u64>>>,
    collector: Option<JoinHandle<Result<u64>>>,
    output: Option<OutputLayout>,
    dashboard: Option<Dashboard>,
    failed: FailureFlag,
    params: Arc<ParameterServer>,
    progress: Arc<ProgressReporter>,
    counters: Arc<FeedCounters>,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("spec", &self.spec)
            .field("state", &self.lifecycle.state())
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

impl Cluster {
    /// Provision the cluster and start its tasks. Must be called from within a
    /// tokio runtime.
    pub fn run(
        worker_fn: Arc<dyn WorkerFn>,
        config: Arc<RunConfig>,
        spec: ClusterSpec,
        resources: &ClusterResources,
    ) -> Result<Self> {
        spec.validate(resources)?;
        let mut lifecycle = RunLifecycle::new();
        let num_workers = spec.num_workers() as usize;

        let params = Arc::new(ParameterServer::new(spec.num_ps as usize, config.learning_rate));
        let progress = Arc::new(ProgressReporter::new());
        let counters = Arc::new(FeedCounters::default());
        let failed = FailureFlag::new();

        let dashboard = if spec.tensorboard {
            let path = match config.mode {
                RunMode::Train => ModelLayout::new(config.model.clone()).events_path(),
                RunMode::Inference => OutputLayout::new(config.output.clone()).events_path(),
            };
            Some(Dashboard::launch(path, progress.subscribe())?)
        } else {
            None
        };

        let (results_tx, collector, output) = match config.mode {
            RunMode::Train => (None, None, None),
            RunMode::Inference => {
                let layout = OutputLayout::new(config.output.clone());
                layout.ensure_dirs().map_err(OrchestrationError::from)?;
                let (tx, rx) = mpsc::unbounded_channel();
                let handle = tokio::spawn(collect_outputs(layout.clone(), rx, Arc::clone(&progress)));
                (Some(tx), Some(handle), Some(layout))
            }
        };

        let peers = PeerGroup::new(num_workers);
        let queue_depth = config.readers.max(1) as usize;
        let mut senders = Vec::with_capacity(num_workers);
        let mut workers = Vec::with_capacity(num_workers);
        for index in 0..num_workers {
            let (tx, rx) = mpsc::channel(queue_depth);
            senders.push(tx);
            let ctx = WorkerContext {
                index,
                num_workers,
                config: Arc::clone(&config),
                feed: DataFeed::new(index, rx, Arc::clone(&counters), results_tx.clone()),
                params: Arc::clone(&params),
                progress: Arc::clone(&progress),
                peers: peers.clone(),
                failed: failed.clone(),
                training_finished: false,
            };
            workers.push(tokio::spawn(worker_main(Arc::clone(&worker_fn), ctx)));
        }
        // Only worker feeds may hold result senders, so the collector ends with them
        drop(results_tx);

        lifecycle.transition(RunState::Running)?;
        info!(
            workers = num_workers,
            parameter_servers = spec.num_ps,
            mode = %config.mode,
            input_mode = %spec.input_mode,
            "Cluster running"
        );
        progress.emit(ClusterEvent::ClusterStarted {
            mode: config.mode,
            input_mode: spec.input_mode,
            workers: num_workers,
            parameter_servers: spec.num_ps as usize,
        });

        Ok(Self {
            spec,
            config,
            lifecycle,
            senders,
            workers,
            readers: Vec::new(),
            collector,
            output,
            dashboard,
            failed,
            params,
            progress,
            counters,
        })
    }

    #[must_use]
    pub fn spec(&self) -> &ClusterSpec {
        &self.spec
    }

    #[must_use]
    pub fn state(&self) -> RunState {
        self.lifecycle.state()
    }

    #[must_use]
    pub fn metrics(&self) -> ProgressMetrics {
        self.progress.snapshot()
    }

    /// Subscribe to cluster events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ClusterEvent> {
        self.progress.subscribe()
    }

    /// Feed every record of `source` to the workers `epochs` times. Returns the
    /// number of partitions fed.
    pub async fn train(&mut self, source: Arc<dyn RecordSource>, epochs: u32) -> Result<u64> {
        self.feed(source, epochs, RunMode::Train).await
    }

    /// Feed every record of `source` once; predictions land in the output directory.
    pub async fn inference(&mut self, source: Arc<dyn RecordSource>) -> Result<u64> {
        self.feed(source, 1, RunMode::Inference).await
    }

    async fn feed(&mut self, source: Arc<dyn RecordSource>, epochs: u32, requested: RunMode) -> Result<u64> {
        if self.spec.input_mode != InputMode::Feed {
            return Err(OrchestrationError::InvalidInputMode(self.spec.input_mode));
        }
        if self.config.mode != requested {
            return Err(OrchestrationError::ModeMismatch { expected: self.config.mode, requested });
        }
        self.lifecycle.transition(RunState::Draining)?;

        let senders = self.senders.clone();
        let counters = Arc::clone(&self.counters);
        let progress = Arc::clone(&self.progress);
        let partition_size = self.config.partition_size as usize;
        let fed = tokio::task::spawn_blocking(move || {
            feed::feed_partitions(source.as_ref(), epochs, partition_size, &senders, &counters, &progress)
        })
        .await
        .map_err(OrchestrationError::from)
        .and_then(|result| result);

        match fed {
            Ok(partitions) => {
                info!(partitions, records = self.counters.submitted(), mode = %requested, "Feeding complete");
                Ok(partitions)
            }
            Err(e) => {
                error!(error = %e, "Feeding failed");
                self.failed.raise();
                self.lifecycle.transition(RunState::Failed)?;
                Err(e)
            }
        }
    }

    /// Direct input mode: start one reader task per worker, each reading its
    /// own shard of `source`. Returns immediately.
    pub fn read_direct(&mut self, source: Arc<dyn RecordSource>, epochs: u32) -> Result<()> {
        if self.spec.input_mode != InputMode::Direct {
            return Err(OrchestrationError::InvalidInputMode(self.spec.input_mode));
        }
        self.lifecycle.transition(RunState::Draining)?;

        let num_workers = self.senders.len();
        let partition_size = self.config.partition_size as usize;
        for (worker, sender) in std::mem::take(&mut self.senders).into_iter().enumerate() {
            let source = Arc::clone(&source);
            let counters = Arc::clone(&self.counters);
            let progress = Arc::clone(&self.progress);
            let failed = self.failed.clone();
            self.readers.push(tokio::task::spawn_blocking(move || {
                let read = feed::read_shard(
                    worker,
                    num_workers,
                    source.as_ref(),
                    epochs,
                    partition_size,
                    &sender,
                    &counters,
                    &progress,
                );
                // Raised while `sender` is alive, before the worker can finish
                if read.is_err() {
                    failed.raise();
                }
                read
            }));
        }
        debug!(readers = self.readers.len(), "Direct readers started");
        Ok(())
    }

    /// Close the input queues, wait for every task and verify that each
    /// submitted record was consumed or drained.
    pub async fn shutdown(mut self) -> Result<ClusterSummary> {
        if self.lifecycle.state() == RunState::Running {
            self.lifecycle.transition(RunState::Draining)?;
        }
        self.senders.clear();

        let mut first_error: Option<OrchestrationError> = None;

        for reader in std::mem::take(&mut self.readers) {
            keep_first(&mut first_error, flatten(reader.await).map(|_| ()));
        }
        for worker in std::mem::take(&mut self.workers) {
            keep_first(&mut first_error, flatten(worker.await));
        }
        let mut partitions_written = 0;
        if let Some(collector) = self.collector.take() {
            match flatten(collector.await) {
                Ok(written) => partitions_written = written,
                Err(e) => keep_first(&mut first_error, Err(e)),
            }
        }
        keep_first(&mut first_error, self.counters.verify());

        let (submitted, consumed, drained) =
            (self.counters.submitted(), self.counters.consumed(), self.counters.drained());
        self.progress.emit(ClusterEvent::ClusterStopped { submitted, consumed, drained });

        let mut dashboard_events = None;
        if let Some(dashboard) = self.dashboard.take() {
            match dashboard.stop().await {
                Ok(events) => dashboard_events = Some(events),
                Err(e) => keep_first(&mut first_error, Err(e)),
            }
        }

        if first_error.is_none()
            && let Some(layout) = &self.output
        {
            keep_first(&mut first_error, write_success_marker(layout).await);
        }

        if first_error.is_some() && self.lifecycle.state() != RunState::Failed {
            self.lifecycle.transition(RunState::Failed)?;
        }
        self.lifecycle.transition(RunState::Shutdown)?;

        if let Some(e) = first_error {
            return Err(e);
        }

        let metrics = self.progress.snapshot();
        let summary = ClusterSummary {
            workers: self.spec.num_workers() as usize,
            parameter_servers: self.spec.num_ps as usize,
            records_submitted: submitted,
            records_consumed: consumed,
            records_drained: drained,
            global_step: self.params.global_step(),
            final_loss: metrics.last_loss,
            partitions_written,
            dashboard_events,
        };
        info!(
            submitted,
            consumed,
            drained,
            global_step = summary.global_step,
            "Cluster shut down"
        );
        Ok(summary)
    }
}

fn keep_first(first_error: &mut Option<OrchestrationError>, result: Result<()>) {
    if let Err(e) = result {
        if first_error.is_none() {
            *first_error = Some(e);
        } else {
            warn!(error = %e, "Additional cluster error");
        }
    }
}

async fn write_success_marker(layout: &OutputLayout) -> Result<()> {
    tokio::fs::write(layout.success_marker(), b"").await?;
    debug!(path = %layout.success_marker().display(), "Output marked complete");
    Ok(())
}

fn flatten<T>(joined: std::result::Result<Result<T>, tokio::task::JoinError>) -> Result<T> {
    joined.map_err(OrchestrationError::from).and_then(|result| result)
}

async fn worker_main(worker_fn: Arc<dyn WorkerFn>, mut ctx: WorkerContext) -> Result<()> {
    let index = ctx.index;
    debug!(worker = index, "Worker started");

    let outcome = match AssertUnwindSafe(worker_fn.run(&mut ctx)).catch_unwind().await {
        Ok(result) => result,
        Err(_) => Err(OrchestrationError::Worker { worker: index, reason: "worker panicked".to_string() }),
    };

    if outcome.is_err() {
        ctx.failed.raise();
    }
    ctx.finish_training();
    let drained = ctx.feed.drain().await;

    match &outcome {
        Ok(()) => {
            debug!(worker = index, consumed = ctx.feed.consumed(), drained, "Worker finished");
            ctx.progress.emit(ClusterEvent::WorkerFinished {
                worker: index,
                consumed: ctx.feed.consumed(),
                drained: ctx.feed.drained(),
            });
        }
        Err(e) => {
            error!(worker = index, error = %e, "Worker failed");
            ctx.progress.emit(ClusterEvent::WorkerFailed { worker: index, error: e.to_string() });
        }
    }
    outcome
}

async fn collect_outputs(
    layout: OutputLayout,
    mut rx: mpsc::UnboundedReceiver<PartitionOutput>,
    progress: Arc<ProgressReporter>,
) -> Result<u64> {
    let mut written = 0;
    while let Some(output) = rx.recv().await {
        let mut content = output.lines.join("\n");
        content.push('\n');
        tokio::fs::write(layout.part_path(output.index), content).await?;
        progress.emit(ClusterEvent::PartitionWritten { partition: output.index, lines: output.lines.len() });
        written += 1;
    }
    debug!(partitions = written, "Output collector finished");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use spindle_training::{synthetic_records, MemoryRecordSource};
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::TempDir;

    fn config(args: &[&str]) -> Arc<RunConfig> {
        let mut tokens = vec!["--images", "unused", "--labels", "unused"];
        tokens.extend_from_slice(args);
        Arc::new(RunConfig::from_args(tokens).unwrap())
    }

    /// Counts records without training.
    struct CountingWorker(Arc<AtomicU64>);

    #[async_trait]
    impl WorkerFn for CountingWorker {
        async fn run(&self, ctx: &mut WorkerContext) -> Result<()> {
            let size = ctx.config().batch_size as usize;
            while let Some(batch) = ctx.feed().next_batch(size).await {
                self.0.fetch_add(batch.len() as u64, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    struct FailingWorker;

    #[async_trait]
    impl WorkerFn for FailingWorker {
        async fn run(&self, ctx: &mut WorkerContext) -> Result<()> {
            Err(OrchestrationError::Worker { worker: ctx.index(), reason: "no model".to_string() })
        }
    }

    #[test]
    fn test_spec_defaults_and_validation() {
        let cfg = config(&[]);
        let spec = ClusterSpec::from_config(&cfg, None);
        assert_eq!(spec.num_executors, 3);
        assert_eq!(spec.num_workers(), 2);
        spec.validate(&ClusterResources::new(4)).unwrap();

        let spec = ClusterSpec::from_config(&cfg, Some(6));
        assert!(matches!(
            spec.validate(&ClusterResources::new(4)),
            Err(OrchestrationError::InsufficientResources { requested: 6, available: 4 })
        ));

        let cfg = config(&["--cluster_size", "2", "--num_ps", "2"]);
        let spec = ClusterSpec::from_config(&cfg, Some(6));
        assert!(matches!(spec.validate(&ClusterResources::new(4)), Err(OrchestrationError::InvalidTopology(_))));

        assert!(ClusterResources::detect().slots >= MIN_SLOTS);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_feed_reaches_every_worker() {
        let cfg = config(&["--batch_size", "7", "--partition_size", "10", "--readers", "2"]);
        let spec = ClusterSpec::from_config(&cfg, Some(4));
        let seen = Arc::new(AtomicU64::new(0));
        let mut cluster =
            Cluster::run(Arc::new(CountingWorker(Arc::clone(&seen))), cfg, spec, &ClusterResources::new(4)).unwrap();

        let source = Arc::new(MemoryRecordSource::new(synthetic_records(95, 2)));
        assert_eq!(cluster.train(source, 2).await.unwrap(), 20);
        assert_eq!(cluster.state(), RunState::Draining);

        let summary = cluster.shutdown().await.unwrap();
        assert_eq!(summary.workers, 3);
        assert_eq!(summary.records_submitted, 190);
        assert_eq!(summary.records_consumed, 190);
        assert_eq!(seen.load(Ordering::SeqCst), 190);
    }

    #[tokio::test]
    async fn test_wrong_mode_and_input_mode_rejected() {
        let cfg = config(&["--input_mode", "direct"]);
        let spec = ClusterSpec::from_config(&cfg, None);
        let seen = Arc::new(AtomicU64::new(0));
        let mut cluster =
            Cluster::run(Arc::new(CountingWorker(seen)), Arc::clone(&cfg), spec, &ClusterResources::new(4)).unwrap();

        let source: Arc<dyn RecordSource> = Arc::new(MemoryRecordSource::new(synthetic_records(5, 2)));
        assert!(matches!(
            cluster.train(Arc::clone(&source), 1).await,
            Err(OrchestrationError::InvalidInputMode(InputMode::Direct))
        ));
        assert!(matches!(
            cluster.inference(source).await,
            Err(OrchestrationError::InvalidInputMode(InputMode::Direct))
        ));
        cluster.shutdown().await.unwrap();

        let cfg = config(&[]);
        let spec = ClusterSpec::from_config(&cfg, None);
        let mut cluster =
            Cluster::run(Arc::new(FailingWorker), cfg, spec, &ClusterResources::new(4)).unwrap();
        let source = Arc::new(MemoryRecordSource::new(synthetic_records(5, 2)));
        assert!(matches!(
            cluster.inference(source).await,
            Err(OrchestrationError::ModeMismatch { expected: RunMode::Train, requested: RunMode::Inference })
        ));
        assert!(matches!(cluster.shutdown().await, Err(OrchestrationError::Worker { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_worker_still_drains() {
        let cfg = config(&["--partition_size", "5", "--readers", "1"]);
        let spec = ClusterSpec::from_config(&cfg, None);
        let mut cluster = Cluster::run(Arc::new(FailingWorker), cfg, spec, &ClusterResources::new(4)).unwrap();

        let source = Arc::new(MemoryRecordSource::new(synthetic_records(50, 2)));
        cluster.train(source, 1).await.unwrap();

        let err = cluster.shutdown().await.unwrap_err();
        assert!(matches!(err, OrchestrationError::Worker { reason, .. } if reason == "no model"));
    }

    #[tokio::test]
    async fn test_peer_group_waits_for_all() {
        let peers = PeerGroup::new(2);
        peers.mark_finished();
        assert_eq!(peers.finished(), 1);

        let waiter = peers.clone();
        let handle = tokio::spawn(async move { waiter.wait_all().await });
        peers.mark_finished();
        handle.await.unwrap().unwrap();
    }

    /// Emits one line per inference record.
    struct EchoWorker;

    #[async_trait]
    impl WorkerFn for EchoWorker {
        async fn run(&self, ctx: &mut WorkerContext) -> Result<()> {
            while let Some(batch) = ctx.feed().next_batch(4).await {
                let lines = batch.iter().map(|r| format!("label {:?}", r.label_class())).collect();
                ctx.feed().batch_results(lines)?;
            }
            Ok(())
        }
    }

    async fn run_inference(worker: Arc<dyn WorkerFn>, output: &std::path::Path) -> Result<ClusterSummary> {
        let cfg = config(&["--mode", "inference", "--output", output.to_str().unwrap(), "--partition_size", "5"]);
        let spec = ClusterSpec::from_config(&cfg, None);
        let mut cluster = Cluster::run(worker, cfg, spec, &ClusterResources::new(4)).unwrap();
        cluster.inference(Arc::new(MemoryRecordSource::new(synthetic_records(12, 2)))).await.unwrap();
        cluster.shutdown().await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_success_marker_only_after_clean_inference() {
        let temp = TempDir::new().unwrap();

        let failed = temp.path().join("failed");
        assert!(run_inference(Arc::new(FailingWorker), &failed).await.is_err());
        assert!(failed.exists());
        assert!(!failed.join("_SUCCESS").exists());

        let clean = temp.path().join("clean");
        let summary = run_inference(Arc::new(EchoWorker), &clean).await.unwrap();
        assert_eq!(summary.partitions_written, 3);
        assert!(clean.join("_SUCCESS").exists());
    }

    #[test]
    fn test_failure_flag_is_shared() {
        let flag = FailureFlag::new();
        let seen_by_worker = flag.clone();
        assert!(!seen_by_worker.is_raised());
        flag.raise();
        assert!(seen_by_worker.is_raised());
    }

    #[tokio::test]
    async fn test_inference_collector_writes_parts_only() {
        let temp = TempDir::new().unwrap();
        let output = temp.path().join("predictions");
        let layout = OutputLayout::new(output.clone());
        layout.ensure_dirs().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(collect_outputs(layout, rx, Arc::new(ProgressReporter::new())));

        tx.send(PartitionOutput { index: 1, lines: vec!["a".to_string(), "b".to_string()] }).unwrap();
        drop(tx);

        assert_eq!(handle.await.unwrap().unwrap(), 1);
        assert_eq!(std::fs::read_to_string(output.join("part-00001")).unwrap(), "a\nb\n");
        assert!(!output.join("_SUCCESS").exists());
    }
}
