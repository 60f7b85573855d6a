//! Moving records from storage into workers.
//!
//! The feeding side splits a record source into numbered partitions and sends
//! them into bounded per-worker queues. The worker side (`DataFeed`) regroups
//! queued partitions into batches, routes inference results back to their
//! partitions and discards whatever is left once the worker stops.

use crate::error::{OrchestrationError, Result};
use crate::progress::{ClusterEvent, ProgressReporter};
use spindle_training::{PairedRecord, RecordSource};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// A numbered chunk of paired records.
#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    pub index: u64,
    pub records: Vec<PairedRecord>,
}

/// Prediction lines for one completed partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionOutput {
    pub index: u64,
    pub lines: Vec<String>,
}

/// Cluster-wide record accounting.
#[derive(Debug, Default)]
pub struct FeedCounters {
    submitted: AtomicU64,
    consumed: AtomicU64,
    drained: AtomicU64,
}

impl FeedCounters {
    #[must_use]
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn drained(&self) -> u64 {
        self.drained.load(Ordering::SeqCst)
    }

    /// Every submitted record was either consumed or drained.
    pub fn verify(&self) -> Result<()> {
        let (submitted, consumed, drained) = (self.submitted(), self.consumed(), self.drained());
        if consumed + drained != submitted {
            return Err(OrchestrationError::Drain { submitted, consumed, drained });
        }
        Ok(())
    }
}

/// Split `source` into partitions of at most `partition_size` records,
/// re-opening it once per epoch. Partition indices keep counting across
/// epochs. Returns the number of partitions produced.
pub(crate) fn for_each_partition(
    source: &dyn RecordSource,
    epochs: u32,
    partition_size: usize,
    mut sink: impl FnMut(Partition) -> Result<()>,
) -> Result<u64> {
    let partition_size = partition_size.max(1);
    let mut index = 0u64;
    for epoch in 0..epochs {
        let mut stream = source.open()?;
        loop {
            let mut records = Vec::with_capacity(partition_size);
            for record in stream.by_ref().take(partition_size) {
                records.push(record?);
            }
            if records.is_empty() {
                break;
            }
            let full = records.len() == partition_size;
            sink(Partition { index, records })?;
            index += 1;
            if !full {
                break;
            }
        }
        debug!(epoch, partitions = index, "Epoch read");
    }
    Ok(index)
}

/// Send one partition to a worker queue, blocking while the queue is full.
/// Must run off the async runtime.
pub(crate) fn send_partition(
    worker: usize,
    sender: &mpsc::Sender<Partition>,
    partition: Partition,
    counters: &FeedCounters,
    progress: &ProgressReporter,
) -> Result<()> {
    let (index, records) = (partition.index, partition.records.len());
    sender.blocking_send(partition).map_err(|_| OrchestrationError::Worker {
        worker,
        reason: "input queue closed before feeding finished".to_string(),
    })?;
    counters.submitted.fetch_add(records as u64, Ordering::SeqCst);
    progress.emit(ClusterEvent::PartitionFed { worker, partition: index, records });
    Ok(())
}

/// Round-robin partitions of `source` over `senders`. Blocking.
pub(crate) fn feed_partitions(
    source: &dyn RecordSource,
    epochs: u32,
    partition_size: usize,
    senders: &[mpsc::Sender<Partition>],
    counters: &FeedCounters,
    progress: &ProgressReporter,
) -> Result<u64> {
    if senders.is_empty() {
        return Err(OrchestrationError::ClusterShutdown);
    }
    for_each_partition(source, epochs, partition_size, |partition| {
        let worker = (partition.index % senders.len() as u64) as usize;
        send_partition(worker, &senders[worker], partition, counters, progress)
    })
}

/// Read this worker's share of `source` (partitions whose index is congruent
/// to `worker` modulo `num_workers`). Blocking.
#[allow(clippy::too_many_arguments)]
pub(crate) fn read_shard(
    worker: usize,
    num_workers: usize,
    source: &dyn RecordSource,
    epochs: u32,
    partition_size: usize,
    sender: &mpsc::Sender<Partition>,
    counters: &FeedCounters,
    progress: &ProgressReporter,
) -> Result<u64> {
    let mut kept = 0;
    for_each_partition(source, epochs, partition_size, |partition| {
        if partition.index % num_workers as u64 != worker as u64 {
            return Ok(());
        }
        kept += 1;
        send_partition(worker, sender, partition, counters, progress)
    })?;
    Ok(kept)
}

struct Cursor {
    index: u64,
    records: std::vec::IntoIter<PairedRecord>,
}

struct PendingOutput {
    expected: usize,
    lines: Vec<String>,
}

/// Worker-side view of its input queue.
pub struct DataFeed {
    worker: usize,
    rx: mpsc::Receiver<Partition>,
    counters: Arc<FeedCounters>,
    results_tx: Option<mpsc::UnboundedSender<PartitionOutput>>,
    current: Option<Cursor>,
    last_batch: Vec<(u64, usize)>,
    pending: BTreeMap<u64, PendingOutput>,
    terminated: bool,
    exhausted: bool,
    consumed: u64,
    drained: u64,
}

impl DataFeed {
    pub(crate) fn new(
        worker: usize,
        rx: mpsc::Receiver<Partition>,
        counters: Arc<FeedCounters>,
        results_tx: Option<mpsc::UnboundedSender<PartitionOutput>>,
    ) -> Self {
        Self {
            worker,
            rx,
            counters,
            results_tx,
            current: None,
            last_batch: Vec::new(),
            pending: BTreeMap::new(),
            terminated: false,
            exhausted: false,
            consumed: 0,
            drained: 0,
        }
    }

    /// Next batch of up to `size` records, spanning partitions as needed.
    /// `None` once the queue is closed and empty, or after `terminate`.
    pub async fn next_batch(&mut self, size: usize) -> Option<Vec<PairedRecord>> {
        self.last_batch.clear();
        if self.terminated || size == 0 {
            return None;
        }

        let mut batch = Vec::with_capacity(size);
        while batch.len() < size {
            if self.current.as_ref().is_none_or(|c| c.records.as_slice().is_empty()) {
                let Some(partition) = self.rx.recv().await else {
                    self.exhausted = true;
                    break;
                };
                self.start_partition(partition);
                continue;
            }

            let Some(cursor) = self.current.as_mut() else { break };
            let before = batch.len();
            batch.extend(cursor.records.by_ref().take(size - before));
            let taken = batch.len() - before;
            match self.last_batch.last_mut() {
                Some((index, count)) if *index == cursor.index => *count += taken,
                _ => self.last_batch.push((cursor.index, taken)),
            }
        }

        if batch.is_empty() {
            return None;
        }
        self.consumed += batch.len() as u64;
        self.counters.consumed.fetch_add(batch.len() as u64, Ordering::SeqCst);
        trace!(worker = self.worker, records = batch.len(), "Batch taken");
        Some(batch)
    }

    fn start_partition(&mut self, partition: Partition) {
        if self.results_tx.is_some() && !partition.records.is_empty() {
            self.pending.insert(
                partition.index,
                PendingOutput { expected: partition.records.len(), lines: Vec::with_capacity(partition.records.len()) },
            );
        }
        self.current = Some(Cursor { index: partition.index, records: partition.records.into_iter() });
    }

    /// Hand back one result line per record of the last batch, in order.
    /// Partitions whose results are complete are sent to the output collector.
    pub fn batch_results(&mut self, results: Vec<String>) -> Result<()> {
        let expected: usize = self.last_batch.iter().map(|(_, count)| count).sum();
        if results.len() != expected {
            return Err(OrchestrationError::Worker {
                worker: self.worker,
                reason: format!("{} results for a batch of {expected} records", results.len()),
            });
        }
        let Some(results_tx) = &self.results_tx else {
            return Err(OrchestrationError::Other("feed has no output collector".to_string()));
        };

        let mut results = results.into_iter();
        for (index, count) in std::mem::take(&mut self.last_batch) {
            let Some(pending) = self.pending.get_mut(&index) else {
                return Err(OrchestrationError::Other(format!("no pending output for partition {index}")));
            };
            pending.lines.extend(results.by_ref().take(count));
            if pending.lines.len() == pending.expected {
                if let Some(done) = self.pending.remove(&index) {
                    results_tx
                        .send(PartitionOutput { index, lines: done.lines })
                        .map_err(|_| OrchestrationError::ClusterShutdown)?;
                }
            }
        }
        Ok(())
    }

    /// Stop handing out batches. Queued data must still be drained.
    pub fn terminate(&mut self) {
        if !self.terminated {
            debug!(worker = self.worker, "Feed terminated");
        }
        self.terminated = true;
    }

    #[must_use]
    pub fn should_stop(&self) -> bool {
        self.terminated || self.exhausted
    }

    /// Discard everything still buffered or queued, waiting for the queue to
    /// close. Returns the number of records discarded by this call.
    pub async fn drain(&mut self) -> u64 {
        let mut discarded = self.current.take().map_or(0, |c| c.records.len() as u64);
        while let Some(partition) = self.rx.recv().await {
            discarded += partition.records.len() as u64;
        }
        self.exhausted = true;
        self.last_batch.clear();
        self.drained += discarded;
        self.counters.drained.fetch_add(discarded, Ordering::SeqCst);
        if discarded > 0 {
            debug!(worker = self.worker, discarded, "Drained input queue");
        }
        discarded
    }

    #[must_use]
    pub fn worker(&self) -> usize {
        self.worker
    }

    #[must_use]
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    #[must_use]
    pub fn drained(&self) -> u64 {
        self.drained
    }
}
