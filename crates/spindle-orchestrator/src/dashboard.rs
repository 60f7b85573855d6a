//! Event-log dashboard launched with `--tensorboard`.
//!
//! Subscribes to the cluster's progress broadcast and appends one JSON object
//! per event to a log file until it is stopped at shutdown.

use crate::error::Result;
use crate::progress::ClusterEvent;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Serialize)]
struct EventRecord<'a> {
    time: DateTime<Utc>,
    #[serde(flatten)]
    event: &'a ClusterEvent,
}

#[derive(Debug)]
pub struct Dashboard {
    path: PathBuf,
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<Result<u64>>,
}

impl Dashboard {
    /// Create the log file and start writing events from `events`.
    pub fn launch(path: PathBuf, events: broadcast::Receiver<ClusterEvent>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // A bad path fails the launch rather than the first write
        let writer = BufWriter::new(File::from_std(std::fs::File::create(&path)?));
        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(record_events(writer, events, stop_rx));
        info!(path = %path.display(), "Dashboard event log started");
        Ok(Self { path, stop_tx, handle })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush pending events and close the log. Returns the number of events written.
    pub async fn stop(self) -> Result<u64> {
        // The task may already have exited on a closed channel
        let _ = self.stop_tx.send(());
        let written = self.handle.await??;
        info!(path = %self.path.display(), events = written, "Dashboard event log closed");
        Ok(written)
    }
}

async fn record_events(
    mut writer: BufWriter<File>,
    mut events: broadcast::Receiver<ClusterEvent>,
    mut stop_rx: oneshot::Receiver<()>,
) -> Result<u64> {
    let mut written = 0;
    loop {
        tokio::select! {
            biased;
            _ = &mut stop_rx => break,
            received = events.recv() => match received {
                Ok(event) => {
                    write_event(&mut writer, &event).await?;
                    written += 1;
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Dashboard fell behind; events dropped"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    // Events emitted just before the stop signal
    loop {
        match events.try_recv() {
            Ok(event) => {
                write_event(&mut writer, &event).await?;
                written += 1;
            }
            Err(TryRecvError::Lagged(skipped)) => warn!(skipped, "Dashboard fell behind; events dropped"),
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }

    writer.flush().await?;
    Ok(written)
}

async fn write_event(writer: &mut BufWriter<File>, event: &ClusterEvent) -> Result<()> {
    let mut line = serde_json::to_vec(&EventRecord { time: Utc::now(), event })?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    Ok(())
}
