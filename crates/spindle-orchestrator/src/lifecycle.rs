//! Cluster lifecycle management.
//!
//! A cluster moves `Created → Running → Draining → Shutdown`. Any failure while
//! feeding moves it to `Failed`, from which only `Shutdown` is reachable.

use crate::error::{OrchestrationError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, error};

/// Cluster execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Topology validated, tasks not yet started.
    Created,
    /// Workers are running and waiting for data.
    Running,
    /// Data has been (or is being) fed; waiting for workers to finish.
    Draining,
    /// All tasks joined.
    Shutdown,
    /// Feeding failed.
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Shutdown => "shutdown",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

impl RunState {
    /// Checks if the cluster can transition to the given state.
    #[must_use]
    #[allow(clippy::match_same_arms)] // Each arm represents a distinct state transition rule
    pub fn can_transition_to(&self, to: Self) -> bool {
        match (self, to) {
            (Self::Created, Self::Running | Self::Failed) => true,
            (Self::Running, Self::Draining | Self::Failed) => true,
            (Self::Draining, Self::Shutdown | Self::Failed) => true,
            (Self::Failed, Self::Shutdown) => true,
            // Same state is always valid
            (a, b) if *a == b => true,
            _ => false,
        }
    }

    /// Whether the state is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Shutdown)
    }
}

/// Lifecycle of one cluster, owned by its handle.
#[derive(Debug)]
pub struct RunLifecycle {
    state: RunState,
    history: Vec<RunState>,
}

impl Default for RunLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl RunLifecycle {
    #[must_use]
    pub fn new() -> Self {
        Self { state: RunState::Created, history: vec![RunState::Created] }
    }

    #[must_use]
    pub fn state(&self) -> RunState {
        self.state
    }

    /// States visited so far, in order, without repeats.
    #[must_use]
    pub fn history(&self) -> &[RunState] {
        &self.history
    }

    /// Moves to `to`, returning the previous state.
    pub fn transition(&mut self, to: RunState) -> Result<RunState> {
        let from = self.state;
        if !from.can_transition_to(to) {
            error!(from = %from, to = %to, "Invalid state transition");
            return Err(OrchestrationError::InvalidTransition { from, to });
        }

        if from != to {
            debug!(from = %from, to = %to, "State transition");
            self.history.push(to);
        }
        self.state = to;
        Ok(from)
    }
}
