// Worker records
// Lifecycle state of each supervised worker and the snapshot view handed to other components

use crate::config::WorkerSpec;
use crate::process::{ProcessHandle, WorkerExit};
use super::restart::RestartHistory;
use std::fmt;
use std::time::Duration;

/// Lifecycle states of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
    /// Process launched, port not yet observed in use
    Starting,

    /// Process alive and listening on its port
    Running,

    /// Shutdown has taken ownership of the worker
    Stopping,

    /// Shut down and verified
    Stopped,

    /// Gave up on the worker (crash loop or failed verification)
    Failed,
}

impl WorkerState {
    /// Transitions only move forward, except the automatic restart path
    /// back to `Starting`.
    pub fn can_transition(self, to: WorkerState) -> bool {
        use WorkerState::*;
        match (self, to) {
            (Starting, Starting) => true,
            (Starting, Running) => true,
            (Running, Starting) => true,
            (Starting | Running, Failed) => true,
            (Starting | Running | Failed, Stopping) => true,
            (Stopping, Stopped | Failed) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerState::Stopped | WorkerState::Failed)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Starting => write!(f, "starting"),
            WorkerState::Running => write!(f, "running"),
            WorkerState::Stopping => write!(f, "stopping"),
            WorkerState::Stopped => write!(f, "stopped"),
            WorkerState::Failed => write!(f, "failed"),
        }
    }
}

/// Mutable part of a worker record, guarded by the supervisor
#[derive(Debug)]
pub(crate) struct WorkerRecord {
    pub spec: WorkerSpec,
    pub handle: Option<ProcessHandle>,
    pub state: WorkerState,
    pub restart_count: u32,
    pub restarts: RestartHistory,
    pub last_exit: Option<WorkerExit>,
}

impl WorkerRecord {
    pub fn new(spec: WorkerSpec) -> Self {
        Self {
            spec,
            handle: None,
            state: WorkerState::Starting,
            restart_count: 0,
            restarts: RestartHistory::default(),
            last_exit: None,
        }
    }

    /// Apply a transition if it is legal. Returns whether it was applied.
    pub fn transition(&mut self, to: WorkerState) -> bool {
        if self.state.can_transition(to) {
            self.state = to;
            true
        } else {
            tracing::debug!(
                worker = %self.spec.id,
                from = %self.state,
                to = %to,
                "Ignoring illegal worker state transition"
            );
            false
        }
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.spec.id.clone(),
            port: self.spec.port,
            state: self.state,
            pid: self.handle.as_ref().map(|h| h.pid()),
            uptime: self.handle.as_ref().filter(|h| h.exit().is_none()).map(|h| h.uptime()),
            restart_count: self.restart_count,
            last_exit: self.last_exit,
        }
    }
}

/// Read-only copy of a worker record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSnapshot {
    pub id: String,
    pub port: u16,
    pub state: WorkerState,
    pub pid: Option<u32>,
    pub uptime: Option<Duration>,
    pub restart_count: u32,
    pub last_exit: Option<WorkerExit>,
}
