// Shutdown sessions and reports
// One session per shutdown attempt; per-worker outcomes and the final exit classification

use crate::process::WorkerExit;
use crate::supervisor::WorkerState;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

/// Phase in which a worker's process actually exited
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExitPhase {
    /// Exited on its own after the graceful stop request (or was already gone)
    Graceful,

    /// Needed SIGTERM
    Terminated,

    /// Needed SIGKILL
    Killed,
}

impl fmt::Display for ExitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitPhase::Graceful => write!(f, "graceful"),
            ExitPhase::Terminated => write!(f, "terminated"),
            ExitPhase::Killed => write!(f, "killed"),
        }
    }
}

/// A post-exit check that did not pass
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationFailure {
    #[error("process {pid} was not reaped")]
    Unreaped { pid: u32 },

    #[error("port {port} still held after verification timeout ({diagnosis})")]
    PortHeld { port: u16, diagnosis: String },

    #[error("process group {pgid} still has members")]
    GroupRemnant { pgid: i32 },
}

/// Recorded per-worker outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    Graceful,
    Terminated,
    Killed,

    /// Already `failed` (crash loop, launch failure) when shutdown began
    FailedBeforeShutdown,

    VerificationFailed,
}

impl fmt::Display for WorkerOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerOutcome::Graceful => write!(f, "graceful"),
            WorkerOutcome::Terminated => write!(f, "terminated"),
            WorkerOutcome::Killed => write!(f, "killed"),
            WorkerOutcome::FailedBeforeShutdown => write!(f, "failed_before_shutdown"),
            WorkerOutcome::VerificationFailed => write!(f, "verification_failed"),
        }
    }
}

/// Everything observed while shutting down one worker
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub id: String,
    pub port: u16,

    /// Supervisor state when shutdown began
    pub prior_state: WorkerState,

    pub exit_phase: ExitPhase,
    pub exit: Option<WorkerExit>,
    pub failures: Vec<VerificationFailure>,

    /// The process outlived the SIGKILL wait
    pub kill_anomaly: bool,

    pub elapsed: Duration,
}

impl WorkerReport {
    pub fn outcome(&self) -> WorkerOutcome {
        if !self.failures.is_empty() {
            return WorkerOutcome::VerificationFailed;
        }
        if self.failed_before_shutdown() {
            return WorkerOutcome::FailedBeforeShutdown;
        }
        match self.exit_phase {
            ExitPhase::Graceful => WorkerOutcome::Graceful,
            ExitPhase::Terminated => WorkerOutcome::Terminated,
            ExitPhase::Killed => WorkerOutcome::Killed,
        }
    }

    pub fn verified(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed_before_shutdown(&self) -> bool {
        self.prior_state == WorkerState::Failed
    }

    fn classification(&self) -> ExitClassification {
        let mut class = match self.exit_phase {
            ExitPhase::Graceful => ExitClassification::Clean,
            ExitPhase::Terminated => ExitClassification::Escalated,
            ExitPhase::Killed => ExitClassification::Killed,
        };
        // Never a graceful exit, even with nothing left to stop
        if self.failed_before_shutdown() {
            class = class.max(ExitClassification::Escalated);
        }
        for failure in &self.failures {
            class = class.max(match failure {
                VerificationFailure::PortHeld { .. } => ExitClassification::PortNotReleased,
                VerificationFailure::Unreaped { .. } | VerificationFailure::GroupRemnant { .. } => {
                    ExitClassification::LingeringProcess
                }
            });
        }
        class
    }
}

/// Unexpected failure inside the shutdown sequence itself
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InternalFault {
    #[error("shutdown coordinator fault: {0}")]
    Coordinator(String),

    #[error("shutdown task for worker '{worker}' failed: {message}")]
    WorkerTask { worker: String, message: String },
}

/// External resource that failed to close
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceFailure {
    pub name: String,
    pub error: String,
}

/// Process exit classification, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExitClassification {
    Clean,
    Escalated,
    Killed,
    PortNotReleased,
    LingeringProcess,
    ResourceCloseFailed,
    WorkerTaskFault,
    CoordinatorFault,
}

impl ExitClassification {
    pub fn code(self) -> i32 {
        match self {
            ExitClassification::Clean => 0,
            ExitClassification::Escalated => 1,
            ExitClassification::Killed => 2,
            ExitClassification::PortNotReleased => 3,
            ExitClassification::LingeringProcess => 4,
            ExitClassification::ResourceCloseFailed => 5,
            ExitClassification::CoordinatorFault => 100,
            ExitClassification::WorkerTaskFault => 101,
        }
    }

    /// Highest-severity condition present
    pub fn classify<'a>(
        workers: impl IntoIterator<Item = &'a WorkerReport>,
        resource_failures: &[ResourceFailure],
        faults: &[InternalFault],
    ) -> Self {
        let mut class = workers
            .into_iter()
            .map(WorkerReport::classification)
            .max()
            .unwrap_or(ExitClassification::Clean);

        if !resource_failures.is_empty() {
            class = class.max(ExitClassification::ResourceCloseFailed);
        }
        for fault in faults {
            class = class.max(match fault {
                InternalFault::Coordinator(_) => ExitClassification::CoordinatorFault,
                InternalFault::WorkerTask { .. } => ExitClassification::WorkerTaskFault,
            });
        }
        class
    }
}

impl fmt::Display for ExitClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ExitClassification::Clean => "all workers exited gracefully",
            ExitClassification::Escalated => "termination signal required",
            ExitClassification::Killed => "forceful kill required",
            ExitClassification::PortNotReleased => "port not released",
            ExitClassification::LingeringProcess => "lingering process detected",
            ExitClassification::ResourceCloseFailed => "external resource failed to close",
            ExitClassification::WorkerTaskFault => "internal fault in a worker shutdown task",
            ExitClassification::CoordinatorFault => "internal fault in the shutdown coordinator",
        };
        write!(f, "{} (exit {})", text, self.code())
    }
}

/// One shutdown attempt
#[derive(Debug)]
pub struct ShutdownSession {
    pub id: Uuid,
    pub reason: String,
    pub started_at: DateTime<Utc>,
    started: Instant,
    outcomes: Mutex<BTreeMap<String, WorkerReport>>,
}

impl ShutdownSession {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            reason: reason.into(),
            started_at: Utc::now(),
            started: Instant::now(),
            outcomes: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn record(&self, report: WorkerReport) {
        self.outcomes.lock().insert(report.id.clone(), report);
    }

    pub fn outcomes(&self) -> BTreeMap<String, WorkerReport> {
        self.outcomes.lock().clone()
    }
}

/// Final result of a shutdown session
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    pub session_id: Uuid,
    pub reason: String,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub workers: BTreeMap<String, WorkerReport>,
    pub resource_failures: Vec<ResourceFailure>,
    pub faults: Vec<InternalFault>,
    pub classification: ExitClassification,
}

impl ShutdownReport {
    pub fn exit_code(&self) -> i32 {
        self.classification.code()
    }

    /// Report for a coordinator that could not run the sequence at all
    pub fn fault(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            session_id: Uuid::nil(),
            reason: reason.into(),
            started_at: Utc::now(),
            elapsed: Duration::ZERO,
            workers: BTreeMap::new(),
            resource_failures: Vec::new(),
            faults: vec![InternalFault::Coordinator(message.into())],
            classification: ExitClassification::CoordinatorFault,
        }
    }
}
