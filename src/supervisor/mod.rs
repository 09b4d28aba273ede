// Worker Supervisor Module
// Source of truth for which workers exist, whether they are alive, and restarting the ones that died

pub mod monitor;
pub mod record;
pub mod restart;

pub use monitor::{HealthMonitor, MonitorHandle};
pub use record::{WorkerSnapshot, WorkerState};
pub use restart::{RestartPolicy, RestartVerdict};

use crate::config::{FleetConfig, WorkerSpec};
use crate::ports::PortRegistry;
use crate::process::{GroupSignal, LaunchSpec, ProcessHandle, SpawnError, WorkerExit};
use crate::shutdown::ShutdownFlag;
use anyhow::Result;
use dashmap::DashMap;
use parking_lot::Mutex;
use record::WorkerRecord;
use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Result of one `restart_if_dead` evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartOutcome {
    /// Process is still running
    Alive,

    /// Worker is not in a restartable state (stopping, stopped, failed, never spawned)
    NotEligible(WorkerState),

    Restarted { pid: u32 },

    /// Dead, but restarting has to wait
    Deferred(DeferReason),

    /// Crash-loop budget used up; worker marked failed
    BudgetExhausted { restarts: u32 },

    /// Shutdown began between deciding to restart and acting on it
    SuppressedByShutdown,

    SpawnFailed(String),

    UnknownWorker,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferReason {
    Backoff(Duration),
    PortHeld(u16),
    GroupRemnant(i32),
}

impl fmt::Display for RestartOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartOutcome::Alive => write!(f, "alive"),
            RestartOutcome::NotEligible(state) => write!(f, "not eligible ({})", state),
            RestartOutcome::Restarted { pid } => write!(f, "restarted as pid {}", pid),
            RestartOutcome::Deferred(DeferReason::Backoff(d)) => {
                write!(f, "deferred, backoff {}ms", d.as_millis())
            }
            RestartOutcome::Deferred(DeferReason::PortHeld(port)) => {
                write!(f, "deferred, port {} still held", port)
            }
            RestartOutcome::Deferred(DeferReason::GroupRemnant(pgid)) => {
                write!(f, "deferred, process group {} not empty", pgid)
            }
            RestartOutcome::BudgetExhausted { restarts } => {
                write!(f, "restart budget exhausted after {} restarts", restarts)
            }
            RestartOutcome::SuppressedByShutdown => write!(f, "suppressed by shutdown"),
            RestartOutcome::SpawnFailed(e) => write!(f, "spawn failed: {}", e),
            RestartOutcome::UnknownWorker => write!(f, "unknown worker"),
        }
    }
}

/// What the shutdown path needs to know about a worker it takes over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopTarget {
    pub port: u16,
    pub pid: Option<u32>,

    /// State the worker was in when shutdown took it over
    pub prior_state: WorkerState,
}

/// Whether a worker's process has been fully reaped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapCheck {
    /// Exit status collected and the pid is gone from the process table
    Reaped(WorkerExit),

    /// No process was ever launched for this worker
    NeverStarted,

    /// Exit status unavailable or a process table entry remains
    Unreaped { pid: u32 },
}

/// Supervisor over all configured workers
pub struct WorkerSupervisor {
    /// Worker Entry Point
    program: PathBuf,

    /// Argument template with `{id}`, `{port}`, `{workdir}` placeholders
    args: Vec<String>,

    /// Worker identifier -> record
    workers: DashMap<String, Arc<Mutex<WorkerRecord>>>,

    ports: Arc<PortRegistry>,

    shutdown: ShutdownFlag,

    restart_policy: RestartPolicy,

    /// Processes launched over the supervisor's lifetime
    total_spawns: AtomicU64,

    /// `restart_if_dead` invocations
    restart_checks: AtomicU64,
}

impl WorkerSupervisor {
    pub fn new(
        program: impl Into<PathBuf>,
        args: Vec<String>,
        ports: Arc<PortRegistry>,
        shutdown: ShutdownFlag,
        restart_policy: RestartPolicy,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            workers: DashMap::new(),
            ports,
            shutdown,
            restart_policy,
            total_spawns: AtomicU64::new(0),
            restart_checks: AtomicU64::new(0),
        }
    }

    /// Build a supervisor and register every configured worker.
    /// Fails before anything is spawned if two workers share a port.
    pub fn from_config(
        config: &FleetConfig,
        ports: Arc<PortRegistry>,
        shutdown: ShutdownFlag,
    ) -> Result<Self> {
        let supervisor = Self::new(
            config.supervisor.worker_command.clone(),
            config.supervisor.worker_args.clone(),
            ports,
            shutdown,
            RestartPolicy::from(&config.health),
        );

        for spec in &config.workers {
            supervisor.register(spec.clone())?;
        }

        info!(workers = supervisor.workers.len(), "Supervisor initialized");
        Ok(supervisor)
    }

    /// Register a worker and claim its port
    pub fn register(&self, spec: WorkerSpec) -> Result<()> {
        if self.workers.contains_key(&spec.id) {
            anyhow::bail!("Worker '{}' is already registered", spec.id);
        }
        self.ports.claim(spec.port, &spec.id)?;

        info!(worker = %spec.id, port = spec.port, dir = %spec.working_directory.display(), "Worker registered");
        self.workers
            .insert(spec.id.clone(), Arc::new(Mutex::new(WorkerRecord::new(spec))));
        Ok(())
    }

    pub fn ports(&self) -> &Arc<PortRegistry> {
        &self.ports
    }

    pub fn shutdown_flag(&self) -> &ShutdownFlag {
        &self.shutdown
    }

    /// Worker identifiers in stable order
    pub fn identifiers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workers.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn spec(&self, id: &str) -> Option<WorkerSpec> {
        self.record(id).map(|r| r.lock().spec.clone())
    }

    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        self.identifiers()
            .iter()
            .filter_map(|id| self.snapshot_of(id))
            .collect()
    }

    pub fn snapshot_of(&self, id: &str) -> Option<WorkerSnapshot> {
        self.record(id).map(|r| r.lock().snapshot())
    }

    pub fn total_spawns(&self) -> u64 {
        self.total_spawns.load(Ordering::SeqCst)
    }

    pub fn restart_checks(&self) -> u64 {
        self.restart_checks.load(Ordering::SeqCst)
    }

    fn record(&self, id: &str) -> Option<Arc<Mutex<WorkerRecord>>> {
        self.workers.get(id).map(|e| e.value().clone())
    }

    fn launch_spec(&self, spec: &WorkerSpec) -> LaunchSpec {
        let workdir = spec.working_directory.display().to_string();
        let port = spec.port.to_string();
        let args = self
            .args
            .iter()
            .map(|arg| {
                OsString::from(
                    arg.replace("{id}", &spec.id)
                        .replace("{port}", &port)
                        .replace("{workdir}", &workdir),
                )
            })
            .collect();

        LaunchSpec {
            id: spec.id.clone(),
            program: self.program.clone(),
            args,
            working_directory: spec.working_directory.clone(),
            port: spec.port,
        }
    }

    /// Launch the worker's process. Retrying on failure is up to the caller.
    pub fn spawn(&self, id: &str) -> Result<u32, SpawnError> {
        let record = self
            .record(id)
            .ok_or_else(|| SpawnError::UnknownWorker(id.to_string()))?;
        let mut record = record.lock();
        self.spawn_locked(&mut record)
    }

    fn spawn_locked(&self, record: &mut WorkerRecord) -> Result<u32, SpawnError> {
        if self.shutdown.is_set() || matches!(record.state, WorkerState::Stopping | WorkerState::Stopped) {
            return Err(SpawnError::ShutdownInProgress(record.spec.id.clone()));
        }
        if record.state == WorkerState::Failed {
            return Err(SpawnError::Retired(record.spec.id.clone()));
        }

        if let Some(handle) = record.handle.as_mut() {
            if matches!(handle.try_exit(), Ok(None)) {
                debug!(worker = %record.spec.id, pid = handle.pid(), "Worker already running, not spawning");
                return Ok(handle.pid());
            }
        }

        let handle = ProcessHandle::spawn(&self.launch_spec(&record.spec))?;
        let pid = handle.pid();

        // The previous handle (if any) is dropped here and never reused
        record.handle = Some(handle);
        record.transition(WorkerState::Starting);
        self.total_spawns.fetch_add(1, Ordering::SeqCst);

        Ok(pid)
    }

    /// Mark a worker as failed (e.g. the caller gave up on spawning it)
    pub fn mark_failed(&self, id: &str) {
        if let Some(record) = self.record(id) {
            record.lock().transition(WorkerState::Failed);
        }
    }

    /// Non-blocking: the worker's exit if its process has exited
    pub fn poll_liveness(&self, id: &str) -> Option<WorkerExit> {
        let record = self.record(id)?;
        let mut record = record.lock();
        let handle = record.handle.as_mut()?;

        match handle.try_exit() {
            Ok(exit) => exit,
            Err(e) => {
                warn!(worker = %id, error = %e, "Failed to poll worker process");
                None
            }
        }
    }

    /// Whether a live process is associated with the worker
    pub fn is_alive(&self, id: &str) -> bool {
        let Some(record) = self.record(id) else {
            return false;
        };
        let mut record = record.lock();
        match record.handle.as_mut() {
            Some(handle) => matches!(handle.try_exit(), Ok(None)),
            None => false,
        }
    }

    /// Restart the worker if its process died. Only acts during normal
    /// operation; the shutdown flag is re-checked right before spawning.
    #[instrument(skip(self), level = "debug")]
    pub fn restart_if_dead(&self, id: &str) -> RestartOutcome {
        self.restart_checks.fetch_add(1, Ordering::SeqCst);

        let Some(record) = self.record(id) else {
            return RestartOutcome::UnknownWorker;
        };
        let mut record = record.lock();

        if !matches!(record.state, WorkerState::Starting | WorkerState::Running) {
            return RestartOutcome::NotEligible(record.state);
        }

        let state = record.state;
        let (exit, pgid, newly_dead) = match record.handle.as_mut() {
            None => return RestartOutcome::NotEligible(state),
            Some(handle) => {
                let seen_before = handle.exit().is_some();
                match handle.try_exit() {
                    Ok(Some(exit)) => (exit, handle.pgid(), !seen_before),
                    Ok(None) => return RestartOutcome::Alive,
                    Err(e) => {
                        warn!(worker = %id, error = %e, "Failed to poll worker process");
                        return RestartOutcome::Alive;
                    }
                }
            }
        };

        if newly_dead {
            warn!(worker = %id, exit = %exit, state = %state, "Worker died unexpectedly");
            record.last_exit = Some(exit);
        }

        let now = Instant::now();
        match self.restart_policy.evaluate(&mut record.restarts, now) {
            RestartVerdict::Allowed => {}
            RestartVerdict::Backoff { remaining } => {
                return RestartOutcome::Deferred(DeferReason::Backoff(remaining));
            }
            RestartVerdict::Exhausted { restarts } => {
                error!(
                    worker = %id,
                    restarts = restarts,
                    window_secs = self.restart_policy.window.as_secs(),
                    "Worker is crash-looping - giving up"
                );
                record.transition(WorkerState::Failed);
                return RestartOutcome::BudgetExhausted { restarts };
            }
        }

        // Descendants of the dead worker may still hold the port
        if let Some(handle) = record.handle.as_ref().filter(|h| h.group_alive()) {
            warn!(worker = %id, pgid = pgid, "Dead worker left processes behind, killing its group");
            if let Err(e) = handle.signal_group(GroupSignal::Kill) {
                error!(worker = %id, pgid = pgid, error = %e, "Failed to kill leftover process group");
            }
            return RestartOutcome::Deferred(DeferReason::GroupRemnant(pgid));
        }

        let port = record.spec.port;
        if !self.ports.is_bindable(port) {
            let diagnosis = self.ports.diagnose(port);
            warn!(worker = %id, port = port, holders = %diagnosis, "Port not yet released, deferring restart");
            return RestartOutcome::Deferred(DeferReason::PortHeld(port));
        }

        if self.shutdown.is_set() {
            info!(worker = %id, "Shutdown in progress, not restarting worker");
            return RestartOutcome::SuppressedByShutdown;
        }

        record.restarts.record(now);
        match self.spawn_locked(&mut record) {
            Ok(pid) => {
                record.restart_count += 1;
                info!(worker = %id, pid = pid, restart_count = record.restart_count, "Worker restarted");
                RestartOutcome::Restarted { pid }
            }
            Err(SpawnError::ShutdownInProgress(_)) => RestartOutcome::SuppressedByShutdown,
            Err(e) => {
                error!(worker = %id, error = %e, "Failed to restart worker");
                RestartOutcome::SpawnFailed(e.to_string())
            }
        }
    }

    /// Track the worker's port: promote `starting` to `running` once the
    /// port is held, warn when a running worker no longer holds it.
    pub fn observe_port(&self, id: &str) -> Option<WorkerState> {
        let record = self.record(id)?;
        let mut record = record.lock();

        let alive = match record.handle.as_mut() {
            Some(handle) => matches!(handle.try_exit(), Ok(None)),
            None => false,
        };
        if !alive {
            return Some(record.state);
        }

        let port = record.spec.port;
        match record.state {
            WorkerState::Starting if !self.ports.is_bindable(port) => {
                record.transition(WorkerState::Running);
                info!(worker = %id, port = port, "Worker is listening");
            }
            WorkerState::Running if self.ports.is_bindable(port) => {
                warn!(worker = %id, port = port, "Running worker is not holding its port");
            }
            _ => {}
        }
        Some(record.state)
    }

    // --- Accessors used by the shutdown coordinator ---

    /// Take the worker over for shutdown
    pub fn begin_stop(&self, id: &str) -> Option<StopTarget> {
        let record = self.record(id)?;
        let mut record = record.lock();
        let prior_state = record.state;
        record.transition(WorkerState::Stopping);
        Some(StopTarget {
            port: record.spec.port,
            pid: record.handle.as_ref().map(|h| h.pid()),
            prior_state,
        })
    }

    /// Signal the worker's process group. A worker without a process is a no-op.
    pub fn signal_group(&self, id: &str, signal: GroupSignal) -> io::Result<()> {
        let Some(record) = self.record(id) else {
            return Ok(());
        };
        let record = record.lock();
        match record.handle.as_ref() {
            Some(handle) => handle.signal_group(signal),
            None => Ok(()),
        }
    }

    pub fn reap_check(&self, id: &str) -> ReapCheck {
        let Some(record) = self.record(id) else {
            return ReapCheck::NeverStarted;
        };
        let mut record = record.lock();
        let Some(handle) = record.handle.as_mut() else {
            return ReapCheck::NeverStarted;
        };

        match handle.try_exit() {
            Ok(Some(exit)) if !handle.pid_present() => ReapCheck::Reaped(exit),
            _ => ReapCheck::Unreaped { pid: handle.pid() },
        }
    }

    /// Process group id if anything is still left in the worker's group
    pub fn group_remnant(&self, id: &str) -> Option<i32> {
        let record = self.record(id)?;
        let record = record.lock();
        let handle = record.handle.as_ref()?;
        handle.group_alive().then(|| handle.pgid())
    }

    /// Conclude shutdown for a worker
    pub fn finish_stop(&self, id: &str, verified: bool) {
        if let Some(record) = self.record(id) {
            let mut record = record.lock();
            if let Some(exit) = record.handle.as_ref().and_then(|h| h.exit()) {
                record.last_exit = Some(exit);
            }
            record.transition(if verified {
                WorkerState::Stopped
            } else {
                WorkerState::Failed
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn supervisor(program: &str, args: &[&str]) -> WorkerSupervisor {
        let ports = Arc::new(PortRegistry::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1024, 65535));
        WorkerSupervisor::new(
            program,
            args.iter().map(|a| a.to_string()).collect(),
            ports,
            ShutdownFlag::new(),
            RestartPolicy {
                max_restarts: 2,
                window: Duration::from_secs(60),
                min_backoff: Duration::from_millis(0),
                max_backoff: Duration::from_millis(0),
            },
        )
    }

    fn spec(id: &str, port: u16) -> WorkerSpec {
        WorkerSpec {
            id: id.to_string(),
            working_directory: std::env::temp_dir(),
            port,
        }
    }

    async fn wait_dead(supervisor: &WorkerSupervisor, id: &str) {
        for _ in 0..100 {
            if supervisor.poll_liveness(id).is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("worker {} did not exit", id);
    }

    #[test]
    fn test_duplicate_port_rejected_at_registration() {
        let supervisor = supervisor("true", &[]);
        supervisor.register(spec("a", 19001)).unwrap();

        assert!(supervisor.register(spec("b", 19001)).is_err());
        assert!(supervisor.register(spec("a", 19002)).is_err());
        assert_eq!(supervisor.identifiers(), vec!["a".to_string()]);
        assert_eq!(supervisor.total_spawns(), 0);
    }

    #[test]
    fn test_placeholders_substituted() {
        let supervisor = supervisor("worker", &["--port", "{port}", "--name={id}", "{workdir}"]);
        let launch = supervisor.launch_spec(&WorkerSpec {
            id: "api".to_string(),
            working_directory: PathBuf::from("/srv/api"),
            port: 9001,
        });

        let args: Vec<String> = launch.args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, vec!["--port", "9001", "--name=api", "/srv/api"]);
    }

    #[tokio::test]
    async fn test_dead_worker_restarted_with_new_process() {
        let supervisor = supervisor("sleep", &["0"]);
        supervisor.register(spec("short", 19011)).unwrap();

        let first = supervisor.spawn("short").unwrap();
        wait_dead(&supervisor, "short").await;

        match supervisor.restart_if_dead("short") {
            RestartOutcome::Restarted { pid } => assert_ne!(pid, first),
            other => panic!("unexpected outcome: {}", other),
        }
        let snapshot = supervisor.snapshot_of("short").unwrap();
        assert_eq!(snapshot.restart_count, 1);
        assert_eq!(snapshot.state, WorkerState::Starting);
        assert_eq!(supervisor.total_spawns(), 2);
    }

    #[tokio::test]
    async fn test_restart_deferred_while_port_held() {
        let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        let supervisor = supervisor("sleep", &["0"]);
        supervisor.register(spec("held", port)).unwrap();
        supervisor.spawn("held").unwrap();
        wait_dead(&supervisor, "held").await;

        assert_eq!(
            supervisor.restart_if_dead("held"),
            RestartOutcome::Deferred(DeferReason::PortHeld(port))
        );
        assert_eq!(supervisor.total_spawns(), 1);

        drop(listener);
        assert!(matches!(supervisor.restart_if_dead("held"), RestartOutcome::Restarted { .. }));
    }

    #[tokio::test]
    async fn test_crash_loop_marks_worker_failed() {
        let supervisor = supervisor("sleep", &["0"]);
        supervisor.register(spec("loop", 19021)).unwrap();
        supervisor.spawn("loop").unwrap();

        for _ in 0..2 {
            wait_dead(&supervisor, "loop").await;
            assert!(matches!(supervisor.restart_if_dead("loop"), RestartOutcome::Restarted { .. }));
        }
        wait_dead(&supervisor, "loop").await;

        assert_eq!(
            supervisor.restart_if_dead("loop"),
            RestartOutcome::BudgetExhausted { restarts: 2 }
        );
        assert_eq!(supervisor.snapshot_of("loop").unwrap().state, WorkerState::Failed);
        assert_eq!(
            supervisor.restart_if_dead("loop"),
            RestartOutcome::NotEligible(WorkerState::Failed)
        );
    }

    #[tokio::test]
    async fn test_no_restart_once_shutdown_flag_raised() {
        let supervisor = supervisor("sleep", &["0"]);
        supervisor.register(spec("late", 19031)).unwrap();
        supervisor.spawn("late").unwrap();
        wait_dead(&supervisor, "late").await;

        assert!(supervisor.shutdown_flag().raise());

        assert_eq!(supervisor.restart_if_dead("late"), RestartOutcome::SuppressedByShutdown);
        assert!(matches!(supervisor.spawn("late"), Err(SpawnError::ShutdownInProgress(_))));
        assert_eq!(supervisor.total_spawns(), 1);
    }

    #[tokio::test]
    async fn test_stopping_worker_is_not_restarted() {
        let supervisor = supervisor("sleep", &["0"]);
        supervisor.register(spec("stopping", 19041)).unwrap();
        supervisor.spawn("stopping").unwrap();

        let target = supervisor.begin_stop("stopping").unwrap();
        assert_eq!(target.port, 19041);
        assert_eq!(target.prior_state, WorkerState::Starting);
        wait_dead(&supervisor, "stopping").await;

        assert_eq!(
            supervisor.restart_if_dead("stopping"),
            RestartOutcome::NotEligible(WorkerState::Stopping)
        );
        assert!(matches!(supervisor.reap_check("stopping"), ReapCheck::Reaped(exit) if exit.success()));

        supervisor.finish_stop("stopping", true);
        assert_eq!(supervisor.snapshot_of("stopping").unwrap().state, WorkerState::Stopped);
    }
}
