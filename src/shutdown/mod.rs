// Shutdown Coordination Module
// Ordered, time-bounded teardown of the whole worker fleet with a classified exit status

pub mod control;
pub mod flag;
pub mod resources;
pub mod session;
mod worker;

pub use flag::ShutdownFlag;
pub use resources::{ExternalResource, PidFile};
pub use session::{
    ExitClassification, ExitPhase, InternalFault, ResourceFailure, ShutdownReport,
    ShutdownSession, VerificationFailure, WorkerOutcome, WorkerReport,
};

use crate::config::ShutdownTimeouts;
use crate::supervisor::{MonitorHandle, WorkerSupervisor};
use futures::future::join_all;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, OnceCell};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Coordinator state machine. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum CoordinatorState {
    Idle = 0,
    Initiated = 1,
    WorkersNotifying = 2,
    WorkersEscalating = 3,
    Verifying = 4,
    Complete = 5,
}

impl CoordinatorState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => CoordinatorState::Idle,
            1 => CoordinatorState::Initiated,
            2 => CoordinatorState::WorkersNotifying,
            3 => CoordinatorState::WorkersEscalating,
            4 => CoordinatorState::Verifying,
            _ => CoordinatorState::Complete,
        }
    }
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CoordinatorState::Idle => "idle",
            CoordinatorState::Initiated => "initiated",
            CoordinatorState::WorkersNotifying => "workers_notifying",
            CoordinatorState::WorkersEscalating => "workers_escalating",
            CoordinatorState::Verifying => "verifying",
            CoordinatorState::Complete => "complete",
        };
        write!(f, "{}", name)
    }
}

/// Answer to a shutdown trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initiation {
    /// This trigger created the session
    Started(Uuid),

    /// A session already exists; the trigger was ignored
    AlreadyInProgress,
}

/// Orchestrates the shutdown sequence across all workers
pub struct ShutdownCoordinator {
    supervisor: Arc<WorkerSupervisor>,

    timeouts: ShutdownTimeouts,

    state: AtomicU8,

    session: Mutex<Option<Arc<ShutdownSession>>>,

    sessions_created: AtomicU64,

    ignored_triggers: AtomicU64,

    /// Health monitor to stop before touching any worker
    monitor: Mutex<Option<MonitorHandle>>,

    resources: Mutex<Vec<Arc<dyn ExternalResource>>>,

    /// Flips to true once a session exists
    trigger: watch::Sender<bool>,

    report: OnceCell<ShutdownReport>,
}

impl ShutdownCoordinator {
    pub fn new(supervisor: Arc<WorkerSupervisor>, timeouts: ShutdownTimeouts) -> Self {
        let (trigger, _) = watch::channel(false);
        Self {
            supervisor,
            timeouts,
            state: AtomicU8::new(CoordinatorState::Idle as u8),
            session: Mutex::new(None),
            sessions_created: AtomicU64::new(0),
            ignored_triggers: AtomicU64::new(0),
            monitor: Mutex::new(None),
            resources: Mutex::new(Vec::new()),
            trigger,
            report: OnceCell::new(),
        }
    }

    pub fn attach_monitor(&self, monitor: MonitorHandle) {
        *self.monitor.lock() = Some(monitor);
    }

    pub fn register_resource(&self, resource: Arc<dyn ExternalResource>) {
        self.resources.lock().push(resource);
    }

    pub fn state(&self) -> CoordinatorState {
        CoordinatorState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn session(&self) -> Option<Arc<ShutdownSession>> {
        self.session.lock().clone()
    }

    pub fn sessions_created(&self) -> u64 {
        self.sessions_created.load(Ordering::SeqCst)
    }

    pub fn ignored_triggers(&self) -> u64 {
        self.ignored_triggers.load(Ordering::SeqCst)
    }

    pub fn timeouts(&self) -> ShutdownTimeouts {
        self.timeouts
    }

    /// Begin shutdown. Only the first call creates a session; later calls
    /// are logged and ignored.
    pub fn initiate(&self, reason: &str) -> Initiation {
        if let Err(current) = self.state.compare_exchange(
            CoordinatorState::Idle as u8,
            CoordinatorState::Initiated as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            self.ignored_triggers.fetch_add(1, Ordering::SeqCst);
            info!(
                reason = reason,
                state = %CoordinatorState::from_u8(current),
                "Shutdown already in progress, ignoring trigger"
            );
            return Initiation::AlreadyInProgress;
        }

        // Observed by the monitor and every spawn path from here on
        self.supervisor.shutdown_flag().raise();

        let session = Arc::new(ShutdownSession::new(reason));
        let id = session.id;
        *self.session.lock() = Some(session);
        self.sessions_created.fetch_add(1, Ordering::SeqCst);

        warn!(session = %id, reason = reason, "Shutdown initiated");
        self.trigger.send_replace(true);
        Initiation::Started(id)
    }

    /// Wait for a trigger, then run the sequence. Every caller gets the
    /// same report; the sequence itself runs once.
    pub async fn run(self: &Arc<Self>) -> ShutdownReport {
        let mut triggered = self.trigger.subscribe();
        if triggered.wait_for(|t| *t).await.is_err() {
            return ShutdownReport::fault("unknown", "shutdown trigger channel closed");
        }

        let coordinator = self.clone();
        self.report
            .get_or_init(|| async move { coordinator.execute().await })
            .await
            .clone()
    }

    /// Convenience: initiate and run to completion
    pub async fn shutdown(self: &Arc<Self>, reason: &str) -> ShutdownReport {
        self.initiate(reason);
        self.run().await
    }

    fn advance(&self, to: CoordinatorState) {
        let previous = self.state.fetch_max(to as u8, Ordering::SeqCst);
        if previous < to as u8 {
            info!(
                from = %CoordinatorState::from_u8(previous),
                to = %to,
                "Shutdown state advanced"
            );
        }
    }

    async fn execute(self: Arc<Self>) -> ShutdownReport {
        let Some(session) = self.session() else {
            self.advance(CoordinatorState::Complete);
            return ShutdownReport::fault("unknown", "shutdown triggered without a session");
        };

        // The monitor must be fully stopped before any worker is touched,
        // or it could resurrect a worker that was just confirmed dead.
        let monitor = self.monitor.lock().take();
        if let Some(monitor) = monitor {
            if monitor.join(self.timeouts.verification).await {
                info!("Health monitor stopped");
            }
        }

        self.advance(CoordinatorState::WorkersNotifying);

        let ids = self.supervisor.identifiers();
        info!(session = %session.id, workers = ids.len(), "Shutting down workers concurrently");

        let tasks = ids.iter().map(|id| {
            let coordinator = self.clone();
            let id = id.clone();
            tokio::spawn(async move { coordinator.shutdown_worker(id).await })
        });
        let results = join_all(tasks).await;

        let mut faults = Vec::new();
        for (id, result) in ids.iter().zip(results) {
            match result {
                Ok(Ok(report)) => session.record(report),
                Ok(Err(fault)) => {
                    error!(worker = %id, error = %fault, "Worker shutdown fault");
                    faults.push(fault);
                }
                Err(e) => {
                    error!(worker = %id, error = %e, "Worker shutdown task panicked");
                    self.supervisor.finish_stop(id, false);
                    faults.push(InternalFault::WorkerTask {
                        worker: id.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        let resource_failures = self.close_resources().await;

        let workers = session.outcomes();
        let classification =
            ExitClassification::classify(workers.values(), &resource_failures, &faults);
        self.advance(CoordinatorState::Complete);

        let report = ShutdownReport {
            session_id: session.id,
            reason: session.reason.clone(),
            started_at: session.started_at,
            elapsed: session.elapsed(),
            workers,
            resource_failures,
            faults,
            classification,
        };

        info!(
            session = %report.session_id,
            elapsed_ms = report.elapsed.as_millis() as u64,
            exit_code = report.exit_code(),
            classification = %report.classification,
            "Shutdown complete"
        );
        report
    }

    async fn close_resources(&self) -> Vec<ResourceFailure> {
        let resources: Vec<_> = self.resources.lock().drain(..).collect();
        let mut failures = Vec::new();

        for resource in resources {
            let name = resource.name().to_string();
            let error = match tokio::time::timeout(self.timeouts.resource_close, resource.close()).await {
                Ok(Ok(())) => {
                    info!(resource = %name, "External resource closed");
                    continue;
                }
                Ok(Err(e)) => format!("{:#}", e),
                Err(_) => format!(
                    "close did not finish within {}ms",
                    self.timeouts.resource_close.as_millis()
                ),
            };
            error!(resource = %name, error = %error, "External resource failed to close");
            failures.push(ResourceFailure { name, error });
        }

        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::PortRegistry;
    use crate::supervisor::RestartPolicy;
    use async_trait::async_trait;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    struct BrokenConnection;

    #[async_trait]
    impl ExternalResource for BrokenConnection {
        fn name(&self) -> &str {
            "shared-connection"
        }

        async fn close(&self) -> anyhow::Result<()> {
            anyhow::bail!("connection reset")
        }
    }

    fn coordinator() -> Arc<ShutdownCoordinator> {
        let ports = Arc::new(PortRegistry::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1024, 65535));
        let supervisor = Arc::new(WorkerSupervisor::new(
            "true",
            Vec::new(),
            ports,
            ShutdownFlag::new(),
            RestartPolicy::default(),
        ));
        Arc::new(ShutdownCoordinator::new(supervisor, ShutdownTimeouts::default()))
    }

    #[test]
    fn test_second_initiation_is_ignored() {
        let coordinator = coordinator();

        assert!(matches!(coordinator.initiate("SIGTERM"), Initiation::Started(_)));
        assert_eq!(coordinator.initiate("SIGTERM"), Initiation::AlreadyInProgress);

        assert_eq!(coordinator.sessions_created(), 1);
        assert_eq!(coordinator.ignored_triggers(), 1);
        assert_eq!(coordinator.state(), CoordinatorState::Initiated);
        assert!(coordinator.supervisor.shutdown_flag().is_set());
        assert_eq!(coordinator.session().unwrap().reason, "SIGTERM");
    }

    #[tokio::test]
    async fn test_empty_fleet_completes_cleanly() {
        let coordinator = coordinator();
        let report = coordinator.shutdown("admin").await;

        assert_eq!(report.exit_code(), 0);
        assert!(report.workers.is_empty());
        assert_eq!(coordinator.state(), CoordinatorState::Complete);

        // A late trigger neither restarts nor changes the outcome
        assert_eq!(coordinator.initiate("SIGINT"), Initiation::AlreadyInProgress);
        assert_eq!(coordinator.run().await.session_id, report.session_id);
    }

    #[tokio::test]
    async fn test_resource_close_failure_is_exit_five() {
        let coordinator = coordinator();
        coordinator.register_resource(Arc::new(BrokenConnection));

        let report = coordinator.shutdown("admin").await;
        assert_eq!(report.exit_code(), 5);
        assert_eq!(report.resource_failures[0].name, "shared-connection");
        assert!(report.resource_failures[0].error.contains("connection reset"));
    }

    #[tokio::test]
    async fn test_run_waits_for_trigger() {
        let coordinator = coordinator();
        let runner = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.run().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!runner.is_finished());
        assert_eq!(coordinator.state(), CoordinatorState::Idle);

        coordinator.initiate("admin");
        let report = runner.await.unwrap();
        assert_eq!(report.reason, "admin");
    }
}
