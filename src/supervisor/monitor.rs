// Health Monitor
// Background loop restarting dead workers during normal operation; pauses itself once shutdown begins

use super::{RestartOutcome, WorkerSupervisor};
use crate::config::HealthSection;
use crate::shutdown::ShutdownFlag;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

const MIN_SLICE: Duration = Duration::from_millis(1);

/// Liveness loop over all supervised workers
pub struct HealthMonitor {
    supervisor: Arc<WorkerSupervisor>,

    /// Time between passes over the fleet
    interval: Duration,

    /// Sleep granularity; the shutdown flag is re-checked after every slice
    slice: Duration,
}

/// Handle to a running monitor task
pub struct MonitorHandle {
    task: JoinHandle<()>,
}

impl HealthMonitor {
    /// Both durations are clamped to at least 1ms, and the slice never
    /// exceeds the interval, so the loop always sleeps between cycles.
    pub fn new(supervisor: Arc<WorkerSupervisor>, interval: Duration, slice: Duration) -> Self {
        let interval = interval.max(MIN_SLICE);
        Self {
            supervisor,
            interval,
            slice: slice.clamp(MIN_SLICE, interval),
        }
    }

    pub fn from_config(supervisor: Arc<WorkerSupervisor>, section: &HealthSection) -> Self {
        Self::new(
            supervisor,
            Duration::from_millis(section.interval_ms),
            Duration::from_millis(section.slice_ms),
        )
    }

    /// Start the monitoring loop
    pub fn start(self) -> MonitorHandle {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            slice_ms = self.slice.as_millis() as u64,
            "Starting health monitor"
        );
        MonitorHandle {
            task: tokio::spawn(self.run()),
        }
    }

    async fn run(self) {
        let flag = self.supervisor.shutdown_flag().clone();

        'monitor: loop {
            for id in self.supervisor.identifiers() {
                if flag.is_set() {
                    break 'monitor;
                }

                match self.supervisor.restart_if_dead(&id) {
                    RestartOutcome::Alive => {
                        self.supervisor.observe_port(&id);
                    }
                    RestartOutcome::Restarted { pid } => {
                        info!(worker = %id, pid = pid, "Health monitor restarted worker");
                    }
                    RestartOutcome::SpawnFailed(e) => {
                        error!(worker = %id, error = %e, "Health monitor could not restart worker");
                    }
                    RestartOutcome::Deferred(reason) => {
                        debug!(worker = %id, reason = ?reason, "Restart deferred");
                    }
                    RestartOutcome::SuppressedByShutdown => break 'monitor,
                    _ => {}
                }
            }

            if !sleep_unless_shutdown(&flag, self.interval, self.slice).await {
                break;
            }
        }

        info!("Health monitor paused for shutdown");
    }
}

/// Sleep for `total` in `slice` steps. Returns false as soon as the flag is
/// observed set.
async fn sleep_unless_shutdown(flag: &ShutdownFlag, total: Duration, slice: Duration) -> bool {
    let mut slept = Duration::ZERO;
    while slept < total {
        if flag.is_set() {
            return false;
        }
        let step = slice.min(total - slept);
        tokio::time::sleep(step).await;
        slept += step;
    }
    !flag.is_set()
}

impl MonitorHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the loop to stop. The shutdown flag must already be set.
    /// Returns false if it had to be aborted after `timeout`.
    pub async fn join(self, timeout: Duration) -> bool {
        let mut task = self.task;
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!(error = %e, "Health monitor task failed");
                true
            }
            Err(_) => {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Health monitor did not stop in time, aborting it"
                );
                task.abort();
                let _ = task.await;
                false
            }
        }
    }
}
