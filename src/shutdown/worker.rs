// Per-worker shutdown pipeline
// Graceful request -> SIGTERM -> SIGKILL -> verification, strictly in order, each phase time-bounded

use super::control::{self, GracefulRequest};
use super::session::{ExitPhase, InternalFault, VerificationFailure, WorkerReport};
use super::{CoordinatorState, ShutdownCoordinator};
use crate::config::MAX_TIMEOUT;
use crate::process::GroupSignal;
use crate::supervisor::{ReapCheck, WorkerState};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Graceful,
    Terminate,
    Kill,
}

impl Phase {
    fn name(self) -> &'static str {
        match self {
            Phase::Graceful => "graceful",
            Phase::Terminate => "terminate",
            Phase::Kill => "kill",
        }
    }
}

impl ShutdownCoordinator {
    #[instrument(skip(self), fields(worker = %id))]
    pub(super) async fn shutdown_worker(self: Arc<Self>, id: String) -> Result<WorkerReport, InternalFault> {
        let started = Instant::now();
        let target = self.supervisor.begin_stop(&id).ok_or_else(|| InternalFault::WorkerTask {
            worker: id.clone(),
            message: "worker vanished from the supervisor".to_string(),
        })?;

        info!(port = target.port, pid = ?target.pid, prior_state = %target.prior_state, "Worker shutdown started");
        if target.prior_state == WorkerState::Failed {
            warn!(port = target.port, "Worker had already failed before shutdown");
        }

        let exit_phase = self.stop_process(&id, target.port).await;
        let kill_anomaly = exit_phase == ExitPhase::Killed && self.supervisor.is_alive(&id);

        self.advance(CoordinatorState::Verifying);
        let (exit, failures) = self.verify(&id, target.port).await;
        let verified = failures.is_empty();
        self.supervisor.finish_stop(&id, verified);

        let report = WorkerReport {
            id: id.clone(),
            port: target.port,
            prior_state: target.prior_state,
            exit_phase,
            exit,
            failures,
            kill_anomaly,
            elapsed: started.elapsed(),
        };

        if verified {
            info!(
                outcome = %report.outcome(),
                elapsed_ms = report.elapsed.as_millis() as u64,
                "Worker shutdown complete"
            );
        } else {
            error!(
                outcome = %report.outcome(),
                elapsed_ms = report.elapsed.as_millis() as u64,
                failures = report.failures.len(),
                "Worker shutdown finished with verification failures"
            );
        }
        Ok(report)
    }

    /// Phases 1-3. Returns the phase in which the process exited.
    async fn stop_process(&self, id: &str, port: u16) -> ExitPhase {
        let timeouts = self.timeouts;

        // Phase 1: graceful stop request
        let phase_start = Instant::now();
        if !self.supervisor.is_alive(id) {
            info!(phase = "graceful", "Worker process already gone");
            return ExitPhase::Graceful;
        }

        let host = self.supervisor.ports().bind_host();
        match control::request_shutdown(host, port, timeouts.graceful).await {
            GracefulRequest::Accepted { status, elapsed } => {
                info!(
                    phase = "graceful",
                    status = %status,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Graceful stop request accepted"
                );
                let remaining = timeouts.graceful.saturating_sub(phase_start.elapsed());
                if self.wait_for_exit(id, Phase::Graceful, remaining).await {
                    info!(
                        phase = "graceful",
                        elapsed_ms = phase_start.elapsed().as_millis() as u64,
                        "Worker exited gracefully"
                    );
                    return ExitPhase::Graceful;
                }
                warn!(
                    phase = "graceful",
                    elapsed_ms = phase_start.elapsed().as_millis() as u64,
                    "Worker did not exit within graceful timeout"
                );
            }
            GracefulRequest::Unreachable(reason) => {
                info!(
                    phase = "graceful",
                    reason = %reason,
                    elapsed_ms = phase_start.elapsed().as_millis() as u64,
                    "Graceful stop unavailable, escalating"
                );
            }
        }

        // Phase 2: SIGTERM to the process group
        if !self.supervisor.is_alive(id) {
            info!(phase = "graceful", "Worker exited before escalation");
            return ExitPhase::Graceful;
        }
        self.advance(CoordinatorState::WorkersEscalating);
        if self.escalate(id, Phase::Terminate, GroupSignal::Terminate, timeouts.termination).await {
            return ExitPhase::Terminated;
        }

        // Phase 3: SIGKILL to the process group
        if !self.escalate(id, Phase::Kill, GroupSignal::Kill, timeouts.kill).await {
            error!(
                phase = "kill",
                timeout_ms = timeouts.kill.as_millis() as u64,
                "CRITICAL: worker still present after SIGKILL wait, continuing"
            );
        }
        ExitPhase::Killed
    }

    /// Signal the group and wait for exit. True if the process exited in budget.
    async fn escalate(&self, id: &str, phase: Phase, signal: GroupSignal, budget: Duration) -> bool {
        let phase_start = Instant::now();
        if let Err(e) = self.supervisor.signal_group(id, signal) {
            error!(phase = phase.name(), signal = %signal, error = %e, "Failed to signal process group");
        } else {
            info!(phase = phase.name(), signal = %signal, "Signal sent to worker process group");
        }

        let exited = self.wait_for_exit(id, phase, budget).await;
        let elapsed_ms = phase_start.elapsed().as_millis() as u64;
        if exited {
            info!(phase = phase.name(), elapsed_ms = elapsed_ms, "Worker exited after {}", signal);
        } else {
            warn!(
                phase = phase.name(),
                elapsed_ms = elapsed_ms,
                timeout_ms = budget.as_millis() as u64,
                "Escalation timeout"
            );
        }
        exited
    }

    /// Poll for exit at the configured interval. The termination phase logs
    /// every poll so a stuck worker shows up while it is being waited on.
    async fn wait_for_exit(&self, id: &str, phase: Phase, budget: Duration) -> bool {
        let poll = self.timeouts.poll_interval;
        let start = Instant::now();
        let deadline = start + budget.min(MAX_TIMEOUT);
        let mut polls = 0u32;

        loop {
            if !self.supervisor.is_alive(id) {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }

            polls += 1;
            if phase == Phase::Terminate {
                info!(
                    phase = phase.name(),
                    poll = polls,
                    waited_ms = (now - start).as_millis() as u64,
                    remaining_ms = (deadline - now).as_millis() as u64,
                    "Waiting for worker to exit"
                );
            }

            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }

    /// Phase 4: reaped, port released, process group empty.
    /// Always runs, whichever phase ended the process.
    async fn verify(&self, id: &str, port: u16) -> (Option<crate::process::WorkerExit>, Vec<VerificationFailure>) {
        let verify_start = Instant::now();
        let mut failures = Vec::new();

        let exit = match self.supervisor.reap_check(id) {
            ReapCheck::Reaped(exit) => Some(exit),
            ReapCheck::NeverStarted => None,
            ReapCheck::Unreaped { pid } => {
                error!(phase = "verify", pid = pid, "Worker process was not reaped");
                failures.push(VerificationFailure::Unreaped { pid });
                None
            }
        };

        let ports = self.supervisor.ports();
        if !ports.wait_until_released(port, self.timeouts.verification).await {
            let diagnosis = ports.diagnose(port);
            error!(
                phase = "verify",
                port = port,
                holders = %diagnosis,
                "Port {} not released after shutdown", port
            );
            failures.push(VerificationFailure::PortHeld {
                port,
                diagnosis: diagnosis.to_string(),
            });
        }

        if let Some(pgid) = self.supervisor.group_remnant(id) {
            error!(phase = "verify", pgid = pgid, "Processes remain in worker's process group, killing them");
            failures.push(VerificationFailure::GroupRemnant { pgid });
            if let Err(e) = self.supervisor.signal_group(id, GroupSignal::Kill) {
                error!(phase = "verify", pgid = pgid, error = %e, "Failed to kill process group remnant");
            }
        }

        info!(
            phase = "verify",
            elapsed_ms = verify_start.elapsed().as_millis() as u64,
            passed = failures.is_empty(),
            "Verification finished"
        );
        (exit, failures)
    }
}
