// Unix signal handling for fleet shutdown
// Single entry point turning SIGTERM/SIGINT (or an administrative request) into one shutdown initiation

use crate::shutdown::{Initiation, ShutdownCoordinator};
use anyhow::Result;
use futures::StreamExt;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_tokio::{Handle, Signals};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Forwards termination requests to the coordinator. Repeated signals are
/// handed over too; the coordinator's idempotency guard ignores them.
pub struct SignalGateway {
    coordinator: Arc<ShutdownCoordinator>,
}

/// Running signal listener
pub struct SignalListener {
    handle: Handle,
    task: JoinHandle<()>,
}

impl SignalGateway {
    pub fn new(coordinator: Arc<ShutdownCoordinator>) -> Self {
        Self { coordinator }
    }

    /// Administrative shutdown request
    pub fn request_shutdown(&self, reason: &str) -> Initiation {
        self.coordinator.initiate(reason)
    }

    /// Install handlers for SIGTERM and SIGINT (Ctrl+C)
    pub fn listen(self) -> Result<SignalListener> {
        let signals = Signals::new([SIGTERM, SIGINT])?;
        let handle = signals.handle();

        let task = tokio::spawn(async move {
            let mut signals = signals;

            while let Some(signal) = signals.next().await {
                let reason = match signal {
                    SIGTERM => "SIGTERM",
                    SIGINT => "SIGINT",
                    _ => {
                        debug!("Received unexpected signal: {}", signal);
                        continue;
                    }
                };

                match self.coordinator.initiate(reason) {
                    Initiation::Started(session) => {
                        info!(signal = reason, session = %session, "Shutdown signal received");
                    }
                    Initiation::AlreadyInProgress => {
                        info!(signal = reason, "Repeated shutdown signal ignored");
                    }
                }
            }
        });

        Ok(SignalListener { handle, task })
    }
}

impl SignalListener {
    /// Unregister the handlers and stop the listener task
    pub async fn close(self) {
        self.handle.close();
        let _ = self.task.await;
    }
}
