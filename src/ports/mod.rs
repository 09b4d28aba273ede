// Port Registry Module
// Ownership of worker ports, bindability probes and release verification

pub mod diagnose;

pub use diagnose::{PortDiagnosis, PortHolder};

use crate::config::MAX_TIMEOUT;
use dashmap::DashMap;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Port claim rejected at configuration time
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortConflict {
    #[error("port {port} requested by '{requested_by}' is already owned by '{owner}'")]
    Duplicate {
        port: u16,
        owner: String,
        requested_by: String,
    },

    #[error("port {port} for '{requested_by}' is outside the allowed range {min}..={max}")]
    OutOfRange {
        port: u16,
        min: u16,
        max: u16,
        requested_by: String,
    },
}

/// A claimed port is already in use at startup
#[derive(Debug, Error)]
#[error("port {port} is not available: {diagnosis}")]
pub struct PortUnavailable {
    pub port: u16,
    pub diagnosis: PortDiagnosis,
}

/// Tracks which worker owns which TCP port
pub struct PortRegistry {
    /// Address the probes bind to (the same one workers listen on)
    bind_host: IpAddr,

    /// Allowed port range
    min_port: u16,
    max_port: u16,

    /// Port -> owning worker identifier
    owners: DashMap<u16, String>,

    /// Probe with SO_REUSEADDR, matching how most servers bind
    reuse_address: bool,

    /// Poll interval for release verification
    poll_interval: Duration,
}

impl PortRegistry {
    pub fn new(bind_host: IpAddr, min_port: u16, max_port: u16) -> Self {
        Self {
            bind_host,
            min_port,
            max_port,
            owners: DashMap::new(),
            reuse_address: true,
            poll_interval: Duration::from_millis(100),
        }
    }

    pub fn with_reuse_address(mut self, reuse_address: bool) -> Self {
        self.reuse_address = reuse_address;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn bind_host(&self) -> IpAddr {
        self.bind_host
    }

    /// Record `owner` as the exclusive owner of `port`
    pub fn claim(&self, port: u16, owner: &str) -> Result<(), PortConflict> {
        if port < self.min_port || port > self.max_port {
            return Err(PortConflict::OutOfRange {
                port,
                min: self.min_port,
                max: self.max_port,
                requested_by: owner.to_string(),
            });
        }

        match self.owners.entry(port) {
            dashmap::mapref::entry::Entry::Occupied(existing) => Err(PortConflict::Duplicate {
                port,
                owner: existing.get().clone(),
                requested_by: owner.to_string(),
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(owner.to_string());
                debug!(port = port, owner = owner, "Port claimed");
                Ok(())
            }
        }
    }

    pub fn owner(&self, port: u16) -> Option<String> {
        self.owners.get(&port).map(|o| o.value().clone())
    }

    /// All owned ports in ascending order
    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.owners.iter().map(|e| *e.key()).collect();
        ports.sort_unstable();
        ports
    }

    /// Bind and immediately release. Only proves no active listener holds
    /// the port; lingering post-close kernel state may still be present.
    pub fn is_bindable(&self, port: u16) -> bool {
        let addr = SocketAddr::new(self.bind_host, port);
        match try_bind(addr, self.reuse_address) {
            Ok(()) => true,
            Err(e) => {
                debug!(port = port, error = %e, "Port probe failed to bind");
                false
            }
        }
    }

    /// Startup check: every claimed port must be bindable before the first
    /// spawn. Stops at the lowest busy port and says who holds it.
    pub fn check_all_free(&self) -> Result<(), PortUnavailable> {
        for port in self.ports() {
            if !self.is_bindable(port) {
                return Err(PortUnavailable {
                    port,
                    diagnosis: self.diagnose(port),
                });
            }
        }
        info!(ports = ?self.ports(), "✓ All worker ports are free");
        Ok(())
    }

    /// Poll until the port is bindable or `timeout` elapses
    pub async fn wait_until_released(&self, port: u16, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout.min(MAX_TIMEOUT);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            if self.is_bindable(port) {
                debug!(port = port, attempts = attempts, "Port release confirmed");
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    port = port,
                    attempts = attempts,
                    timeout_ms = timeout.as_millis() as u64,
                    "Port still held after release timeout"
                );
                return false;
            }

            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Best-effort lookup of whoever holds the port. Diagnostics only.
    pub fn diagnose(&self, port: u16) -> PortDiagnosis {
        let diagnosis = diagnose::inspect(port);
        if !diagnosis.holders.is_empty() {
            info!(port = port, holders = %diagnosis, "Port holders identified");
        }
        diagnosis
    }
}

fn try_bind(addr: SocketAddr, reuse_address: bool) -> std::io::Result<()> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(reuse_address)?;
    socket.bind(&addr.into())?;
    drop(socket);
    Ok(())
}
