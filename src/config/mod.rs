// Configuration Management Module
// Handles pear-fleet.toml loading, defaults, environment overrides and validation

pub mod overrides;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Upper bound for any shutdown phase budget (one day)
pub const MAX_TIMEOUT_SECS: f64 = 86_400.0;
pub const MAX_TIMEOUT: Duration = Duration::from_secs(86_400);

/// Main fleet configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    pub supervisor: SupervisorSection,

    #[serde(default)]
    pub shutdown: ShutdownSection,

    #[serde(default)]
    pub health: HealthSection,

    #[serde(default)]
    pub workers: Vec<WorkerSpec>,
}

/// How to launch the Worker Entry Point
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorSection {
    /// Executable started once per worker
    pub worker_command: PathBuf,

    /// Arguments; `{id}`, `{port}` and `{workdir}` are substituted per worker
    #[serde(default)]
    pub worker_args: Vec<String>,

    #[serde(default = "default_bind_host")]
    pub bind_host: IpAddr,

    #[serde(default = "default_min_port")]
    pub min_port: u16,

    #[serde(default = "default_max_port")]
    pub max_port: u16,

    #[serde(default = "default_true")]
    pub probe_reuse_address: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownSection {
    #[serde(default = "default_graceful_timeout")]
    pub graceful_timeout_secs: f64,

    #[serde(default = "default_termination_timeout")]
    pub termination_timeout_secs: f64,

    #[serde(default = "default_kill_timeout")]
    pub kill_timeout_secs: f64,

    #[serde(default = "default_verification_timeout")]
    pub verification_timeout_secs: f64,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_resource_close_timeout")]
    pub resource_close_timeout_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSection {
    #[serde(default = "default_health_interval")]
    pub interval_ms: u64,

    /// Granularity at which the monitor re-checks the shutdown flag
    #[serde(default = "default_health_slice")]
    pub slice_ms: u64,

    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    #[serde(default = "default_restart_window")]
    pub restart_window_secs: u64,

    #[serde(default = "default_min_backoff")]
    pub min_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

/// One configured unit of work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub id: String,
    pub working_directory: PathBuf,
    pub port: u16,
}

// Default value functions
fn default_bind_host() -> IpAddr { IpAddr::from([127, 0, 0, 1]) }
fn default_min_port() -> u16 { 1024 }
fn default_max_port() -> u16 { 65535 }
fn default_true() -> bool { true }
pub(crate) fn default_graceful_timeout() -> f64 { 5.0 }
pub(crate) fn default_termination_timeout() -> f64 { 30.0 }
fn default_kill_timeout() -> f64 { 5.0 }
pub(crate) fn default_verification_timeout() -> f64 { 5.0 }
fn default_poll_interval() -> u64 { 100 }
fn default_resource_close_timeout() -> f64 { 5.0 }
fn default_health_interval() -> u64 { 2000 }
fn default_health_slice() -> u64 { 100 }
fn default_max_restarts() -> u32 { 5 }
fn default_restart_window() -> u64 { 60 }
fn default_min_backoff() -> u64 { 500 }
fn default_max_backoff() -> u64 { 30_000 }

impl Default for ShutdownSection {
    fn default() -> Self {
        Self {
            graceful_timeout_secs: default_graceful_timeout(),
            termination_timeout_secs: default_termination_timeout(),
            kill_timeout_secs: default_kill_timeout(),
            verification_timeout_secs: default_verification_timeout(),
            poll_interval_ms: default_poll_interval(),
            resource_close_timeout_secs: default_resource_close_timeout(),
        }
    }
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            interval_ms: default_health_interval(),
            slice_ms: default_health_slice(),
            max_restarts: default_max_restarts(),
            restart_window_secs: default_restart_window(),
            min_backoff_ms: default_min_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl SupervisorSection {
    pub fn new(worker_command: impl Into<PathBuf>) -> Self {
        Self {
            worker_command: worker_command.into(),
            worker_args: Vec::new(),
            bind_host: default_bind_host(),
            min_port: default_min_port(),
            max_port: default_max_port(),
            probe_reuse_address: default_true(),
        }
    }
}

/// Shutdown phase budgets as durations
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShutdownTimeouts {
    pub graceful: Duration,
    pub termination: Duration,
    pub kill: Duration,
    pub verification: Duration,
    pub poll_interval: Duration,
    pub resource_close: Duration,
}

impl ShutdownSection {
    /// Never panics: values past `MAX_TIMEOUT_SECS` are capped and
    /// NaN or non-positive ones fall back to the default.
    pub fn timeouts(&self) -> ShutdownTimeouts {
        ShutdownTimeouts {
            graceful: seconds(self.graceful_timeout_secs, default_graceful_timeout()),
            termination: seconds(self.termination_timeout_secs, default_termination_timeout()),
            kill: seconds(self.kill_timeout_secs, default_kill_timeout()),
            verification: seconds(self.verification_timeout_secs, default_verification_timeout()),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            resource_close: seconds(self.resource_close_timeout_secs, default_resource_close_timeout()),
        }
    }
}

fn seconds(secs: f64, default: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::from_secs_f64(default);
    }
    Duration::from_secs_f64(secs.min(MAX_TIMEOUT_SECS))
}

impl Default for ShutdownTimeouts {
    fn default() -> Self {
        ShutdownSection::default().timeouts()
    }
}

impl FleetConfig {
    /// Minimal configuration, mostly used by tests and embedding code
    pub fn new(worker_command: impl Into<PathBuf>, workers: Vec<WorkerSpec>) -> Self {
        Self {
            supervisor: SupervisorSection::new(worker_command),
            shutdown: ShutdownSection::default(),
            health: HealthSection::default(),
            workers,
        }
    }

    /// Load configuration from file, apply environment overrides, validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading configuration from {}", path.display());

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path.display()))?;

        let mut config = Self::parse(&contents)?;
        overrides::apply_env(&mut config.shutdown);
        config.validate()?;
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("Failed to parse configuration file")
    }

    /// Validate configuration. Runs before any worker is spawned.
    pub fn validate(&self) -> Result<()> {
        let sup = &self.supervisor;
        if sup.worker_command.as_os_str().is_empty() {
            anyhow::bail!("worker_command cannot be empty");
        }
        if sup.min_port == 0 || sup.min_port > sup.max_port {
            anyhow::bail!("Invalid port range {}..={}", sup.min_port, sup.max_port);
        }

        if self.workers.is_empty() {
            anyhow::bail!("At least one worker must be configured");
        }

        let mut ids = HashSet::new();
        let mut ports = HashSet::new();
        for worker in &self.workers {
            if worker.id.trim().is_empty() {
                anyhow::bail!("Worker identifiers cannot be empty");
            }
            if !ids.insert(worker.id.as_str()) {
                anyhow::bail!("Duplicate worker identifier '{}'", worker.id);
            }
            if !worker.working_directory.is_absolute() {
                anyhow::bail!(
                    "Worker '{}' working directory must be absolute: {}",
                    worker.id,
                    worker.working_directory.display()
                );
            }
            if worker.port < sup.min_port || worker.port > sup.max_port {
                anyhow::bail!(
                    "Worker '{}' port {} is outside {}..={}",
                    worker.id, worker.port, sup.min_port, sup.max_port
                );
            }
            if !ports.insert(worker.port) {
                anyhow::bail!("Port {} is assigned to more than one worker ('{}')", worker.port, worker.id);
            }
        }

        let shutdown = &self.shutdown;
        for (name, secs) in [
            ("graceful_timeout_secs", shutdown.graceful_timeout_secs),
            ("termination_timeout_secs", shutdown.termination_timeout_secs),
            ("kill_timeout_secs", shutdown.kill_timeout_secs),
            ("verification_timeout_secs", shutdown.verification_timeout_secs),
            ("resource_close_timeout_secs", shutdown.resource_close_timeout_secs),
        ] {
            if !(secs.is_finite() && secs > 0.0) {
                anyhow::bail!("{} must be a positive number of seconds", name);
            }
            if secs > MAX_TIMEOUT_SECS {
                anyhow::bail!("{} cannot exceed {} seconds", name, MAX_TIMEOUT_SECS);
            }
        }
        if shutdown.poll_interval_ms == 0 {
            anyhow::bail!("poll_interval_ms must be at least 1");
        }

        let health = &self.health;
        if health.interval_ms == 0 || health.slice_ms == 0 {
            anyhow::bail!("Health interval and slice must be at least 1ms");
        }
        if health.slice_ms > health.interval_ms {
            anyhow::bail!("Health slice_ms cannot exceed interval_ms");
        }
        if health.min_backoff_ms > health.max_backoff_ms {
            anyhow::bail!("min_backoff_ms cannot exceed max_backoff_ms");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [supervisor]
        worker_command = "/usr/local/bin/repo-worker"
        worker_args = ["--port", "{port}", "--repo", "{workdir}"]

        [shutdown]
        graceful_timeout_secs = 2.5

        [[workers]]
        id = "api"
        working_directory = "/srv/repos/api"
        port = 9001

        [[workers]]
        id = "web"
        working_directory = "/srv/repos/web"
        port = 9002
    "#;

    #[test]
    fn test_parse_sample_config() {
        let config = FleetConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.workers.len(), 2);
        assert_eq!(config.supervisor.bind_host, IpAddr::from([127, 0, 0, 1]));
        assert_eq!(config.shutdown.timeouts().graceful, Duration::from_millis(2500));
        assert_eq!(config.shutdown.termination_timeout_secs, 30.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duplicate_port_fails_validation() {
        let mut config = FleetConfig::parse(SAMPLE).unwrap();
        config.workers[1].port = 9001;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("9001"), "{}", err);
    }

    #[test]
    fn test_relative_working_directory_rejected() {
        let mut config = FleetConfig::parse(SAMPLE).unwrap();
        config.workers[0].working_directory = PathBuf::from("repos/api");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_port_outside_range_rejected() {
        let mut config = FleetConfig::parse(SAMPLE).unwrap();
        config.supervisor.min_port = 9500;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_slice_longer_than_interval_rejected() {
        let mut config = FleetConfig::parse(SAMPLE).unwrap();
        config.health.slice_ms = config.health.interval_ms + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_oversized_timeout_rejected() {
        let contents = SAMPLE.replace("graceful_timeout_secs = 2.5", "graceful_timeout_secs = 1e20");
        let config = FleetConfig::parse(&contents).unwrap();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("graceful_timeout_secs"), "{}", err);
    }

    #[test]
    fn test_timeouts_never_panic_on_extreme_values() {
        let section = ShutdownSection {
            graceful_timeout_secs: 1e20,
            termination_timeout_secs: f64::INFINITY,
            kill_timeout_secs: f64::NAN,
            verification_timeout_secs: -1.0,
            ..ShutdownSection::default()
        };

        let timeouts = section.timeouts();
        assert_eq!(timeouts.graceful, Duration::from_secs_f64(MAX_TIMEOUT_SECS));
        assert_eq!(timeouts.termination, Duration::from_secs_f64(MAX_TIMEOUT_SECS));
        assert_eq!(timeouts.kill, Duration::from_secs_f64(default_kill_timeout()));
        assert_eq!(timeouts.verification, Duration::from_secs_f64(default_verification_timeout()));

        // Deadlines built from the capped budgets stay representable
        assert!(std::time::Instant::now().checked_add(timeouts.graceful).is_some());
    }
}
