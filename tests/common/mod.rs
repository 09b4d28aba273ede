// Shared fleet harness for integration tests

#![allow(dead_code)]

use pear_fleet::config::{FleetConfig, ShutdownTimeouts, WorkerSpec};
use pear_fleet::ports::PortRegistry;
use pear_fleet::shutdown::{ShutdownCoordinator, ShutdownFlag};
use pear_fleet::supervisor::WorkerSupervisor;
use std::net::{IpAddr, Ipv4Addr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const STUB: &str = env!("CARGO_BIN_EXE_pear-stub-worker");

pub fn localhost() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

/// Reserve an ephemeral port; it is free again once the listener drops
pub fn reserve_port() -> (u16, TcpListener) {
    let listener = TcpListener::bind((localhost(), 0)).expect("bind ephemeral port");
    let port = listener.local_addr().expect("local addr").port();
    (port, listener)
}

/// A port nothing is listening on right now
pub fn free_port() -> u16 {
    reserve_port().0
}

pub fn test_timeouts() -> ShutdownTimeouts {
    ShutdownTimeouts {
        graceful: Duration::from_secs(2),
        termination: Duration::from_secs(1),
        kill: Duration::from_secs(2),
        verification: Duration::from_secs(1),
        poll_interval: Duration::from_millis(50),
        resource_close: Duration::from_secs(1),
    }
}

/// Worker definition: identifier plus extra stub flags
pub struct StubWorker {
    pub id: &'static str,
    pub flags: &'static str,
}

pub fn stub(id: &'static str, flags: &'static str) -> StubWorker {
    StubWorker { id, flags }
}

pub struct Fleet {
    pub config: FleetConfig,
    pub supervisor: Arc<WorkerSupervisor>,
    pub coordinator: Arc<ShutdownCoordinator>,
    _dirs: Vec<TempDir>,
}

impl Fleet {
    pub fn port_of(&self, id: &str) -> u16 {
        self.config
            .workers
            .iter()
            .find(|w| w.id == id)
            .map(|w| w.port)
            .expect("known worker")
    }
}

/// Configuration running the stub worker once per entry. Each worker's
/// flags live in its working directory so one argument template serves all.
pub fn config(workers: &[StubWorker]) -> (FleetConfig, Vec<TempDir>) {
    let mut dirs = Vec::new();
    let mut specs = Vec::new();
    // Held until every port is picked so no two workers get the same one
    let mut reserved = Vec::new();

    for worker in workers {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("flags"), worker.flags).expect("write flags");
        let (port, listener) = reserve_port();
        reserved.push(listener);
        specs.push(WorkerSpec {
            id: worker.id.to_string(),
            working_directory: dir.path().to_path_buf(),
            port,
        });
        dirs.push(dir);
    }
    drop(reserved);

    let mut config = FleetConfig::new("/bin/sh", specs);
    config.supervisor.worker_args = vec![
        "-c".to_string(),
        format!("exec '{}' --port {{port}} $(cat '{{workdir}}/flags')", STUB),
    ];
    (config, dirs)
}

pub fn build(config: FleetConfig, dirs: Vec<TempDir>, timeouts: ShutdownTimeouts) -> Fleet {
    let ports = Arc::new(
        PortRegistry::new(
            config.supervisor.bind_host,
            config.supervisor.min_port,
            config.supervisor.max_port,
        )
        .with_poll_interval(timeouts.poll_interval),
    );
    let supervisor = Arc::new(
        WorkerSupervisor::from_config(&config, ports, ShutdownFlag::new()).expect("supervisor"),
    );
    let coordinator = Arc::new(ShutdownCoordinator::new(supervisor.clone(), timeouts));

    Fleet {
        config,
        supervisor,
        coordinator,
        _dirs: dirs,
    }
}

/// Build the fleet, spawn every worker and wait for the listening ones
pub async fn start(workers: &[StubWorker], timeouts: ShutdownTimeouts) -> Fleet {
    let (config, dirs) = config(workers);
    let fleet = build(config, dirs, timeouts);

    for worker in workers {
        fleet.supervisor.spawn(worker.id).expect("spawn stub worker");
    }
    for worker in workers {
        if !worker.flags.contains("--no-listen") {
            wait_listening(fleet.port_of(worker.id)).await;
        }
    }
    fleet
}

pub async fn wait_listening(port: u16) {
    for _ in 0..200 {
        if TcpStream::connect((localhost(), port)).is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("worker on port {} never started listening", port);
}

pub fn bindable(port: u16) -> bool {
    TcpListener::bind((localhost(), port)).is_ok()
}

/// Poll `condition` for up to `timeout`
pub async fn eventually<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}
