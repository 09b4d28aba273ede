// Pear Fleet - per-repository worker supervisor
// One isolated worker process per configured repository, each on its own port,
// torn down deterministically on termination request.

pub mod cli;
pub mod config;
pub mod observability;
pub mod ports;
pub mod process;
pub mod shutdown;
pub mod signals;
pub mod supervisor;

pub use config::{FleetConfig, ShutdownTimeouts, WorkerSpec};
pub use ports::PortRegistry;
pub use process::{GroupSignal, ProcessHandle, SpawnError, WorkerExit};
pub use shutdown::{
    ExitClassification, ExitPhase, Initiation, ShutdownCoordinator, ShutdownFlag, ShutdownReport,
    WorkerOutcome,
};
pub use signals::SignalGateway;
pub use supervisor::{HealthMonitor, WorkerState, WorkerSupervisor};
