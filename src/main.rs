// Pear Fleet daemon entry point
// Starts one worker per configured repository and tears the fleet down on SIGTERM/SIGINT

use anyhow::Result;
use clap::Parser;
use pear_fleet::cli;
use pear_fleet::config::FleetConfig;
use pear_fleet::ports::PortRegistry;
use pear_fleet::shutdown::{ExternalResource, PidFile, ShutdownCoordinator, ShutdownFlag, ShutdownReport};
use pear_fleet::signals::SignalGateway;
use pear_fleet::supervisor::{HealthMonitor, WorkerSupervisor};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Exit status when the fleet never came up (bad config, port taken)
const STARTUP_FAILURE_EXIT: i32 = 78;

/// Caller-side retry for workers that fail to launch
const SPAWN_ATTEMPTS: u32 = 3;
const SPAWN_RETRY_DELAY: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    match cli.command {
        cli::Commands::Start { config, pid_file, verbose } => {
            pear_fleet::observability::init(verbose)?;
            cli::print_banner();

            let code = match run_fleet(&config, &pid_file).await {
                Ok(report) => {
                    cli::print_report(&report);
                    report.exit_code()
                }
                Err(e) => {
                    error!(error = %e, "Fleet startup failed");
                    cli::error(&format!("{:#}", e));
                    STARTUP_FAILURE_EXIT
                }
            };

            std::process::exit(code);
        }
        command => cli::commands::execute(command).await,
    }
}

/// Run the fleet until a shutdown request completes
async fn run_fleet(config_path: &str, pid_file: &str) -> Result<ShutdownReport> {
    info!("🍐 Pear Fleet starting");

    let config = FleetConfig::load(config_path)?;
    info!("✓ Configuration loaded and validated");
    let timeouts = config.shutdown.timeouts();

    let ports = Arc::new(
        PortRegistry::new(
            config.supervisor.bind_host,
            config.supervisor.min_port,
            config.supervisor.max_port,
        )
        .with_reuse_address(config.supervisor.probe_reuse_address)
        .with_poll_interval(timeouts.poll_interval),
    );

    // Claims every port; a duplicate fails here, before anything is spawned
    let flag = ShutdownFlag::new();
    let supervisor = Arc::new(WorkerSupervisor::from_config(&config, ports.clone(), flag)?);

    ports.check_all_free()?;

    let coordinator = Arc::new(ShutdownCoordinator::new(supervisor.clone(), timeouts));

    // Handlers go in before the first spawn so an early SIGTERM still
    // reaches the coordinator.
    let listener = SignalGateway::new(coordinator.clone()).listen()?;
    info!("✓ Signal handlers installed (SIGTERM, SIGINT)");

    let pid_file = Arc::new(PidFile::create(pid_file)?);
    coordinator.register_resource(pid_file as Arc<dyn ExternalResource>);

    for id in supervisor.identifiers() {
        spawn_with_retry(&supervisor, &id).await;
    }

    let monitor = HealthMonitor::from_config(supervisor.clone(), &config.health).start();
    coordinator.attach_monitor(monitor);

    info!(workers = supervisor.identifiers().len(), "✓ Fleet running");
    cli::success("Fleet is running. Send SIGTERM or press Ctrl+C to stop.");

    let runner = coordinator.clone();
    let report = match tokio::spawn(async move { runner.run().await }).await {
        Ok(report) => report,
        Err(e) => {
            error!(error = %e, "Shutdown coordinator crashed");
            let reason = coordinator
                .session()
                .map(|s| s.reason.clone())
                .unwrap_or_else(|| "unknown".to_string());
            ShutdownReport::fault(reason, e.to_string())
        }
    };

    listener.close().await;

    info!(
        exit_code = report.exit_code(),
        classification = %report.classification,
        "Pear Fleet stopped"
    );
    Ok(report)
}

async fn spawn_with_retry(supervisor: &WorkerSupervisor, id: &str) {
    for attempt in 1..=SPAWN_ATTEMPTS {
        match supervisor.spawn(id) {
            Ok(_) => return,
            Err(e) if supervisor.shutdown_flag().is_set() => {
                info!(worker = %id, error = %e, "Skipping spawn, shutdown in progress");
                return;
            }
            Err(e) => {
                warn!(worker = %id, attempt, error = %e, "Worker failed to launch");
                if attempt < SPAWN_ATTEMPTS {
                    tokio::time::sleep(SPAWN_RETRY_DELAY).await;
                }
            }
        }
    }

    error!(worker = %id, attempts = SPAWN_ATTEMPTS, "Giving up on worker");
    supervisor.mark_failed(id);
}
