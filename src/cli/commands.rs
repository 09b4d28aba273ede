// CLI Command Implementations
// Operator commands that do not run the supervisor itself

use super::{error, info, success, warning, Commands};
use crate::config::FleetConfig;
use crate::ports::diagnose;
use crate::shutdown::PidFile;
use anyhow::Context;
use colored::*;

/// Execute a non-daemon CLI command
pub async fn execute(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Stop { pid_file, force } => stop_command(&pid_file, force),
        Commands::Validate { file } => validate_command(&file),
        Commands::Diagnose { port } => {
            diagnose_command(port);
            Ok(())
        }
        Commands::Start { .. } => anyhow::bail!("start is handled by the daemon entry point"),
    }
}

/// Signal a running supervisor
fn stop_command(pid_file: &str, force: bool) -> anyhow::Result<()> {
    let pid = PidFile::read(pid_file)?;
    let signal = if force {
        warning("Forcing supervisor shutdown (workers will not be stopped in order)...");
        libc::SIGKILL
    } else {
        info("Sending graceful shutdown signal...");
        libc::SIGTERM
    };

    // SAFETY: plain syscall with a pid read from our own pid file.
    if unsafe { libc::kill(pid, signal) } == -1 {
        let err = std::io::Error::last_os_error();
        error(&format!("Could not signal pid {}: {}", pid, err));
        return Err(err).context("Failed to signal supervisor");
    }

    success(&format!("Signal sent to supervisor (pid {})", pid.to_string().cyan()));
    info("The supervisor's exit code reports the shutdown outcome");
    Ok(())
}

/// Load, validate and print a configuration
fn validate_command(file: &str) -> anyhow::Result<()> {
    info(&format!("Validating {}", file.bright_white()));
    let config = FleetConfig::load(file)?;

    let timeouts = config.shutdown.timeouts();
    println!();
    println!(
        "  {} {}",
        "Worker command:".bright_white(),
        config.supervisor.worker_command.display()
    );
    println!(
        "  {} graceful {:.1}s, terminate {:.1}s, kill {:.1}s, verify {:.1}s",
        "Timeouts:".bright_white(),
        timeouts.graceful.as_secs_f64(),
        timeouts.termination.as_secs_f64(),
        timeouts.kill.as_secs_f64(),
        timeouts.verification.as_secs_f64()
    );
    println!();
    for worker in &config.workers {
        println!(
            "  {:<24} port {:<5} {}",
            worker.id.cyan(),
            worker.port.to_string().yellow(),
            worker.working_directory.display()
        );
    }
    println!();

    success(&format!("Configuration is valid ({} workers)", config.workers.len()));
    Ok(())
}

fn diagnose_command(port: u16) {
    let diagnosis = diagnose::inspect(port);
    if diagnosis.is_empty() {
        success(&format!("Port {} is not in use", port));
    } else {
        warning(&diagnosis.to_string());
    }
}
