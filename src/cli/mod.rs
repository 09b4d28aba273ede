// Command Line Interface Module
// clap-based CLI for running and operating the worker fleet

pub mod commands;

use crate::shutdown::{ShutdownReport, WorkerOutcome};
use clap::{Parser, Subcommand};
use colored::*;

/// Pear Fleet - one supervised worker process per repository
#[derive(Parser)]
#[command(name = "pear-fleet")]
#[command(author = "Pear Server Team")]
#[command(version)]
#[command(about = "🍐 Pear Fleet - per-repository worker supervisor with deterministic shutdown", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the supervisor and its workers
    Start {
        /// Configuration file path
        #[arg(short, long, default_value = "pear-fleet.toml")]
        config: String,

        /// Where to record the supervisor's pid
        #[arg(short, long, default_value = "pear-fleet.pid")]
        pid_file: String,

        /// Enable verbose logging
        #[arg(short, long)]
        verbose: bool,
    },

    /// Ask a running supervisor to shut down
    Stop {
        #[arg(short, long, default_value = "pear-fleet.pid")]
        pid_file: String,

        /// Send SIGKILL instead of SIGTERM (skips the orderly shutdown)
        #[arg(short, long)]
        force: bool,
    },

    /// Validate configuration file
    Validate {
        #[arg(short, long, default_value = "pear-fleet.toml")]
        file: String,
    },

    /// Show which processes hold a port
    Diagnose {
        #[arg(short, long)]
        port: u16,
    },
}

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green().bold(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red().bold(), msg);
}

/// Print an info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue().bold(), msg);
}

/// Print a warning message
pub fn warning(msg: &str) {
    println!("{} {}", "⚠".yellow().bold(), msg);
}

/// Print startup banner
pub fn print_banner() {
    println!();
    println!("{}", "🍐 Pear Fleet".bright_green().bold());
    println!(
        "{}",
        format!("   worker supervisor v{}", env!("CARGO_PKG_VERSION")).bright_black()
    );
    println!();
}

/// Human-readable shutdown summary. Diagnostic only; automation should
/// rely on the exit code.
pub fn print_report(report: &ShutdownReport) {
    println!();
    println!(
        "{} session {} ({}) in {:.1}s",
        "Shutdown".bright_white().bold(),
        report.session_id.to_string().bright_black(),
        report.reason.cyan(),
        report.elapsed.as_secs_f64()
    );

    for worker in report.workers.values() {
        let outcome = worker.outcome();
        let label = match outcome {
            WorkerOutcome::Graceful => outcome.to_string().green(),
            WorkerOutcome::Terminated | WorkerOutcome::FailedBeforeShutdown => outcome.to_string().yellow(),
            WorkerOutcome::Killed | WorkerOutcome::VerificationFailed => outcome.to_string().red(),
        };
        println!(
            "  {:<24} port {:<5} {:<20} {:.1}s",
            worker.id,
            worker.port,
            label,
            worker.elapsed.as_secs_f64()
        );
        for failure in &worker.failures {
            println!("    {} {}", "↳".red(), failure);
        }
    }

    for failure in &report.resource_failures {
        error(&format!("resource {}: {}", failure.name, failure.error));
    }
    for fault in &report.faults {
        error(&fault.to_string());
    }

    if report.exit_code() == 0 {
        success(&report.classification.to_string());
    } else {
        warning(&report.classification.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::parse_from(["pear-fleet", "start", "--config", "fleet.toml"]);
        match cli.command {
            Commands::Start { config, pid_file, verbose } => {
                assert_eq!(config, "fleet.toml");
                assert_eq!(pid_file, "pear-fleet.pid");
                assert!(!verbose);
            }
            _ => panic!("expected start"),
        }
    }

    #[test]
    fn test_diagnose_requires_port() {
        assert!(Cli::try_parse_from(["pear-fleet", "diagnose"]).is_err());
        assert!(Cli::try_parse_from(["pear-fleet", "diagnose", "--port", "9001"]).is_ok());
    }
}
