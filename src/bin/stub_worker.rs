// Stub Worker
// Minimal Worker Entry Point used by the integration tests and for local fleet trials.
// Serves the control endpoint and can be told to misbehave in the ways real workers do.

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use serde_json::{json, Value};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pear-stub-worker")]
#[command(about = "Stand-in worker process for pear-fleet")]
struct Args {
    /// Port to serve on
    #[arg(long, env = "PEAR_WORKER_PORT")]
    port: u16,

    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    /// Accept POST /shutdown but never answer it or stop
    #[arg(long)]
    hang_shutdown: bool,

    /// Ignore SIGTERM so only SIGKILL stops the process
    #[arg(long)]
    ignore_sigterm: bool,

    /// Exit with status 1 after this many milliseconds
    #[arg(long)]
    crash_after_ms: Option<u64>,

    /// Never bind the port
    #[arg(long)]
    no_listen: bool,

    /// Leave a SIGTERM-immune child in the process group
    #[arg(long)]
    spawn_straggler: bool,
}

#[derive(Clone)]
struct WorkerState {
    stop: Arc<Notify>,
    hang_shutdown: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let worker_id = std::env::var("PEAR_WORKER_ID").unwrap_or_else(|_| "stub".to_string());
    info!(worker = %worker_id, port = args.port, "Stub worker starting");

    if args.ignore_sigterm {
        // SAFETY: installs SIG_IGN before any other thread cares about SIGTERM.
        unsafe {
            libc::signal(libc::SIGTERM, libc::SIG_IGN);
        }
    }

    if args.spawn_straggler {
        // Ignored dispositions survive exec, so the sleep outlives a SIGTERM
        // to the group and keeps the group alive after we exit.
        let child = std::process::Command::new("sh")
            .args(["-c", "trap '' TERM; exec sleep 60"])
            .stdin(std::process::Stdio::null())
            .spawn()?;
        info!(pid = child.id(), "Straggler spawned");
    }

    if let Some(ms) = args.crash_after_ms {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            warn!("Simulated crash");
            std::process::exit(1);
        });
    }

    if args.no_listen {
        info!("Not listening; waiting to be signalled");
        std::future::pending::<()>().await;
    }

    let state = WorkerState {
        stop: Arc::new(Notify::new()),
        hang_shutdown: args.hang_shutdown,
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/shutdown", post(shutdown))
        .with_state(state.clone());

    let addr = SocketAddr::new(args.host, args.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Stub worker listening on http://{}", addr);

    let stop = state.stop.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { stop.notified().await })
        .await?;

    info!(worker = %worker_id, "Stub worker stopped");
    Ok(())
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn shutdown(State(state): State<WorkerState>) -> Json<Value> {
    if state.hang_shutdown {
        warn!("Shutdown requested; hanging");
        std::future::pending::<()>().await;
    }

    info!("Shutdown requested");
    state.stop.notify_one();
    Json(json!({ "status": "shutdown_initiated" }))
}
