// Observability infrastructure using tracing crate
// Structured JSON logs so the shutdown timeline can be reconstructed after the fact

use anyhow::Result;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

const DEFAULT_FILTER: &str = "pear_fleet=info,hyper=warn";
const VERBOSE_FILTER: &str = "pear_fleet=debug,hyper=warn";

/// Initialize the observability system
/// Sets up structured logging to stdout with JSON formatting for machine parsing
pub fn init(verbose: bool) -> Result<()> {
    let fmt_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_current_span(true)
        .with_span_list(true)
        .with_thread_ids(true)
        .with_span_events(FmtSpan::CLOSE);

    // Example: RUST_LOG=pear_fleet=debug
    let filter_layer = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(if verbose { VERBOSE_FILTER } else { DEFAULT_FILTER })?,
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .try_init()?;

    Ok(())
}
