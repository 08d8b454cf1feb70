//! Tracing setup for the daemon.
//!
//! Everything goes to stderr; results that matter to humans are written back to
//! the tracker, not logged.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `info`, or `debug` when `verbose` is set.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=alm_orchestrator=debug alm-orchestrator once
/// ```
pub fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
