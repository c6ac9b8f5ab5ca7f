//! Diagnostic tracing for the foreman service and CLI.
//!
//! Operator-facing run output is published on `runs.<id>.logs`; this module
//! only covers process diagnostics on stderr, filtered by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing subscriber once per process.
///
/// Reads `RUST_LOG`, falling back to `default_directive` when unset or
/// unparsable. Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=foreman=debug foreman serve --config foreman.toml
/// ```
pub fn init(default_directive: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    // A second init (e.g. from tests) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
