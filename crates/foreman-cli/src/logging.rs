//! Diagnostic tracing for the `foreman` binary.
//!
//! Session events are a separate stream: they go to stdout when
//! `--event-json` is set and are unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Reads `RUST_LOG`, defaulting to `warn`. Output goes to stderr in compact form.
///
/// ```bash
/// RUST_LOG=foreman_agent=debug foreman run --goal "..." --root ./work --script plan.json
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
