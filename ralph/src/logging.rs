//! Development-time tracing for the engine.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: diagnostics via `RUST_LOG`, output to stderr.
//!   Not persisted; stdout stays reserved for command output.
//!
//! - **Iteration artifacts (`io/iteration_log`)**: per-iteration files in
//!   `.ralph/iterations/`. Always written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Without it the level is `warn`, or `info` when `verbose` is set.
///
/// # Example
/// ```bash
/// RUST_LOG=ralph=debug ralph run --goal "create hello.py"
/// ```
pub fn init(verbose: bool) {
    let fallback = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
