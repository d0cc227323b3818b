//! Tracing subscriber initialization.
//!
//! Filtering is driven by `RUST_LOG`; the engine logs under the `jobmanager`
//! target, so `RUST_LOG=jobmanager=debug` shows every job state transition.

use tracing_subscriber::EnvFilter;

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize JSON tracing for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter())
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_thread_names(true)
        .with_target(true)
        .try_init();
}

/// Initialize compact, human-readable tracing.
pub fn init_pretty() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter())
        .compact()
        .with_thread_names(true)
        .try_init();
}
