//! Tracing/logging initialization.
//!
//! Workers emit structured events at claims, status transitions, and
//! recovery; this wires them to JSON output with env-based filtering.

use tracing_subscriber::EnvFilter;

/// Initialize tracing/logging for the worker process.
///
/// Safe to call multiple times (subsequent calls are no-ops). Filtering is
/// configurable via `RUST_LOG`; the default keeps claim/recovery events
/// visible without per-record noise.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(true)
        .try_init();
}
