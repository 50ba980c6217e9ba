//! Tracing subscriber setup for hosts that do not install their own.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Install a formatted subscriber filtered by `RUST_LOG`, falling back to
/// `default_filter` (for example `"flexlink=debug"`).
///
/// Returns `false` when a global subscriber is already installed, which makes
/// it safe to call from every test.
pub fn init(default_filter: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .is_ok()
}
