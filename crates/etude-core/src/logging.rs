//! Tracing subscriber initialization.
//!
//! The log level is controlled by `RUST_LOG`:
//!
//! ```bash
//! RUST_LOG=debug etude 8080
//! RUST_LOG=etude_core=trace etude 8080
//! ```

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize logging with sensible defaults.
///
/// Call once at startup, before binding the server. Defaults to `info`
/// when `RUST_LOG` is unset.
///
/// # Panics
///
/// Panics if a global subscriber was already installed.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Initialize logging with an explicit default level instead of `RUST_LOG`.
///
/// # Panics
///
/// Panics if a global subscriber was already installed.
pub fn init_logging_with_level(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
