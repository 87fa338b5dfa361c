//! Logging initialisation.
//!
//! The core only emits `tracing` events; binaries decide where they go.
//! The level is controlled by `RUST_LOG`:
//!
//! ```bash
//! RUST_LOG=debug fugue 127.0.0.1 8080 ./www
//! RUST_LOG=fugue_core=trace,info fugue 127.0.0.1 8080 ./www
//! ```

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global fmt subscriber.
///
/// # Panics
///
/// Panics if a global subscriber is already installed. Use
/// [`try_init_logging`] when that can happen (tests, embedding).
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(default_filter())
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .init();
}

/// Like [`init_logging`] but returns `false` instead of panicking when a
/// subscriber is already set.
pub fn try_init_logging() -> bool {
    tracing_subscriber::registry()
        .with(default_filter())
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .try_init()
        .is_ok()
}
