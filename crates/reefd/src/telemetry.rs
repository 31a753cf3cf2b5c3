//! Logging initialization for the proxy daemon.
//!
//! Human-readable `fmt` output, filtered by `RUST_LOG` when set and by the
//! configured `[log] level` otherwise.

use tracing_subscriber::EnvFilter;

use crate::config::LogSection;

/// Build the level filter for `config`.
fn filter(config: &LogSection) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
}

/// Install the global subscriber.
///
/// Call this once at startup, before any `tracing` events are emitted.
pub fn init(config: &LogSection) {
    tracing_subscriber::fmt().with_env_filter(filter(config)).init();
}
