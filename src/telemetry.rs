//! Tracing initialisation for embedders that want the engine's default
//! subscriber. Library code only emits events; installing a subscriber is
//! always the caller's choice.

use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

use crate::config::LogLevel;

/// Install a global `fmt` subscriber filtered by the configured level.
///
/// `RUST_LOG` takes precedence when set. Safe to call more than once; only
/// the first call installs.
pub fn init_tracing(level: LogLevel) {
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(level.as_filter()));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();
    });
}
