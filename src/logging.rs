//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Compact human-readable output for interactive use.
    Human,
    /// Structured JSON for daemon mode.
    Json,
}

/// Initialize the global tracing subscriber. Call once at startup.
///
/// Respects `RUST_LOG` for filtering; defaults to `vmplane=info,warn`.
pub fn init(format: LogFormat) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vmplane=info,warn"));

    match format {
        LogFormat::Human => {
            let layer = fmt::layer().with_target(false).compact();
            tracing_subscriber::registry()
                .with(env_filter)
                .with(layer)
                .init();
        }
        LogFormat::Json => {
            let layer = fmt::layer().json().with_target(true);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(layer)
                .init();
        }
    }
}
