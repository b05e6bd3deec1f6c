//! Logging initialization for the `cascade` binary.
//!
//! Library code only emits `tracing` events; installing a subscriber is left
//! to the binary.

use crate::config::LogFormat;
use std::sync::Once;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable with an `EnvFilter` directive overriding the configured level.
pub const LOG_ENV: &str = "CASCADE_LOG";

static INIT: Once = Once::new();

/// Build the filter: `CASCADE_LOG` if set and valid, else `level`, else `info`.
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Logs go to stderr so stdout stays usable
/// for JSON output. Subsequent calls are no-ops.
pub fn init(level: &str, format: LogFormat) {
    INIT.call_once(|| {
        let filter = env_filter(level);
        let registry = tracing_subscriber::registry().with(filter);

        let result = match format {
            LogFormat::Json => registry
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .try_init(),
            LogFormat::Pretty => registry
                .with(
                    fmt::layer()
                        .with_target(false)
                        .compact()
                        .with_writer(std::io::stderr),
                )
                .try_init(),
        };
        if let Err(e) = result {
            eprintln!("cascade: logging already initialized: {}", e);
        }
    });
}
