//! Structured logging setup.
//!
//! Components emit `tracing` events named after what happened
//! (`breaker.transition`, `cache.hit`, `retry.attempt`, `failsafe.halt`, ...).
//! Binaries call [`init`] once; libraries and tests never install a
//! subscriber themselves.

use tracing_subscriber::{fmt, EnvFilter};

/// Log output shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Install the global subscriber, writing to stderr.
///
/// `RUST_LOG` wins over `default_directive`. Returns `false` when a
/// subscriber was already installed.
pub fn init(default_directive: &str, format: LogFormat) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.try_init().is_ok(),
        LogFormat::Json => builder.json().try_init().is_ok(),
    }
}
