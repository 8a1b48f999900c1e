//! Logging setup.
//!
//! One call installs the global `tracing` subscriber on stderr: plain text
//! by default, one JSON object per line when `VIDCAST_LOG_FORMAT=json`.
//! Call sites log ids and error kinds only; token values, ciphertext, and
//! caption bodies never reach a log record.

use tracing_subscriber::EnvFilter;

/// Output encoding for the global subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

fn parse_format(value: &str) -> LogFormat {
    if value.eq_ignore_ascii_case("json") {
        LogFormat::Json
    } else {
        LogFormat::Text
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `default_level`.
///
/// # Panics
///
/// Panics if a subscriber has already been installed.
pub fn init(format: LogFormat, default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .json()
                .flatten_event(true)
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .init();
        }
    }
}

/// Initialize from `VIDCAST_LOG_FORMAT` / `VIDCAST_LOG_LEVEL`, defaulting
/// to text at info level.
pub fn init_default() {
    let format = std::env::var("VIDCAST_LOG_FORMAT")
        .map(|v| parse_format(&v))
        .unwrap_or(LogFormat::Text);
    let level = std::env::var("VIDCAST_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    init(format, &level);
}
