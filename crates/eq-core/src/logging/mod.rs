//! Structured logging for the equeue CLI.
//!
//! - stdout is reserved for command payloads (JSON/Markdown output)
//! - stderr receives all log output, human-readable or JSONL
//! - every invocation gets a run id recorded on the root span

pub mod config;

pub use config::{LogConfig, LogFormat, LogLevel};

use std::io::IsTerminal;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the logging subsystem.
///
/// Must be called once at startup before any logging occurs. A second call
/// is ignored.
pub fn init_logging(config: &LogConfig) {
    let filter = EnvFilter::try_new(config.filter_directives())
        .unwrap_or_else(|_| EnvFilter::new(LogConfig::default().filter_directives()));

    let result = match config.format {
        LogFormat::Human => {
            let use_ansi = std::io::stderr().is_terminal();
            let layer = fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_ansi(use_ansi);
            if config.timestamps {
                tracing_subscriber::registry().with(filter).with(layer).try_init()
            } else {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(layer.without_time())
                    .try_init()
            }
        }
        LogFormat::Jsonl => {
            let layer = fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_current_span(true)
                .with_span_list(false);
            tracing_subscriber::registry().with(filter).with(layer).try_init()
        }
    };
    if result.is_err() {
        tracing::debug!("logging already initialized");
    }
}

/// Generate a unique run ID for this invocation.
pub fn generate_run_id() -> String {
    let uuid = uuid::Uuid::new_v4();
    // First 12 hex chars are enough to correlate one run's lines
    format!("run-{}", &uuid.simple().to_string()[..12])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_are_short_and_unique() {
        let a = generate_run_id();
        let b = generate_run_id();
        assert!(a.starts_with("run-"));
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
    }

    #[test]
    fn init_twice_does_not_panic() {
        let config = LogConfig::default().with_level(LogLevel::Off);
        init_logging(&config);
        init_logging(&config);
    }
}
