//! Logging configuration and initialization.
//!
//! This module sets up the tracing subscriber based on the application
//! configuration, supporting stdout, stderr, and file output with
//! configurable formats.

use crate::config::{LogFormat, LoggingConfig};
use std::fs::OpenOptions;
use std::io;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Maps a user-facing level name to a filter directive.
///
/// Returns `None` for names that are not a tracing level.
pub fn level_directive(level: &str) -> Option<&'static str> {
    match level.to_lowercase().as_str() {
        "trace" => Some("trace"),
        "debug" => Some("debug"),
        "info" => Some("info"),
        "warn" => Some("warn"),
        "error" => Some("error"),
        _ => None,
    }
}

/// Initializes the logging system based on configuration.
///
/// Returns a guard that must be kept alive for the duration of the program
/// to ensure all logs are flushed.
///
/// # Arguments
///
/// * `config` - The logging configuration
/// * `level_override` - Optional level override from CLI/environment
/// * `trace_deps` - If true, include verbose logging from dependencies
///
/// # Example
///
/// ```ignore
/// let config = LoggingConfig::default();
/// let _guard = init_logging(&config, None, false)?;
/// tracing::info!("Logging initialized");
/// ```
pub fn init_logging(
    config: &LoggingConfig,
    level_override: Option<String>,
    trace_deps: bool,
) -> io::Result<WorkerGuard> {
    let level = level_override.as_deref().unwrap_or(&config.level);

    // RUST_LOG wins over config and CLI
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level_filter = level_directive(level).unwrap_or("info");

        if trace_deps {
            EnvFilter::new(level_filter)
        } else {
            EnvFilter::new(format!("{},notify=warn,mio=warn", level_filter))
        }
    });

    let (writer, guard) = match config.output.to_lowercase().as_str() {
        "stdout" => tracing_appender::non_blocking(io::stdout()),
        "stderr" => tracing_appender::non_blocking(io::stderr()),
        _ => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&config.output)?;
            tracing_appender::non_blocking(file)
        }
    };

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Json => {
            let layer = fmt::layer()
                .json()
                .with_span_events(FmtSpan::CLOSE)
                .with_target(config.include_target)
                .with_writer(writer);
            if config.timestamps {
                layer.boxed()
            } else {
                layer.without_time().boxed()
            }
        }
        LogFormat::Compact => {
            let layer = fmt::layer()
                .compact()
                .with_target(config.include_target)
                .with_writer(writer);
            if config.timestamps {
                layer.boxed()
            } else {
                layer.without_time().boxed()
            }
        }
        LogFormat::Pretty => {
            let layer = fmt::layer()
                .pretty()
                .with_target(config.include_target)
                .with_writer(writer);
            if config.timestamps {
                layer.boxed()
            } else {
                layer.without_time().boxed()
            }
        }
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_directive() {
        assert_eq!(level_directive("trace"), Some("trace"));
        assert_eq!(level_directive("DEBUG"), Some("debug"));
        assert_eq!(level_directive("Info"), Some("info"));
        assert_eq!(level_directive("WARN"), Some("warn"));
        assert_eq!(level_directive("error"), Some("error"));
        assert_eq!(level_directive("super-verbose"), None);
    }
}
