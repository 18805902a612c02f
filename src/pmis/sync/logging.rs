//! Tracing subscriber set-up for the command line tool.

use std::fs::OpenOptions;
use std::path::Path;

use clap::ValueEnum;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use crate::pmis::sync::error::{Result, SyncError};

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    #[value(alias = "pretty")]
    Text,
    Json,
}

/// Parses a verbosity name; unknown names fall back to `info`.
pub fn parse_level(verbosity: &str) -> Level {
    match verbosity.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Installs the global subscriber.
///
/// `RUST_LOG` overrides `verbosity`. With `log_file`, every line is also
/// appended to that file; keep the returned guard alive until exit so the
/// file writer flushes.
pub fn init(verbosity: &str, format: LogFormat, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let level = parse_level(verbosity);
    let filter = || {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()))
    };

    let console = match format {
        LogFormat::Text => fmt::layer()
            .with_target(false)
            .with_span_events(FmtSpan::CLOSE)
            .with_filter(filter())
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_filter(filter())
            .boxed(),
    };

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|err| {
                    SyncError::Logging(format!("cannot open {}: {err}", path.display()))
                })?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(writer)
                .with_filter(filter())
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .try_init()
        .map_err(|err| SyncError::Logging(err.to_string()))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_names_map_to_levels() {
        assert_eq!(parse_level("DEBUG"), Level::DEBUG);
        assert_eq!(parse_level("warning"), Level::WARN);
        assert_eq!(parse_level("loud"), Level::INFO);
    }

    #[test]
    fn log_formats_parse() {
        assert_eq!(LogFormat::from_str("json", true).ok(), Some(LogFormat::Json));
        assert_eq!(LogFormat::from_str("Text", true).ok(), Some(LogFormat::Text));
        assert_eq!(LogFormat::from_str("pretty", false).ok(), Some(LogFormat::Text));
        assert!(LogFormat::from_str("xml", true).is_err());
    }
}
