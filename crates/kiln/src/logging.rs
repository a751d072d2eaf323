//! Logging initialization for kiln.
//!
//! The level is controlled by the `RUST_LOG` environment variable:
//!
//! ```bash
//! # Show connection-level events (accept, close, eviction)
//! RUST_LOG=kiln=debug kiln -p 9006
//!
//! # Only warnings and errors
//! RUST_LOG=warn kiln
//! ```
//!
//! Every initializer uses `try_init`, so a second call (tests, embedding)
//! keeps the first subscriber instead of panicking.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use tracing::Subscriber;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LogFormat, ServerConfig};
use crate::error::KilnResult;

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Initialize logging with sensible defaults (`info` unless `RUST_LOG` says otherwise).
pub fn init_logging() {
    init_logging_with_level("info");
}

/// Initialize logging with a specific default level.
pub fn init_logging_with_level(level: &str) {
    let _ = tracing_subscriber::registry()
        .with(filter(level))
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .try_init();
}

/// Multi-line, colorized output for local debugging.
pub fn init_logging_pretty() {
    let _ = tracing_subscriber::registry()
        .with(filter("info"))
        .with(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_line_number(true)
                .with_thread_ids(true)
                .with_target(true),
        )
        .try_init();
}

/// One JSON object per event, for log aggregation.
pub fn init_logging_json() {
    let _ = tracing_subscriber::registry()
        .with(filter("info"))
        .with(tracing_subscriber::fmt::layer().json())
        .try_init();
}

/// Subscriber appending `format` lines to `path`, without ANSI colours.
fn file_subscriber(path: &Path, format: LogFormat) -> KilnResult<Box<dyn Subscriber + Send + Sync>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(Mutex::new(file))
        .with_ansi(false);
    let registry = tracing_subscriber::registry().with(filter("info"));
    let subscriber: Box<dyn Subscriber + Send + Sync> = match format {
        LogFormat::Plain => Box::new(registry.with(layer.with_thread_names(true))),
        LogFormat::Pretty => Box::new(registry.with(layer.pretty())),
        LogFormat::Json => Box::new(registry.with(layer.json())),
    };
    Ok(subscriber)
}

/// Log to a file, e.g. `./ServerLog`. Fails if the file cannot be opened.
pub fn init_logging_to_file(path: impl AsRef<Path>, format: LogFormat) -> KilnResult<()> {
    let _ = file_subscriber(path.as_ref(), format)?.try_init();
    Ok(())
}

/// Install the subscriber `config` asks for: nothing when `close_log` is
/// set, the log file when one is configured, stderr otherwise.
pub fn init_from_config(config: &ServerConfig) -> KilnResult<()> {
    if config.close_log {
        let _ = tracing_subscriber::registry()
            .with(EnvFilter::new("off"))
            .with(tracing_subscriber::fmt::layer())
            .try_init();
        return Ok(());
    }
    if let Some(path) = &config.log_file {
        return init_logging_to_file(path, config.log_format);
    }
    match config.log_format {
        LogFormat::Plain => init_logging(),
        LogFormat::Pretty => init_logging_pretty(),
        LogFormat::Json => init_logging_json(),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_subscriber_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ServerLog");
        std::fs::write(&path, "earlier line\n").unwrap();

        let subscriber = file_subscriber(&path, LogFormat::Plain).unwrap();
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(slot = 3, "connection evicted");
        });

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("earlier line\n"));
        assert!(text.contains("connection evicted"));
        assert!(text.contains("slot=3"));
        assert!(!text.contains('\u{1b}'));
    }

    #[test]
    fn test_json_file_lines_parse_as_objects() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kiln.json");

        let subscriber = file_subscriber(&path, LogFormat::Json).unwrap();
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!("busy");
        });

        let text = std::fs::read_to_string(&path).unwrap();
        let line = text.lines().next().unwrap();
        assert!(line.starts_with('{') && line.ends_with('}'));
        assert!(line.contains("\"busy\""));
    }

    #[test]
    fn test_unopenable_log_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(file_subscriber(&dir.path().join("missing/dir/log"), LogFormat::Plain).is_err());
    }
}
