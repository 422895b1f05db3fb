//! tracing subscriber setup for the binary.
//!
//! Console output goes to stderr so command output on stdout stays
//! machine-readable. `RUST_LOG` overrides the default filter.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Default filter when `RUST_LOG` is unset.
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose { "shipwright=debug,info" } else { "shipwright=info,warn" }
}

/// Install the global subscriber. With `log_dir`, JSON lines are also
/// appended to a daily-rotated `shipwright.log` there; keep the returned
/// guard alive until exit so buffered lines are flushed.
pub fn init(verbose: bool, format: LogFormat, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    let console = match format {
        LogFormat::Text => fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .boxed(),
        LogFormat::Json => fmt::layer().json().with_writer(std::io::stderr).boxed(),
    };

    let (file, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "shipwright.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    // a subscriber may already be installed (tests, embedding)
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init();
    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive() {
        assert!(default_directive(true).contains("debug"));
        assert!(!default_directive(false).contains("debug"));
    }

    #[test]
    fn test_init_with_file_layer_returns_guard() {
        let dir = tempfile::tempdir().unwrap();
        let guard = init(false, LogFormat::Json, Some(dir.path()));
        assert!(guard.is_some());
        assert!(init(false, LogFormat::Text, None).is_none());
    }
}
