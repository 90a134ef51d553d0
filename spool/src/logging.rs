//! Logging infrastructure for the daemon.
//!
//! Structured logging with dual output:
//! - a non-blocking file writer under the log directory
//! - stdout, for interactive runs and journal capture
//!
//! The verbosity flags (`-v`, `-vv`) raise the default level; the
//! `RUST_LOG` environment variable overrides everything.

use std::io;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Guard that must be kept alive for the duration of logging.
///
/// Dropping it flushes and closes the log file writer.
pub struct LoggingGuard {
    _file_guard: WorkerGuard,
}

/// Default level for a verbosity count: 0 -> info, 1 -> debug, 2+ ->
/// trace.
pub fn level_for_verbosity(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Initializes the global subscriber with a file and a stdout layer.
pub fn init_logging(
    log_dir: &Path,
    log_file: &str,
    verbosity: u8,
) -> Result<LoggingGuard, io::Error> {
    std::fs::create_dir_all(log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, log_file);
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false);

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_ansi(true);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_for_verbosity(verbosity)));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

/// Default log directory.
pub fn default_log_dir() -> &'static str {
    "/var/log/spool"
}

/// Default log file name.
pub fn default_log_file() -> &'static str {
    "spoold.log"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_mapping() {
        assert_eq!(level_for_verbosity(0), "info");
        assert_eq!(level_for_verbosity(1), "debug");
        assert_eq!(level_for_verbosity(2), "trace");
        assert_eq!(level_for_verbosity(9), "trace");
    }

    #[test]
    fn test_default_paths() {
        assert_eq!(default_log_dir(), "/var/log/spool");
        assert_eq!(default_log_file(), "spoold.log");
    }

    // Note: init_logging installs a global subscriber that can only be
    // set once per process; actual output is covered by integration
    // runs, not unit tests.
}
