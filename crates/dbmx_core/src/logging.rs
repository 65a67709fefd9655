//! Structured logging setup.
//!
//! Interactive sessions log to stderr so stdout stays free for command
//! output. Non-interactive runs write a daily rolling file under the
//! workspace log directory and echo warnings to stderr. If the file sink
//! cannot be set up, logging degrades to stderr only.

use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

/// Environment variable consulted before RUST_LOG.
pub const LOG_ENV: &str = "DBMX_LOG";

const LOG_FILE_PREFIX: &str = "dbmx";

type InitError = Box<dyn std::error::Error + Send + Sync>;

/// Logging configuration.
pub struct LogConfig {
    /// Directory for log files
    pub log_dir: PathBuf,
    /// Whether stdout is an interactive terminal
    pub is_tty: bool,
    /// Filter directives that override the environment
    pub log_filter: Option<String>,
}

impl LogConfig {
    /// Create a configuration, probing stdout for a terminal.
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir, is_tty: atty::is(atty::Stream::Stdout), log_filter: None }
    }

    /// Override the filter directives.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = Some(filter.into());
        self
    }

    /// Where events are written under this configuration.
    pub fn sink(&self) -> LogSink {
        if self.is_tty {
            LogSink::Stderr
        } else {
            LogSink::RollingFile(self.log_dir.clone())
        }
    }
}

/// Destination for log events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSink {
    Stderr,
    /// Daily files in this directory, warnings echoed to stderr
    RollingFile(PathBuf),
}

/// Keeps the background file writer alive; dropping it flushes.
pub struct LoggingGuard {
    _worker_guard: Option<WorkerGuard>,
}

/// Install the global subscriber.
///
/// A subscriber that is already installed is left in place.
pub fn init_logging(config: LogConfig) -> LoggingGuard {
    let directives = filter_directives(config.log_filter.as_deref(), |key| std::env::var(key).ok());

    let worker_guard = match config.sink() {
        LogSink::Stderr => {
            install_stderr(&directives);
            None
        }
        LogSink::RollingFile(dir) => match install_rolling_file(&dir, &directives) {
            Ok(guard) => Some(guard),
            Err(e) => {
                eprintln!("Warning: file logging unavailable ({e}); logging to stderr");
                install_stderr(&directives);
                None
            }
        },
    };

    LoggingGuard { _worker_guard: worker_guard }
}

fn install_stderr(directives: &str) {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::new(directives))
        .with_target(false)
        .try_init();
}

fn install_rolling_file(dir: &Path, directives: &str) -> Result<WorkerGuard, InitError> {
    std::fs::create_dir_all(dir)?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .build(dir)?;
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let writer = std::io::stderr.with_max_level(tracing::Level::WARN).and(file_writer);

    tracing_subscriber::fmt()
        .with_writer(writer)
        .with_env_filter(EnvFilter::new(directives))
        .with_ansi(false)
        .try_init()?;

    Ok(guard)
}

/// Resolve filter directives.
///
/// The explicit override wins, then `DBMX_LOG`, then `RUST_LOG`, then the
/// build default. Directives that do not parse are skipped.
pub fn filter_directives(
    explicit: Option<&str>,
    lookup: impl Fn(&str) -> Option<String>,
) -> String {
    explicit
        .map(str::to_string)
        .into_iter()
        .chain(lookup(LOG_ENV))
        .chain(lookup("RUST_LOG"))
        .find(|candidate| !candidate.trim().is_empty() && EnvFilter::try_new(candidate).is_ok())
        .unwrap_or_else(|| default_log_filter().to_string())
}

/// Default directives for the current build type.
pub fn default_log_filter() -> &'static str {
    if cfg!(debug_assertions) {
        "debug,dbmx=trace,dbmx_core=trace,tokio_postgres=warn,deadpool=warn"
    } else {
        "info,tokio_postgres=warn,deadpool=warn"
    }
}
