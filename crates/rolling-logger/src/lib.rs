//! Rolling Logger
//!
//! Process-wide logger for the Trivit core:
//! - a `tracing-subscriber` fmt subscriber that also receives `log` records
//! - a size-rotated log file under the caller's log directory
//! - an in-memory circular buffer of recent lines (for "send diagnostics" style views)

mod ring;
mod writer;

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::util::SubscriberInitExt;

pub use ring::RecentLines;
pub use writer::{RollingFile, SharedSink};

static SINK: OnceLock<SharedSink> = OnceLock::new();

/// Logger errors
#[derive(Debug)]
pub enum LoggerError {
    Io(std::io::Error),
    AlreadyInitialized,
    NotInitialized,
}

impl std::fmt::Display for LoggerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoggerError::Io(e) => write!(f, "Log file error: {}", e),
            LoggerError::AlreadyInitialized => write!(f, "Logger already initialized"),
            LoggerError::NotInitialized => write!(f, "Logger not initialized"),
        }
    }
}

impl std::error::Error for LoggerError {}

impl From<std::io::Error> for LoggerError {
    fn from(e: std::io::Error) -> Self {
        LoggerError::Io(e)
    }
}

/// Tuning knobs; the defaults suit a phone-sized app.
#[derive(Debug, Clone)]
pub struct LoggerOptions {
    pub level: log::LevelFilter,
    pub max_file_bytes: u64,
    pub max_files: usize,
    pub recent_capacity: usize,
}

impl Default for LoggerOptions {
    fn default() -> Self {
        Self {
            level: log::LevelFilter::Info,
            max_file_bytes: 512 * 1024,
            max_files: 3,
            recent_capacity: 200,
        }
    }
}

/// Initialize the global logger with default options.
pub fn init_logger(log_dir: impl AsRef<Path>, app_name: &str) -> Result<(), LoggerError> {
    init_logger_with(log_dir, app_name, LoggerOptions::default())
}

pub fn init_logger_with(
    log_dir: impl AsRef<Path>,
    app_name: &str,
    options: LoggerOptions,
) -> Result<(), LoggerError> {
    if SINK.get().is_some() {
        return Err(LoggerError::AlreadyInitialized);
    }

    let path = log_dir.as_ref().join(format!("{}.log", app_name));
    let file = RollingFile::open(path, options.max_file_bytes, options.max_files)?;
    let sink = SharedSink::new(file, options.recent_capacity);

    tracing_subscriber::fmt()
        .with_writer(sink.clone())
        .with_ansi(false)
        .with_target(true)
        .with_max_level(to_tracing_level(options.level))
        .finish()
        .try_init()
        .map_err(|_| LoggerError::AlreadyInitialized)?;
    log::set_max_level(options.level);

    SINK.set(sink).map_err(|_| LoggerError::AlreadyInitialized)?;

    tracing::info!(
        target: "rolling_logger",
        "{} logger started at {}",
        app_name,
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f")
    );
    Ok(())
}

fn to_tracing_level(level: log::LevelFilter) -> LevelFilter {
    match level {
        log::LevelFilter::Off => LevelFilter::OFF,
        log::LevelFilter::Error => LevelFilter::ERROR,
        log::LevelFilter::Warn => LevelFilter::WARN,
        log::LevelFilter::Info => LevelFilter::INFO,
        log::LevelFilter::Debug => LevelFilter::DEBUG,
        log::LevelFilter::Trace => LevelFilter::TRACE,
    }
}

fn ensure_initialized() -> Result<(), LoggerError> {
    SINK.get().map(|_| ()).ok_or(LoggerError::NotInitialized)
}

pub fn info(message: &str) -> Result<(), LoggerError> {
    ensure_initialized()?;
    tracing::info!(target: "app", "{}", message);
    Ok(())
}

pub fn warn(message: &str) -> Result<(), LoggerError> {
    ensure_initialized()?;
    tracing::warn!(target: "app", "{}", message);
    Ok(())
}

pub fn error(message: &str) -> Result<(), LoggerError> {
    ensure_initialized()?;
    tracing::error!(target: "app", "{}", message);
    Ok(())
}

/// Most recent formatted lines, oldest first. Empty before initialization.
pub fn recent_lines() -> Vec<String> {
    SINK.get().map(|sink| sink.recent_lines()).unwrap_or_default()
}

/// Path of the active log file, if the logger is running.
pub fn log_file_path() -> Option<PathBuf> {
    SINK.get().map(|sink| sink.file_path())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    // The subscriber is process-global, so everything that needs it lives in one test.
    #[test]
    fn test_logger_lifecycle() {
        assert!(matches!(info("too early"), Err(LoggerError::NotInitialized)));

        let dir = tempdir().unwrap();
        init_logger(dir.path(), "TestApp").unwrap();

        info("hello from helper").unwrap();
        log::warn!("bridged from the log facade");

        let lines = recent_lines();
        assert!(lines.iter().any(|l| l.contains("hello from helper")));
        assert!(lines.iter().any(|l| l.contains("bridged from the log facade")));
        assert_eq!(log_file_path(), Some(dir.path().join("TestApp.log")));

        assert!(matches!(
            init_logger(dir.path(), "TestApp"),
            Err(LoggerError::AlreadyInitialized)
        ));
    }
}
