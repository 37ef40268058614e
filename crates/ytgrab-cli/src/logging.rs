//! Subscriber setup for the `ytgrab` binary.
//!
//! Console diagnostics go to stderr so stdout carries only task updates. A
//! rotating JSON log is written under the user's data directory when
//! [`LoggingConfig::file`] is set.

use std::path::PathBuf;

use tracing::Level;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Crates whose events are shown at the configured level. Everything else
/// is limited to warnings.
const OWN_TARGETS: [&str; 2] = ["ytgrab", "ytgrab_core"];

/// Rotation schedule of the log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRotation {
    /// One file per hour.
    Hourly,
    /// One file per day.
    Daily,
    /// A single file.
    Never,
}

impl LogRotation {
    fn rotation(self) -> Rotation {
        match self {
            Self::Hourly => Rotation::HOURLY,
            Self::Daily => Rotation::DAILY,
            Self::Never => Rotation::NEVER,
        }
    }
}

/// Where and how the JSON log file is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFile {
    /// Directory holding the log files.
    pub directory: PathBuf,
    /// File name prefix, followed by the rotation date.
    pub prefix: String,
    /// Rotation schedule.
    pub rotation: LogRotation,
    /// Rotated files to keep; 0 keeps everything.
    pub keep: usize,
    /// Most verbose level written to the file.
    pub level: Level,
}

impl LogFile {
    fn new(rotation: LogRotation, keep: usize, level: Level) -> Self {
        Self {
            directory: default_log_directory(),
            prefix: "ytgrab".to_string(),
            rotation,
            keep,
            level,
        }
    }
}

/// Logging setup for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Most verbose console level when `RUST_LOG` is unset.
    pub console_level: Level,
    /// Colored console output.
    pub ansi: bool,
    /// File sink, if any.
    pub file: Option<LogFile>,
}

impl LoggingConfig {
    /// Debug builds: chatty console, hourly trace-level files.
    #[must_use]
    pub fn development() -> Self {
        Self {
            console_level: Level::DEBUG,
            ansi: true,
            file: Some(LogFile::new(LogRotation::Hourly, 24, Level::TRACE)),
        }
    }

    /// Release builds: warnings on the console, daily debug-level files.
    #[must_use]
    pub fn production() -> Self {
        Self {
            console_level: Level::WARN,
            ansi: true,
            file: Some(LogFile::new(LogRotation::Daily, 7, Level::DEBUG)),
        }
    }

    /// Picks [`development`](Self::development) or
    /// [`production`](Self::production) from the build profile.
    #[must_use]
    pub fn auto() -> Self {
        if cfg!(debug_assertions) {
            Self::development()
        } else {
            Self::production()
        }
    }

    /// Overrides the console level.
    #[must_use]
    pub const fn with_console_level(mut self, level: Level) -> Self {
        self.console_level = level;
        self
    }

    /// Console only.
    #[must_use]
    pub fn without_file(mut self) -> Self {
        self.file = None;
        self
    }

    /// Plain console output.
    #[must_use]
    pub const fn without_ansi(mut self) -> Self {
        self.ansi = false;
        self
    }
}

/// Flushes the file writer when dropped. Keep it alive until exit.
#[must_use = "dropping the guard stops file logging"]
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// `warn` for dependencies, `level` for our own crates.
fn directives(level: Level) -> String {
    let level = level.as_str().to_lowercase();
    OWN_TARGETS
        .iter()
        .fold("warn".to_string(), |acc, target| format!("{acc},{target}={level}"))
}

fn console_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives(level)))
}

fn file_writer(file: &LogFile) -> Result<(NonBlocking, WorkerGuard), LoggingError> {
    std::fs::create_dir_all(&file.directory).map_err(|e| LoggingError::DirectoryCreationFailed {
        path: file.directory.clone(),
        reason: e.to_string(),
    })?;

    let mut builder = RollingFileAppender::builder()
        .rotation(file.rotation.rotation())
        .filename_prefix(file.prefix.clone());
    if file.keep > 0 {
        builder = builder.max_log_files(file.keep);
    }
    let appender = builder
        .build(&file.directory)
        .map_err(|e| LoggingError::AppenderFailed(e.to_string()))?;
    Ok(tracing_appender::non_blocking(appender))
}

/// Installs the global subscriber.
///
/// # Errors
///
/// Fails if the log directory or appender cannot be created, or if a
/// subscriber is already installed.
pub fn init(config: &LoggingConfig) -> Result<LoggingGuard, LoggingError> {
    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(config.ansi)
        .with_target(config.console_level >= Level::DEBUG)
        .with_filter(console_filter(config.console_level));

    let (file_layer, file_guard) = match &config.file {
        Some(file) => {
            let (writer, guard) = file_writer(file)?;
            let layer = fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .with_file(true)
                .with_line_number(true)
                .with_filter(EnvFilter::new(directives(file.level)));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .try_init()
        .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;

    Ok(LoggingGuard { _file: file_guard })
}

/// `<data_local_dir>/ytgrab/logs`, or `./ytgrab/logs` without a home.
#[must_use]
pub fn default_log_directory() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ytgrab")
        .join("logs")
}

/// Logging setup failures. None of them is fatal for the binary.
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    /// The log directory could not be created.
    #[error("cannot create log directory {}: {reason}", path.display())]
    DirectoryCreationFailed {
        /// Directory that was requested.
        path: PathBuf,
        /// OS error text.
        reason: String,
    },

    /// The rolling appender rejected its settings.
    #[error("cannot open log file: {0}")]
    AppenderFailed(String),

    /// Another subscriber was installed first.
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profiles() {
        let dev = LoggingConfig::development();
        assert_eq!(dev.console_level, Level::DEBUG);
        let file = dev.file.expect("file sink");
        assert_eq!(file.rotation, LogRotation::Hourly);
        assert_eq!(file.level, Level::TRACE);

        let prod = LoggingConfig::production();
        assert_eq!(prod.console_level, Level::WARN);
        let file = prod.file.expect("file sink");
        assert_eq!(file.rotation, LogRotation::Daily);
        assert_eq!(file.keep, 7);
    }

    #[test]
    fn test_builders() {
        let config = LoggingConfig::production()
            .with_console_level(Level::INFO)
            .without_ansi();
        assert_eq!(config.console_level, Level::INFO);
        assert!(!config.ansi);
        assert!(config.file.is_some());
        assert!(config.without_file().file.is_none());
    }

    #[test]
    fn test_directives_scope_own_crates() {
        assert_eq!(directives(Level::INFO), "warn,ytgrab=info,ytgrab_core=info");
        assert_eq!(directives(Level::TRACE), "warn,ytgrab=trace,ytgrab_core=trace");
    }

    #[test]
    fn test_rotation_mapping() {
        assert_eq!(LogRotation::Hourly.rotation(), Rotation::HOURLY);
        assert_eq!(LogRotation::Never.rotation(), Rotation::NEVER);
    }

    #[test]
    fn test_default_log_directory() {
        assert!(default_log_directory().ends_with("ytgrab/logs"));
    }

    #[test]
    fn test_file_writer_creates_directory() {
        let temp = tempfile::TempDir::new().expect("temp dir");
        let mut file = LogFile::new(LogRotation::Never, 0, Level::DEBUG);
        file.directory = temp.path().join("nested").join("logs");
        let _writer = file_writer(&file).expect("writer");
        assert!(file.directory.is_dir());
    }
}
