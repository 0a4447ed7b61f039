//! Logging utilities for the bridge
//!
//! Structured `tracing` events for reference counting, conversions, callbacks
//! and foreign errors. Nothing is printed unless the host installs a
//! subscriber, either its own or the one built by [`init_logging`].

use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

// Re-export tracing macros for use throughout the crate
pub use tracing::{debug, error, info, trace, warn, Level};

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

/// Log output destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    Stderr,
    /// Daily-rotated file
    File { directory: PathBuf, prefix: String },
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    pub format: LogFormat,
    pub output: LogOutput,
    /// Extra filter directives, e.g. "callback=trace"
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Compact,
            output: LogOutput::Stderr,
            filter: None,
        }
    }
}

impl LogConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // PYBRIDGE_LOG_LEVEL: trace, debug, info, warn, error
        if let Ok(level) = std::env::var("PYBRIDGE_LOG_LEVEL") {
            config.level = parse_level(&level).unwrap_or(Level::INFO);
        }

        // PYBRIDGE_LOG_FILE: path of a log file (rotated daily)
        if let Ok(path) = std::env::var("PYBRIDGE_LOG_FILE") {
            config.output = file_output(PathBuf::from(path));
        }

        if std::env::var("PYBRIDGE_LOG_JSON").is_ok() {
            config.format = LogFormat::Json;
        }

        config
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }
}

pub(crate) fn parse_level(level: &str) -> Option<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" | "warning" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

pub(crate) fn file_output(path: PathBuf) -> LogOutput {
    let directory = path
        .parent()
        .map(PathBuf::from)
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from("."));
    let prefix = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "pybridge.log".to_string());
    LogOutput::File { directory, prefix }
}

/// Event targets emitted by the bridge
pub const TARGETS: [&str; 6] = ["pybridge", "ffi", "refcount", "interop", "callback", "runtime"];

/// Default filter: every bridge target at the configured level, then the
/// extra directives
pub(crate) fn directives(config: &LogConfig) -> String {
    let level = config.level.as_str().to_lowercase();
    let mut directives = TARGETS
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",");
    if let Some(extra) = &config.filter {
        directives.push(',');
        directives.push_str(extra);
    }
    directives
}

/// Install a global subscriber
///
/// Returns the writer guard; keep it alive until shutdown so buffered lines
/// are flushed. Returns `None` if a subscriber is already installed.
pub fn init_logging(config: LogConfig) -> Option<WorkerGuard> {
    let (subscriber, guard) = subscriber(&config);
    subscriber.try_init().ok().map(|_| guard)
}

fn subscriber(config: &LogConfig) -> (impl tracing::Subscriber + Send + Sync + 'static, WorkerGuard) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives(config)));

    let (writer, guard) = match &config.output {
        LogOutput::Stdout => tracing_appender::non_blocking(std::io::stdout()),
        LogOutput::Stderr => tracing_appender::non_blocking(std::io::stderr()),
        LogOutput::File { directory, prefix } => {
            tracing_appender::non_blocking(tracing_appender::rolling::daily(directory, prefix))
        }
    };

    let ansi = !matches!(config.output, LogOutput::File { .. });
    let layer = match config.format {
        LogFormat::Pretty => fmt::layer().with_writer(writer).with_ansi(ansi).pretty().boxed(),
        LogFormat::Compact => fmt::layer().with_writer(writer).with_ansi(ansi).compact().boxed(),
        LogFormat::Json => fmt::layer().with_writer(writer).with_ansi(ansi).json().boxed(),
    };

    (tracing_subscriber::registry().with(layer.with_filter(filter)), guard)
}

/// Log a reference being claimed
#[inline]
pub fn log_claim(handle: usize, live: usize) {
    trace!(target: "refcount", handle, live, "reference claimed");
}

/// Log a reference being released
#[inline]
pub fn log_release(handle: usize, live: usize) {
    trace!(target: "refcount", handle, live, "reference released");
}

/// Log a host/foreign conversion
#[inline]
pub fn log_conversion(from: &str, to: &str) {
    trace!(target: "interop", from, to, "value conversion");
}

/// Log a foreign error surfacing on the host side
#[inline]
pub fn log_ffi_error(function_name: &str, error: &str) {
    debug!(target: "ffi", function = function_name, error, "foreign error");
}

/// Log a callback invocation from foreign code
#[inline]
pub fn log_callback(name: &str, args_count: usize, kwargs_count: usize) {
    trace!(target: "callback", name, args_count, kwargs_count, "callback invoked");
}
