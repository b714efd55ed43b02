//! Logging setup for controllers and workers.
//!
//! Workers inherit the controller's stderr, so both sides log to the same place.
//!
//! # Environment Variables
//!
//! - `PROCJOB_LOG` - Log filter (overrides RUST_LOG)
//! - `PROCJOB_LOG_LEVEL` - Log level: error, warn, info, debug, trace
//! - `PROCJOB_LOG_FORMAT` - Output format: pretty, compact, json
//! - `PROCJOB_LOG_FILE` - Path to log file (in addition to stderr)
//! - `RUST_LOG` - Standard Rust log filter (fallback)
//!
//! # Example
//!
//! ```no_run
//! use procjob::logging::{LogConfig, init};
//!
//! init(LogConfig::default().with_env_overrides());
//! ```

use std::path::PathBuf;
use std::str::FromStr;

use tracing::{Level, Subscriber};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, MakeWriter, format::FmtSpan},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Compact => write!(f, "compact"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Log rotation for file output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogRotation {
    Hourly,
    #[default]
    Daily,
    Never,
}

impl FromStr for LogRotation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "never" => Ok(Self::Never),
            _ => Err(format!(
                "Unknown log rotation: '{}'. Valid options: hourly, daily, never",
                s
            )),
        }
    }
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base log level (default: INFO)
    pub level: Level,
    pub format: LogFormat,
    /// Also log to this file (rotated per `rotation`)
    pub file_path: Option<PathBuf>,
    pub rotation: LogRotation,
    /// Log span timing on close
    pub span_events: bool,
    /// Custom filter string (overrides level if set)
    pub filter: Option<String>,
    pub show_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            file_path: None,
            rotation: LogRotation::Daily,
            span_events: false,
            filter: None,
            show_target: true,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for worker processes: compact lines without module targets, so worker
    /// output interleaves readably with the controller's on a shared stderr.
    pub fn for_worker() -> Self {
        Self {
            format: LogFormat::Compact,
            show_target: false,
            ..Self::default()
        }
    }

    /// Level from CLI verbosity: quiet = error, 0 = warn, 1 = info, 2 = debug, 3+ = trace.
    pub fn from_verbosity(verbose: u8, quiet: bool) -> Self {
        let level = if quiet {
            Level::ERROR
        } else {
            match verbose {
                0 => Level::WARN,
                1 => Level::INFO,
                2 => Level::DEBUG,
                _ => Level::TRACE,
            }
        };
        Self::default().with_level(level)
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    pub fn with_rotation(mut self, rotation: LogRotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    pub fn with_filter(mut self, filter: String) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Apply environment variable overrides.
    ///
    /// An explicitly set filter wins over `PROCJOB_LOG`/`RUST_LOG` and
    /// `PROCJOB_LOG_LEVEL`; format and file are always taken from the environment
    /// when present.
    pub fn with_env_overrides(mut self) -> Self {
        if self.filter.is_none() {
            if let Ok(filter) = std::env::var("PROCJOB_LOG") {
                self.filter = Some(filter);
            } else if let Ok(filter) = std::env::var("RUST_LOG") {
                self.filter = Some(filter);
            }
        }

        if self.filter.is_none()
            && let Ok(level_str) = std::env::var("PROCJOB_LOG_LEVEL")
        {
            self.level = parse_level(&level_str).unwrap_or(self.level);
        }

        if let Ok(format) = std::env::var("PROCJOB_LOG_FORMAT")
            && let Ok(f) = format.parse()
        {
            self.format = f;
        }

        if let Ok(path) = std::env::var("PROCJOB_LOG_FILE") {
            self.file_path = Some(PathBuf::from(path));
        }

        self
    }

    fn build_filter(&self) -> EnvFilter {
        let default = || EnvFilter::new(self.level.to_string().to_lowercase());
        match self.filter {
            Some(ref filter) => EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("Warning: Invalid log filter '{}', using default", filter);
                default()
            }),
            None => default(),
        }
    }

    fn file_appender(&self) -> Option<RollingFileAppender> {
        let path = self.file_path.as_ref()?;
        let parent = path.parent().unwrap_or(std::path::Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("procjob.log");
        Some(RollingFileAppender::new(self.rotation.into(), parent, file_name))
    }

    fn span_events(&self) -> FmtSpan {
        if self.span_events {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }
}

fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

/// One formatting layer for `writer` in the configured format.
fn fmt_layer<S, W>(config: &LogConfig, writer: W, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    match config.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_span_events(config.span_events())
            .with_target(config.show_target)
            .with_ansi(ansi)
            .with_writer(writer)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_span_events(config.span_events())
            .with_target(config.show_target)
            .with_ansi(ansi)
            .with_writer(writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_span_events(config.span_events())
            .with_target(config.show_target)
            .with_ansi(ansi)
            .with_writer(writer)
            .boxed(),
    }
}

/// Initialize the global tracing subscriber: stderr, plus the log file if configured.
///
/// Idempotent: if a subscriber is already installed this does nothing.
pub fn init(config: LogConfig) {
    let mut layers = vec![fmt_layer(&config, std::io::stderr, true)];
    if let Some(appender) = config.file_appender() {
        layers.push(fmt_layer(&config, appender, false));
    }

    let _ = tracing_subscriber::registry()
        .with(layers)
        .with(config.build_filter())
        .try_init();
}
