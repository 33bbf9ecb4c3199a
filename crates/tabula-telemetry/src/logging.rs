//! Subscriber setup for the plugin host.
//!
//! The host always logs to the console. A rolling file can be added beside
//! it; file output goes through a non-blocking writer so plugin lifecycle
//! work never waits on disk, and is flushed when the returned
//! [`LoggingGuard`] drops.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::error::{TelemetryError, TelemetryResult};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// How events are rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One line per event.
    #[default]
    Compact,
    /// Multi-line, for reading at a terminal.
    Pretty,
    /// One JSON object per event.
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Compact => "compact",
            Self::Pretty => "pretty",
            Self::Json => "json",
        })
    }
}

impl FromStr for LogFormat {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(TelemetryError::InvalidConfig(format!(
                "unknown log format '{other}' (expected compact, pretty or json)"
            ))),
        }
    }
}

/// Console stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogTarget {
    /// Standard error.
    #[default]
    Stderr,
    /// Standard output.
    Stdout,
}

/// When the log file rolls over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileRotation {
    /// Once a day.
    #[default]
    Daily,
    /// Once an hour.
    Hourly,
    /// Never.
    Never,
}

impl From<FileRotation> for Rotation {
    fn from(rotation: FileRotation) -> Self {
        match rotation {
            FileRotation::Daily => Self::DAILY,
            FileRotation::Hourly => Self::HOURLY,
            FileRotation::Never => Self::NEVER,
        }
    }
}

/// A rolling log file next to the console output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLogConfig {
    /// Directory holding the files. Created if missing.
    pub directory: PathBuf,
    /// File name prefix; `tabula` gives `tabula.2026-10-18.log`.
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Rotation.
    #[serde(default)]
    pub rotation: FileRotation,
    /// Rotated files to keep. Zero keeps all of them.
    #[serde(default)]
    pub max_files: usize,
}

fn default_prefix() -> String {
    "tabula".to_owned()
}

impl FileLogConfig {
    /// Daily files named `tabula.*.log` in `directory`.
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            prefix: default_prefix(),
            rotation: FileRotation::default(),
            max_files: 0,
        }
    }

    fn appender(&self) -> TelemetryResult<RollingFileAppender> {
        std::fs::create_dir_all(&self.directory)?;
        let mut builder = RollingFileAppender::builder()
            .rotation(self.rotation.into())
            .filename_prefix(&self.prefix)
            .filename_suffix("log");
        if self.max_files > 0 {
            builder = builder.max_log_files(self.max_files);
        }
        builder.build(&self.directory).map_err(|e| {
            TelemetryError::Init(format!(
                "cannot open log file in {}: {e}",
                self.directory.display()
            ))
        })
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Base filter, e.g. `info` or `warn,tabula_plugins=debug`.
    #[serde(default = "default_level")]
    pub level: String,
    /// Extra filter directives added on top of `level`.
    #[serde(default)]
    pub directives: Vec<String>,
    /// Rendering.
    #[serde(default)]
    pub format: LogFormat,
    /// Console stream.
    #[serde(default)]
    pub target: LogTarget,
    /// Optional rolling file, always rendered without colors.
    #[serde(default)]
    pub file: Option<FileLogConfig>,
    /// Log span open and close, which times each lifecycle operation.
    #[serde(default)]
    pub span_events: bool,
    /// Colors on the console.
    #[serde(default = "default_ansi")]
    pub ansi: bool,
}

fn default_level() -> String {
    "info".to_owned()
}

fn default_ansi() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            directives: Vec::new(),
            format: LogFormat::default(),
            target: LogTarget::default(),
            file: None,
            span_events: false,
            ansi: default_ansi(),
        }
    }
}

impl LogConfig {
    /// Defaults with the given base filter.
    #[must_use]
    pub fn new(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            ..Self::default()
        }
    }

    /// Set the format.
    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Set the console stream.
    #[must_use]
    pub fn with_target(mut self, target: LogTarget) -> Self {
        self.target = target;
        self
    }

    /// Add a filter directive such as `tabula_sandbox=trace`.
    #[must_use]
    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    /// Also write to a rolling file.
    #[must_use]
    pub fn with_file(mut self, file: FileLogConfig) -> Self {
        self.file = Some(file);
        self
    }

    /// Log span open and close.
    #[must_use]
    pub fn with_span_events(mut self) -> Self {
        self.span_events = true;
        self
    }

    /// Disable console colors.
    #[must_use]
    pub fn without_ansi(mut self) -> Self {
        self.ansi = false;
        self
    }

    fn filter(&self) -> TelemetryResult<EnvFilter> {
        let mut filter = EnvFilter::try_new(&self.level).map_err(|e| {
            TelemetryError::InvalidConfig(format!("bad level '{}': {e}", self.level))
        })?;
        for directive in &self.directives {
            let parsed: Directive = directive.parse().map_err(|e| {
                TelemetryError::InvalidConfig(format!("bad directive '{directive}': {e}"))
            })?;
            filter = filter.add_directive(parsed);
        }
        Ok(filter)
    }

    fn layer<W>(&self, writer: W, ansi: bool) -> BoxedLayer
    where
        W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
    {
        let spans = if self.span_events {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(ansi && self.format != LogFormat::Json)
            .with_span_events(spans);
        match self.format {
            LogFormat::Compact => layer.compact().boxed(),
            LogFormat::Pretty => layer.pretty().boxed(),
            LogFormat::Json => layer.json().boxed(),
        }
    }
}

#[cfg(feature = "config")]
impl LogConfig {
    /// Settings from the `[logging]` section of the host configuration.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidConfig`] for an unknown format.
    pub fn from_section(section: &tabula_config::LoggingSection) -> TelemetryResult<Self> {
        Ok(Self {
            level: section.level.clone(),
            directives: section.directives.clone(),
            format: section.format.parse()?,
            ..Self::default()
        })
    }
}

/// Keeps the file writer alive. Buffered lines are flushed when it drops,
/// so hold it until the host exits.
#[must_use = "dropping the guard stops file logging"]
#[derive(Debug, Default)]
pub struct LoggingGuard {
    file: Option<WorkerGuard>,
}

impl LoggingGuard {
    /// Whether a file writer is running.
    #[must_use]
    pub fn has_file(&self) -> bool {
        self.file.is_some()
    }
}

/// Install the global subscriber.
///
/// # Errors
///
/// Fails on a bad level or directive, when the log directory cannot be
/// created, or when a global subscriber is already installed.
pub fn setup_logging(config: &LogConfig) -> TelemetryResult<LoggingGuard> {
    let console = match config.target {
        LogTarget::Stderr => config.layer(std::io::stderr, config.ansi),
        LogTarget::Stdout => config.layer(std::io::stdout, config.ansi),
    };
    let mut layers = vec![console];
    let mut guard = LoggingGuard::default();
    if let Some(file) = &config.file {
        let (writer, worker) = tracing_appender::non_blocking(file.appender()?);
        layers.push(config.layer(writer, false));
        guard.file = Some(worker);
    }

    tracing_subscriber::registry()
        .with(layers.with_filter(config.filter()?))
        .try_init()
        .map_err(|e| TelemetryError::Init(e.to_string()))?;
    Ok(guard)
}

/// Install compact `info` logging on stderr.
///
/// # Errors
///
/// Fails when a global subscriber is already installed.
pub fn setup_default_logging() -> TelemetryResult<LoggingGuard> {
    setup_logging(&LogConfig::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LogConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, LogFormat::Compact);
        assert_eq!(config.target, LogTarget::Stderr);
        assert!(config.file.is_none());
        assert!(config.ansi);
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!(" JSON ".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        let err = "xml".parse::<LogFormat>().unwrap_err();
        assert!(err.to_string().contains("unknown log format 'xml'"));
    }

    #[test]
    fn test_filter_accepts_directives() {
        let config = LogConfig::new("warn")
            .with_directive("tabula_plugins=debug")
            .with_directive("tabula_sandbox=trace");
        assert!(config.filter().is_ok());
    }

    #[test]
    fn test_filter_rejects_bad_directive() {
        let config = LogConfig::new("info").with_directive("[broken=");
        assert!(matches!(config.filter(), Err(TelemetryError::InvalidConfig(_))));
    }

    #[test]
    fn test_deserialize_partial() {
        let config: LogConfig = serde_json::from_str(
            r#"{"format": "json", "file": {"directory": "/var/log/tabula", "rotation": "hourly"}}"#,
        )
        .unwrap();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, LogFormat::Json);
        let file = config.file.unwrap();
        assert_eq!(file.prefix, "tabula");
        assert_eq!(file.rotation, FileRotation::Hourly);
    }

    #[test]
    fn test_file_appender_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = FileLogConfig::new(dir.path().join("logs").join("host"));
        assert!(file.appender().is_ok());
        assert!(file.directory.is_dir());
    }

    #[cfg(feature = "config")]
    #[test]
    fn test_from_section() {
        let section = tabula_config::LoggingSection {
            level: "debug".to_owned(),
            format: "json".to_owned(),
            directives: vec!["tabula_plugins=trace".to_owned()],
        };
        let config = LogConfig::from_section(&section).unwrap();
        assert_eq!(config.level, "debug");
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.directives, section.directives);
    }
}
