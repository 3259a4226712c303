//! Logging setup built on `tracing-subscriber`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use crate::error::{TelemetryError, TelemetryResult};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Multi-line, human friendly output.
    Pretty,
    /// Single-line output (default).
    #[default]
    Compact,
    /// Newline-delimited JSON, one object per event.
    Json,
    /// The `tracing-subscriber` default format.
    Full,
}

/// Where log lines are written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogTarget {
    /// Standard output.
    Stdout,
    /// Standard error (default). Plugin processes must use this target.
    #[default]
    Stderr,
    /// Daily-rolling files in `directory`, named `{prefix}.YYYY-MM-DD`.
    File {
        /// Directory holding the log files.
        directory: PathBuf,
        /// File name prefix.
        prefix: String,
    },
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Base level or filter expression, e.g. `info` or `warn,kennel_plugins=debug`.
    pub level: String,
    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
    /// Output target.
    #[serde(default)]
    pub target: LogTarget,
    /// Extra filter directives appended to `level`.
    #[serde(default)]
    pub directives: Vec<String>,
    /// Emit ANSI colour codes (ignored for file targets).
    #[serde(default)]
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::new("info")
    }
}

impl LogConfig {
    /// Create a configuration with the given base level.
    #[must_use]
    pub fn new(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            format: LogFormat::default(),
            target: LogTarget::default(),
            directives: Vec::new(),
            ansi: false,
        }
    }

    /// Set the output format.
    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Set the output target.
    #[must_use]
    pub fn with_target(mut self, target: LogTarget) -> Self {
        self.target = target;
        self
    }

    /// Add a filter directive such as `kennel_plugins::sandbox=trace`.
    #[must_use]
    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    /// Enable or disable ANSI colours.
    #[must_use]
    pub fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi = ansi;
        self
    }

    /// Build the [`EnvFilter`] for this configuration.
    ///
    /// `RUST_LOG`, when set, replaces the configured base level. Extra
    /// directives are always applied on top.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::ConfigError`] if the level or a directive
    /// cannot be parsed.
    pub fn env_filter(&self) -> TelemetryResult<EnvFilter> {
        let mut filter = match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => EnvFilter::try_new(&self.level).map_err(|e| {
                TelemetryError::ConfigError(format!("invalid log level '{}': {e}", self.level))
            })?,
        };

        for raw in &self.directives {
            let directive: Directive = raw.parse().map_err(|e| {
                TelemetryError::ConfigError(format!("invalid log directive '{raw}': {e}"))
            })?;
            filter = filter.add_directive(directive);
        }

        Ok(filter)
    }

    fn make_writer(&self) -> TelemetryResult<BoxMakeWriter> {
        Ok(match &self.target {
            LogTarget::Stdout => BoxMakeWriter::new(std::io::stdout),
            LogTarget::Stderr => BoxMakeWriter::new(std::io::stderr),
            LogTarget::File { directory, prefix } => {
                std::fs::create_dir_all(directory)?;
                BoxMakeWriter::new(tracing_appender::rolling::daily(directory, prefix))
            },
        })
    }
}

/// Install a global subscriber for `config`.
///
/// # Errors
///
/// Returns an error if the filter is invalid, the log directory cannot be
/// created, or a global subscriber is already installed.
pub fn setup_logging(config: &LogConfig) -> TelemetryResult<()> {
    let filter = config.env_filter()?;
    let writer = config.make_writer()?;
    let ansi = config.ansi && !matches!(config.target, LogTarget::File { .. });

    let base = fmt::layer().with_writer(writer).with_ansi(ansi).with_target(true);
    let layer = match config.format {
        LogFormat::Pretty => base.pretty().boxed(),
        LogFormat::Compact => base.compact().boxed(),
        LogFormat::Json => base.json().boxed(),
        LogFormat::Full => base.boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .map_err(|e| TelemetryError::InitError(e.to_string()))
}

/// Install a compact `info`-level subscriber writing to stderr.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn setup_default_logging() -> TelemetryResult<()> {
    setup_logging(&LogConfig::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = LogConfig::new("debug")
            .with_format(LogFormat::Json)
            .with_target(LogTarget::Stdout)
            .with_directive("kennel_plugins=trace")
            .with_ansi(true);

        assert_eq!(config.level, "debug");
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.target, LogTarget::Stdout);
        assert_eq!(config.directives, vec!["kennel_plugins=trace"]);
        assert!(config.ansi);
    }

    #[test]
    fn test_default_config_targets_stderr() {
        let config = LogConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.target, LogTarget::Stderr);
        assert_eq!(config.format, LogFormat::Compact);
    }

    #[test]
    fn test_invalid_directive_rejected() {
        let config = LogConfig::new("info").with_directive("kennel_plugins=notalevel");
        let err = config.env_filter().unwrap_err();
        assert!(matches!(err, TelemetryError::ConfigError(_)));
    }

    #[test]
    fn test_deserialize_file_target() {
        let config: LogConfig = serde_json::from_value(serde_json::json!({
            "level": "warn",
            "format": "json",
            "target": { "file": { "directory": "/var/log/kennel", "prefix": "host" } }
        }))
        .unwrap();

        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(
            config.target,
            LogTarget::File {
                directory: PathBuf::from("/var/log/kennel"),
                prefix: "host".into(),
            }
        );
    }

    #[test]
    fn test_file_target_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("nested").join("logs");
        let config = LogConfig::new("info").with_target(LogTarget::File {
            directory: logs.clone(),
            prefix: "kennel".into(),
        });

        config.make_writer().unwrap();
        assert!(logs.is_dir());
    }

    #[test]
    fn test_second_install_fails() {
        let config = LogConfig::new("warn");
        // The first install may lose a race with another test binary's
        // subscriber; the second must always fail.
        let _ = setup_logging(&config);
        assert!(matches!(
            setup_logging(&config),
            Err(TelemetryError::InitError(_))
        ));
    }
}
