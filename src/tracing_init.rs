//! Tracing setup for the `tm-daq` binary and tests.
//!
//! Protocol code logs through `tracing` macros at fixed levels:
//! - `trace`: ignored lines, unsolicited frames, gated writes
//! - `debug`: commands sent
//! - `info`: module setup, polling start/stop, pending resets
//! - `warn`: polls skipped while the link is down, failed sends
//!
//! `RUST_LOG` takes precedence over the configured level.
//!
//! # Example
//! ```no_run
//! use tm_daq::tracing_init::{self, OutputFormat, TracingConfig};
//! use tracing::Level;
//!
//! tracing_init::init(TracingConfig::new(Level::DEBUG).with_format(OutputFormat::Compact))?;
//! # Ok::<(), tm_daq::error::DaqError>(())
//! ```

use crate::config::RunConfig;
use crate::error::{DaqError, DaqResult};
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, util::TryInitError, EnvFilter, Layer,
};

/// Crates whose chatter is capped at `warn` unless `RUST_LOG` says otherwise.
const QUIET_TARGETS: &[&str] = &["mio", "tokio_serial", "serialport"];

/// Output format for tracing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line, colored (for development)
    Pretty,
    /// Single line, no colors (for the lab terminal and log files)
    Compact,
    /// One JSON object per event
    Json,
}

impl FromStr for OutputFormat {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(OutputFormat::Pretty),
            "compact" => Ok(OutputFormat::Compact),
            "json" => Ok(OutputFormat::Json),
            other => Err(DaqError::Configuration(format!(
                "Invalid log format '{}'. Must be one of: pretty, compact, json",
                other
            ))),
        }
    }
}

/// Subscriber settings for a polling run.
#[derive(Debug, Clone, PartialEq)]
pub struct TracingConfig {
    /// Most verbose level emitted by this crate.
    pub level: Level,
    /// Line format.
    pub format: OutputFormat,
    /// Source file and line on every event. On by default at `debug` and `trace`.
    pub with_file_and_line: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::new(Level::INFO)
    }
}

impl TracingConfig {
    /// Compact output at `level`.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            format: OutputFormat::Compact,
            with_file_and_line: level >= Level::DEBUG,
        }
    }

    /// Tracing config from the run configuration's `log_level`
    pub fn from_run_config(config: &RunConfig) -> DaqResult<Self> {
        Ok(Self::new(parse_log_level(&config.log_level)?))
    }

    /// Replace the output format.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Filter directives used when `RUST_LOG` is unset.
    pub fn filter_directives(&self) -> String {
        let level = self.level.to_string().to_ascii_lowercase();
        let mut directives = vec![level.clone()];
        for target in QUIET_TARGETS {
            let capped = if self.level > Level::WARN { "warn" } else { level.as_str() };
            directives.push(format!("{}={}", target, capped));
        }
        directives.join(",")
    }
}

/// Install the global subscriber.
///
/// Idempotent: if a subscriber is already installed this returns `Ok(())`, which keeps it safe to
/// call from tests.
pub fn init(config: TracingConfig) -> DaqResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));
    let located = config.with_file_and_line;

    let result = match config.format {
        OutputFormat::Pretty => {
            let layer = fmt::layer()
                .pretty()
                .with_file(located)
                .with_line_number(located)
                .with_filter(filter);
            tracing_subscriber::registry().with(layer).try_init()
        }
        OutputFormat::Compact => {
            let layer = fmt::layer()
                .compact()
                .with_ansi(false)
                .with_file(located)
                .with_line_number(located)
                .with_filter(filter);
            tracing_subscriber::registry().with(layer).try_init()
        }
        OutputFormat::Json => {
            let layer = fmt::layer()
                .json()
                .with_file(located)
                .with_line_number(located)
                .with_filter(filter);
            tracing_subscriber::registry().with(layer).try_init()
        }
    };

    ignore_already_initialized(result)
}

fn ignore_already_initialized(result: Result<(), TryInitError>) -> DaqResult<()> {
    result.or_else(|e| {
        // Several tests initialize tracing in one process
        if e.to_string().contains("already been set") {
            Ok(())
        } else {
            Err(DaqError::Configuration(format!(
                "Failed to initialize tracing: {}",
                e
            )))
        }
    })
}

/// Parse a run-file `log_level` (case-insensitive level name).
pub fn parse_log_level(level: &str) -> DaqResult<Level> {
    let invalid = || {
        DaqError::Configuration(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        ))
    };
    if level.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    Level::from_str(level.trim()).map_err(|_| invalid())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert!(matches!(parse_log_level("trace"), Ok(Level::TRACE)));
        assert!(matches!(parse_log_level("warn"), Ok(Level::WARN)));
        // Case insensitive
        assert!(matches!(parse_log_level("Debug"), Ok(Level::DEBUG)));
        assert!(parse_log_level("loud").is_err());
        assert!(parse_log_level("3").is_err());
    }

    #[test]
    fn test_output_format_parsing() {
        assert_eq!("JSON".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert_eq!("compact".parse::<OutputFormat>().unwrap(), OutputFormat::Compact);
        assert!("xml".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_config_from_run_config() {
        let run = RunConfig::from_toml_str(
            r#"
log_level = "warn"
[serial]
port = "/dev/null"
[firmware]
version = "Thermal Mockup V3"
"#,
        )
        .unwrap();
        let config = TracingConfig::from_run_config(&run).unwrap();
        assert_eq!(config.level, Level::WARN);
        assert!(!config.with_file_and_line);
        assert!(TracingConfig::new(Level::TRACE).with_file_and_line);
    }

    #[test]
    fn test_serial_stack_is_capped_at_warn() {
        assert_eq!(
            TracingConfig::new(Level::DEBUG).filter_directives(),
            "debug,mio=warn,tokio_serial=warn,serialport=warn"
        );
        assert_eq!(
            TracingConfig::new(Level::ERROR).filter_directives(),
            "error,mio=error,tokio_serial=error,serialport=error"
        );
    }

    #[test]
    fn test_init_is_idempotent() {
        assert!(init(TracingConfig::default()).is_ok());
        assert!(init(TracingConfig::new(Level::DEBUG).with_format(OutputFormat::Json)).is_ok());
    }
}
