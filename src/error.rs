//! Custom error types for the telemetry engine.
//!
//! `DaqError` is the single error type returned by fallible operations in this crate. It only
//! covers conditions that must be surfaced to the caller:
//!
//! - **`Configuration`**: an invalid sensor name, path id, firmware name or run setting. These are
//!   raised while modules are being set up and are never retried.
//! - **`ConfigFile`**: wraps errors from `figment` while reading the run configuration.
//! - **`Io`**: wraps `std::io::Error` from the serial adapter and file handling.
//! - **`SerialPortNotConnected`** / **`Transport`**: a write could not be handed to the link.
//! - **`Calibration`**: an operator calibration input that cannot be applied (for example a
//!   reference temperature entered before every sensor has produced a reading).
//!
//! Several protocol conditions are deliberately *not* errors. A line that matches no expected
//! pattern, a transient zero reading, and a conversion that has no defined result are reported as
//! values ([`crate::sensor::DecodeOutcome`], `Option::None` in
//! [`crate::calibration::Conversion`]) so that a noisy stream can never abort polling.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type DaqResult<T> = std::result::Result<T, DaqError>;

/// Errors raised by the protocol engine and its setup.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Invalid setup: unknown firmware, unwired sensor, bad run file.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The run file could not be read or parsed.
    #[error("Configuration file error: {0}")]
    ConfigFile(#[from] figment::Error),

    /// I/O on the serial port.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Send attempted while the link is down.
    #[error("Serial port not connected")]
    SerialPortNotConnected,

    /// The link refused a command.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A calibration step could not be completed.
    #[error("Calibration error: {0}")]
    Calibration(String),
}

impl DaqError {
    /// Whether the operation may succeed if repeated later (for example after a reconnect).
    pub fn can_recover(&self) -> bool {
        matches!(
            self,
            DaqError::SerialPortNotConnected | DaqError::Transport(_) | DaqError::Calibration(_)
        )
    }
}
