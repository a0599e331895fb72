//! Custom error types for the synthesis controller.
//!
//! This module defines the primary error type, `SynthError`, for the entire crate, and
//! `DriverError`, the failure vocabulary of the hardware collaborator interface.
//!
//! ## Error Hierarchy
//!
//! - **`DeviceUnavailable`**: A channel is already held by an open session or the driver
//!   could not reach it. Fatal to run start, never retried.
//! - **`DeviceFault`**: Communication or overpressure failure during operation. Always forces
//!   the controller onto the safe-shutdown path. Physical actuation is never retried blind.
//! - **`AcquisitionTimeout`**: The spectrometer did not return a frame in time. Treated as a
//!   fault while monitoring, not as a missing sample.
//! - **`InvalidSmoothingConfig`**: Rejected Savitzky-Golay parameters. Raised before any
//!   hardware is touched.
//! - **`InvalidPlan`**, **`Configuration`**, **`Config`**, **`PlanParse`**: input errors.
//! - **`ShutdownFailed`**: One or more venting calls failed during teardown. The run ends
//!   in `Failed` and needs an operator.
//!
//! Step and monitor timeouts are not errors. They are policy outcomes reported as
//! [`crate::controller::RunCause`] values.

use crate::hardware::ChannelId;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, SynthError>;

/// Failures reported by the hardware collaborator (pressure, valve, stirrer, spectrometer).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    /// The device did not answer or could not be opened.
    #[error("device unreachable: {0}")]
    Unreachable(String),

    /// A setpoint above the channel ceiling was refused.
    #[error("overpressure: requested {requested_mbar} mbar exceeds limit of {limit_mbar} mbar")]
    Overpressure {
        /// Refused setpoint.
        requested_mbar: f64,
        /// Channel ceiling.
        limit_mbar: f64,
    },

    /// The device did not acknowledge a command in time.
    #[error("communication timeout")]
    CommTimeout,

    /// Any other vendor-reported failure.
    #[error("driver error: {0}")]
    Other(String),
}

/// Primary error type for the synthesis controller.
#[derive(Error, Debug)]
pub enum SynthError {
    /// A channel is held elsewhere or cannot be opened.
    #[error("Device unavailable on channel '{channel}': {reason}")]
    DeviceUnavailable {
        /// Channel that could not be acquired.
        channel: ChannelId,
        /// Why it could not be acquired.
        reason: String,
    },

    /// A device call failed during operation.
    #[error("Device fault on channel '{channel}': {source}")]
    DeviceFault {
        /// Channel the call was addressed to.
        channel: ChannelId,
        /// Driver-reported cause.
        #[source]
        source: DriverError,
    },

    /// The spectrometer reported an error.
    #[error("Spectrometer fault: {0}")]
    SpectrometerFault(DriverError),

    /// No spectrum arrived within the capture timeout.
    #[error("Spectrometer did not return a frame within {0:?}")]
    AcquisitionTimeout(Duration),

    /// Savitzky-Golay parameters that cannot be used.
    #[error("Invalid smoothing configuration (window {window_length}, polyorder {polyorder}): {reason}")]
    InvalidSmoothingConfig {
        /// Requested window length.
        window_length: usize,
        /// Requested polynomial order.
        polyorder: usize,
        /// Which constraint failed.
        reason: String,
    },

    /// A reaction plan that cannot be executed.
    #[error("Invalid reaction plan: {0}")]
    InvalidPlan(String),

    /// Configuration extraction failed.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration values failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Plan TOML could not be parsed.
    #[error("Failed to parse reaction plan: {0}")]
    PlanParse(#[from] toml::de::Error),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Run record serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A blocking device task panicked or was cancelled.
    #[error("Device command task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Teardown calls that failed, in the order attempted.
    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<SynthError>),
}

impl SynthError {
    /// Returns true for errors raised by hardware during operation.
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            SynthError::DeviceFault { .. }
                | SynthError::SpectrometerFault(_)
                | SynthError::AcquisitionTimeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SynthError::DeviceFault {
            channel: ChannelId::from("p1"),
            source: DriverError::CommTimeout,
        };
        assert_eq!(
            err.to_string(),
            "Device fault on channel 'p1': communication timeout"
        );
        assert!(err.is_fault());
    }

    #[test]
    fn test_shutdown_failed_error() {
        let err = SynthError::ShutdownFailed(vec![
            SynthError::DeviceFault {
                channel: ChannelId::from("p1"),
                source: DriverError::CommTimeout,
            },
            SynthError::DeviceFault {
                channel: ChannelId::from("v1"),
                source: DriverError::Other("stuck".into()),
            },
        ]);
        assert!(err.to_string().contains("Shutdown failed"));
        assert!(!err.is_fault());
    }

    #[test]
    fn test_smoothing_error_is_not_a_fault() {
        let err = SynthError::InvalidSmoothingConfig {
            window_length: 4,
            polyorder: 2,
            reason: "window length must be odd".into(),
        };
        assert!(!err.is_fault());
        assert!(err.to_string().contains("window 4"));
    }
}
