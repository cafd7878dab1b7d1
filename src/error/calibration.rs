// Calibration error types and constants

use crate::error::ErrorCode;
use log::error;
use std::fmt;

/// Calibration error code constants
///
/// Error code range: 2001-2008
pub struct CalibrationErrorCodes {}

impl CalibrationErrorCodes {
    /// Fewer valid tap/click matches than required
    pub const INSUFFICIENT_SAMPLES: i32 = 2001;

    /// A calibration run is already active
    pub const ALREADY_IN_PROGRESS: i32 = 2002;

    /// Tap arrived while no calibration was listening
    pub const NOT_LISTENING: i32 = 2003;

    /// Calibration was cancelled before completion
    pub const CANCELLED: i32 = 2004;

    /// Calibration state lock was poisoned
    pub const STATE_POISONED: i32 = 2005;

    /// Calibration timed out waiting for the worker
    pub const TIMEOUT: i32 = 2006;

    /// Output device for calibration clicks could not be opened
    pub const OUTPUT_UNAVAILABLE: i32 = 2007;

    /// A practice session is recording
    pub const SESSION_ACTIVE: i32 = 2008;
}

/// Log a calibration error with structured context
///
/// The logging is non-blocking and will not panic on failure.
pub fn log_calibration_error(err: &CalibrationError, context: &str) {
    error!(
        "Calibration error in {}: code={}, component=LatencyCalibrator, message={}",
        context,
        err.code(),
        err.message()
    );
}

/// Calibration-related errors
///
/// Error code range: 2001-2008
#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationError {
    /// Not enough valid tap/click matches to estimate latency
    InsufficientSamples { required: usize, collected: usize },

    /// Calibration already in progress
    AlreadyInProgress,

    /// No calibration is currently listening for taps
    NotListening,

    /// Calibration was cancelled; partial samples were discarded
    Cancelled,

    /// Calibration state lock was poisoned
    StatePoisoned,

    /// Calibration worker did not finish in time
    Timeout { reason: String },

    /// Clicks cannot be played
    OutputUnavailable { reason: String },

    /// Refused while a practice session is recording
    SessionActive,
}

impl ErrorCode for CalibrationError {
    fn code(&self) -> i32 {
        match self {
            CalibrationError::InsufficientSamples { .. } => {
                CalibrationErrorCodes::INSUFFICIENT_SAMPLES
            }
            CalibrationError::AlreadyInProgress => CalibrationErrorCodes::ALREADY_IN_PROGRESS,
            CalibrationError::NotListening => CalibrationErrorCodes::NOT_LISTENING,
            CalibrationError::Cancelled => CalibrationErrorCodes::CANCELLED,
            CalibrationError::StatePoisoned => CalibrationErrorCodes::STATE_POISONED,
            CalibrationError::Timeout { .. } => CalibrationErrorCodes::TIMEOUT,
            CalibrationError::OutputUnavailable { .. } => {
                CalibrationErrorCodes::OUTPUT_UNAVAILABLE
            }
            CalibrationError::SessionActive => CalibrationErrorCodes::SESSION_ACTIVE,
        }
    }

    fn message(&self) -> String {
        match self {
            CalibrationError::InsufficientSamples {
                required,
                collected,
            } => {
                format!(
                    "Not enough data: need {} matched taps, got {}",
                    required, collected
                )
            }
            CalibrationError::AlreadyInProgress => "Calibration already in progress".to_string(),
            CalibrationError::NotListening => "Calibration is not listening for taps".to_string(),
            CalibrationError::Cancelled => "Calibration cancelled".to_string(),
            CalibrationError::StatePoisoned => "Calibration state lock poisoned".to_string(),
            CalibrationError::Timeout { reason } => {
                format!("Calibration timed out: {}", reason)
            }
            CalibrationError::OutputUnavailable { reason } => {
                format!("Cannot play calibration clicks: {}", reason)
            }
            CalibrationError::SessionActive => {
                "Stop the practice session before calibrating".to_string()
            }
        }
    }
}

impl fmt::Display for CalibrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CalibrationError::{:?} (code {}): {}",
            self,
            self.code(),
            self.message()
        )
    }
}

impl std::error::Error for CalibrationError {}
