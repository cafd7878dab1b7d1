// Error types for the practice core
//
// This module defines custom error types for audio device and calibration
// operations, providing structured error handling with numeric codes so
// host collaborators can map failures to "no data" states.

mod audio;
mod calibration;

pub use audio::{log_audio_error, AudioError, AudioErrorCodes};
pub use calibration::{log_calibration_error, CalibrationError, CalibrationErrorCodes};

/// Error codes for structured error reporting
///
/// This trait provides a standard way to get error codes and messages
/// from custom error types, enabling consistent error handling across
/// the boundary to the host application.
pub trait ErrorCode {
    /// Get the numeric error code
    fn code(&self) -> i32;

    /// Get the human-readable error message
    fn message(&self) -> String;
}
