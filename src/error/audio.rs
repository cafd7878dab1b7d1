// Audio error types and constants

use crate::error::ErrorCode;
use log::error;
use std::fmt;

/// Audio error code constants
///
/// Single source of truth for the numeric codes shared with host
/// collaborators.
///
/// Error code range: 1001-1010
pub struct AudioErrorCodes {}

impl AudioErrorCodes {
    /// BPM value is invalid (must be > 0)
    pub const BPM_INVALID: i32 = 1001;

    /// Component is already running
    pub const ALREADY_RUNNING: i32 = 1002;

    /// Component is not running
    pub const NOT_RUNNING: i32 = 1003;

    /// Hardware error occurred
    pub const HARDWARE_ERROR: i32 = 1004;

    /// Microphone or output device could not be acquired
    pub const DEVICE_UNAVAILABLE: i32 = 1005;

    /// Failed to open audio stream
    pub const STREAM_OPEN_FAILED: i32 = 1006;

    /// Mutex/RwLock was poisoned
    pub const LOCK_POISONED: i32 = 1007;

    /// Recording writer failed
    pub const WRITE_FAILURE: i32 = 1008;

    /// Sample format is not supported
    pub const INVALID_SAMPLE_FORMAT: i32 = 1009;

    /// Audio stream disconnected or channel closed unexpectedly
    pub const STREAM_FAILURE: i32 = 1010;
}

/// Log an audio error with structured context
///
/// This function logs audio errors with structured fields including:
/// - error_code: Numeric error code for programmatic handling
/// - component: The component where the error occurred
/// - message: Human-readable error message
///
/// The logging is non-blocking and will not panic on failure.
pub fn log_audio_error(err: &AudioError, context: &str) {
    error!(
        "Audio error in {}: code={}, component=AudioEngine, message={}",
        context,
        err.code(),
        err.message()
    );
}

/// Audio-related errors
///
/// These errors cover capture, metronome and tone playback operations
/// including device acquisition, stream management and recording I/O.
///
/// Error code range: 1001-1010
#[derive(Debug, Clone, PartialEq)]
pub enum AudioError {
    /// BPM value is invalid (must be > 0)
    BpmInvalid { bpm: u32 },

    /// Component is already running
    AlreadyRunning,

    /// Component is not running
    NotRunning,

    /// Hardware error occurred
    HardwareError { details: String },

    /// Microphone/output device cannot be acquired
    DeviceUnavailable { device: String, reason: String },

    /// Failed to open audio stream
    StreamOpenFailed { reason: String },

    /// Mutex/RwLock was poisoned
    LockPoisoned { component: String },

    /// WAV writer I/O error
    WriteFailure { path: String, reason: String },

    /// Device offered a sample format the engine cannot consume
    InvalidSampleFormat { format: String },

    /// Stream channel disconnected unexpectedly
    StreamFailure { reason: String },
}

impl ErrorCode for AudioError {
    fn code(&self) -> i32 {
        match self {
            AudioError::BpmInvalid { .. } => AudioErrorCodes::BPM_INVALID,
            AudioError::AlreadyRunning => AudioErrorCodes::ALREADY_RUNNING,
            AudioError::NotRunning => AudioErrorCodes::NOT_RUNNING,
            AudioError::HardwareError { .. } => AudioErrorCodes::HARDWARE_ERROR,
            AudioError::DeviceUnavailable { .. } => AudioErrorCodes::DEVICE_UNAVAILABLE,
            AudioError::StreamOpenFailed { .. } => AudioErrorCodes::STREAM_OPEN_FAILED,
            AudioError::LockPoisoned { .. } => AudioErrorCodes::LOCK_POISONED,
            AudioError::WriteFailure { .. } => AudioErrorCodes::WRITE_FAILURE,
            AudioError::InvalidSampleFormat { .. } => AudioErrorCodes::INVALID_SAMPLE_FORMAT,
            AudioError::StreamFailure { .. } => AudioErrorCodes::STREAM_FAILURE,
        }
    }

    fn message(&self) -> String {
        match self {
            AudioError::BpmInvalid { bpm } => {
                format!("BPM must be greater than 0 (got {})", bpm)
            }
            AudioError::AlreadyRunning => "Audio component already running".to_string(),
            AudioError::NotRunning => "Audio component not running".to_string(),
            AudioError::HardwareError { details } => {
                format!("Hardware error: {}", details)
            }
            AudioError::DeviceUnavailable { device, reason } => {
                format!("Audio device unavailable ({}): {}", device, reason)
            }
            AudioError::StreamOpenFailed { reason } => {
                format!("Failed to open audio stream: {}", reason)
            }
            AudioError::LockPoisoned { component } => {
                format!("Lock poisoned on {}", component)
            }
            AudioError::WriteFailure { path, reason } => {
                format!("Failed writing recording {}: {}", path, reason)
            }
            AudioError::InvalidSampleFormat { format } => {
                format!("Unsupported sample format: {}", format)
            }
            AudioError::StreamFailure { reason } => {
                format!("Audio stream failed: {}", reason)
            }
        }
    }
}

impl fmt::Display for AudioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AudioError::{:?} (code {}): {}",
            self,
            self.code(),
            self.message()
        )
    }
}

impl std::error::Error for AudioError {}

impl From<std::io::Error> for AudioError {
    fn from(err: std::io::Error) -> Self {
        AudioError::HardwareError {
            details: err.to_string(),
        }
    }
}

impl From<hound::Error> for AudioError {
    fn from(err: hound::Error) -> Self {
        AudioError::WriteFailure {
            path: String::new(),
            reason: err.to_string(),
        }
    }
}
