//! Backend abstractions over audio devices.
//!
//! Capture, metronome, tone playback and calibration never talk to `cpal`
//! directly. They ask a provider for a device handle on the thread that will
//! use it, which keeps non-`Send` device streams thread-confined and lets
//! tests swap in fixture-driven stubs.

use std::time::{Duration, Instant};

use crate::audio::clock::{epoch_ms, CancelToken};
use crate::error::AudioError;

/// Requested microphone format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputRequest {
    pub sample_rate: u32,
    pub channels: u16,
    /// Preferred device buffer in frames; raised to the device minimum
    pub buffer_frames: u32,
}

/// An open microphone stream, owned by the thread that reads it.
pub trait InputSource {
    /// Actual sample rate of the delivered (mono) samples
    fn sample_rate(&self) -> u32;

    /// Read up to `buf.len()` mono samples, waiting at most `timeout`.
    ///
    /// Returns `Ok(0)` when nothing arrived in time and
    /// `Err(AudioError::StreamFailure)` once the stream is gone.
    fn read(&mut self, buf: &mut [f32], timeout: Duration) -> Result<usize, AudioError>;
}

/// Factory for microphone streams.
pub trait InputProvider: Send + Sync {
    /// Open the device with exactly the requested format
    fn open(&self, request: &InputRequest) -> Result<Box<dyn InputSource>, AudioError>;

    /// Open the device with whatever its default configuration is
    fn open_fallback(&self) -> Result<Box<dyn InputSource>, AudioError>;
}

/// An open output stream, owned by the thread that writes it.
pub trait OutputSink {
    fn sample_rate(&self) -> u32;

    /// Queue `samples` for playback, blocking while the device buffer is
    /// full. Returns early (still `Ok`) once `cancel` fires.
    fn write(&mut self, samples: &[f32], cancel: &CancelToken) -> Result<(), AudioError>;
}

/// Factory for output streams.
pub trait OutputProvider: Send + Sync {
    fn open(&self, sample_rate: u32) -> Result<Box<dyn OutputSink>, AudioError>;
}

/// Trait representing the clocks used for timing and timestamps.
pub trait TimeSource: Send + Sync {
    /// Monotonic time for scheduling
    fn now(&self) -> Instant;

    /// Wall-clock milliseconds used to stamp events
    fn epoch_ms(&self) -> i64;
}

/// Default time source backed by `Instant::now` and the system clock.
#[derive(Default)]
pub struct SystemTimeSource {
    _unit: (),
}

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn epoch_ms(&self) -> i64 {
        epoch_ms()
    }
}

mod cpal;
pub use self::cpal::CpalBackend;

pub mod stub;
pub use stub::{FailingInputProvider, FixtureInputProvider, NullOutputProvider};
