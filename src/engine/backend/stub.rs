//! Deterministic stand-ins for audio devices.
//!
//! Used by unit/integration tests and by headless CLI runs. The fixture input
//! replays a fixed sample buffer; the null output discards samples but paces
//! writes in real time so timing loops behave as they would on hardware.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::audio::clock::CancelToken;
use crate::error::AudioError;

use super::{InputProvider, InputRequest, InputSource, OutputProvider, OutputSink};

/// Input provider replaying a fixed buffer of mono samples
#[derive(Clone)]
pub struct FixtureInputProvider {
    samples: Arc<Vec<f32>>,
    sample_rate: u32,
    chunk_size: usize,
    reject_requested_format: bool,
    fail_after: Option<usize>,
    opened: Arc<AtomicUsize>,
}

impl FixtureInputProvider {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples: Arc::new(samples),
            sample_rate,
            chunk_size: 512,
            reject_requested_format: false,
            fail_after: None,
            opened: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Make `open` fail so callers must take the fallback path
    pub fn rejecting_requested_format(mut self) -> Self {
        self.reject_requested_format = true;
        self
    }

    /// Make every opened stream fail once `samples` have been delivered
    pub fn failing_after(mut self, samples: usize) -> Self {
        self.fail_after = Some(samples);
        self
    }

    /// Number of streams successfully opened so far
    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    fn source(&self) -> Box<dyn InputSource> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Box::new(FixtureInput {
            samples: Arc::clone(&self.samples),
            position: 0,
            sample_rate: self.sample_rate,
            chunk_size: self.chunk_size,
            fail_after: self.fail_after,
        })
    }
}

impl InputProvider for FixtureInputProvider {
    fn open(&self, request: &InputRequest) -> Result<Box<dyn InputSource>, AudioError> {
        if self.reject_requested_format {
            return Err(AudioError::StreamOpenFailed {
                reason: format!("fixture rejects {} Hz", request.sample_rate),
            });
        }
        Ok(self.source())
    }

    fn open_fallback(&self) -> Result<Box<dyn InputSource>, AudioError> {
        Ok(self.source())
    }
}

struct FixtureInput {
    samples: Arc<Vec<f32>>,
    position: usize,
    sample_rate: u32,
    chunk_size: usize,
    fail_after: Option<usize>,
}

impl InputSource for FixtureInput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read(&mut self, buf: &mut [f32], timeout: Duration) -> Result<usize, AudioError> {
        let limit = self.fail_after.unwrap_or(usize::MAX).min(self.samples.len());
        if self.fail_after.is_some_and(|n| self.position >= n) {
            return Err(AudioError::StreamFailure {
                reason: "fixture stream dropped".to_string(),
            });
        }
        let remaining = limit - self.position;
        if remaining == 0 {
            // Exhausted fixture behaves like a quiet device with no callbacks
            std::thread::sleep(timeout.min(Duration::from_millis(5)));
            return Ok(0);
        }

        let n = remaining.min(buf.len()).min(self.chunk_size);
        buf[..n].copy_from_slice(&self.samples[self.position..self.position + n]);
        self.position += n;
        Ok(n)
    }
}

/// Input provider whose device can never be acquired
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingInputProvider;

impl InputProvider for FailingInputProvider {
    fn open(&self, _request: &InputRequest) -> Result<Box<dyn InputSource>, AudioError> {
        Err(AudioError::DeviceUnavailable {
            device: "stub input".to_string(),
            reason: "no microphone".to_string(),
        })
    }

    fn open_fallback(&self) -> Result<Box<dyn InputSource>, AudioError> {
        self.open(&InputRequest {
            sample_rate: 0,
            channels: 0,
            buffer_frames: 0,
        })
    }
}

/// Output provider that discards audio at real-time pace
#[derive(Clone, Default)]
pub struct NullOutputProvider {
    written: Arc<AtomicUsize>,
}

impl NullOutputProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total samples written across every sink opened from this provider
    pub fn samples_written(&self) -> usize {
        self.written.load(Ordering::SeqCst)
    }
}

impl OutputProvider for NullOutputProvider {
    fn open(&self, sample_rate: u32) -> Result<Box<dyn OutputSink>, AudioError> {
        Ok(Box::new(NullOutput {
            sample_rate: sample_rate.max(1),
            started: None,
            frames: 0,
            written: Arc::clone(&self.written),
        }))
    }
}

struct NullOutput {
    sample_rate: u32,
    started: Option<Instant>,
    frames: u64,
    written: Arc<AtomicUsize>,
}

impl OutputSink for NullOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn write(&mut self, samples: &[f32], cancel: &CancelToken) -> Result<(), AudioError> {
        let started = *self.started.get_or_insert_with(Instant::now);
        self.frames += samples.len() as u64;
        self.written.fetch_add(samples.len(), Ordering::SeqCst);

        let played_nanos = self.frames * 1_000_000_000 / self.sample_rate as u64;
        cancel.wait_until(started + Duration::from_nanos(played_nanos));
        Ok(())
    }
}
