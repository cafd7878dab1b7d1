//! CaptureEngine - live pitch and level tracking from the microphone
//!
//! A dedicated thread reads the input device, slides a 4096-sample window
//! forward by 2048 samples per frame, and publishes:
//! - a [`TunerResult`] (last value wins, via `tokio::sync::watch`)
//! - an amplitude gauge in [0, 100], updated every frame
//!
//! When given a recording target the same thread streams the newly read
//! samples of each frame into a WAV file, finalized on stop.

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::clock::{join_with_timeout, CancelToken};
use super::tone_player::PlaybackQuery;
use super::wav::RecordingWriter;
use crate::analysis::{map_frequency, PitchEstimator, RollingMedian, DEFAULT_REFERENCE_HZ};
use crate::config::CaptureConfig;
use crate::engine::backend::{InputProvider, InputRequest, InputSource};
use crate::error::{log_audio_error, AudioError};

const DEVICE_READY_TIMEOUT: Duration = Duration::from_secs(3);
const READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Tuner readout published once per frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunerResult {
    pub note: String,
    pub octave: Option<i32>,
    pub frequency_hz: f32,
    pub cents: i32,
    pub is_locked: bool,
}

impl Default for TunerResult {
    /// Silence / uncertain
    fn default() -> Self {
        Self {
            note: "--".to_string(),
            octave: None,
            frequency_hz: 0.0,
            cents: 0,
            is_locked: false,
        }
    }
}

/// Root mean square of a block of samples
pub fn compute_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

/// Map RMS onto a 0-100 gauge spanning -60 dBFS to 0 dBFS
pub fn amplitude_level(rms: f32) -> f32 {
    let db = 20.0 * rms.max(0.0).log10();
    ((db + 60.0) / 60.0 * 100.0).clamp(0.0, 100.0)
}

/// What one frame produced
#[derive(Debug, Clone, PartialEq)]
pub struct FrameOutput {
    /// `None` while a reference tone plays: pitch is not published
    pub tuner: Option<TunerResult>,
    pub amplitude: f32,
}

/// Per-frame pitch/level logic, independent of threads and devices
pub struct FramePipeline {
    estimator: PitchEstimator,
    frequency_window: RollingMedian<f32>,
    cents_window: RollingMedian<i32>,
    input_threshold: f32,
    confidence_threshold: f32,
    min_frequency_hz: f32,
    reference_hz: f32,
}

impl FramePipeline {
    pub fn new(
        sample_rate: u32,
        config: &CaptureConfig,
        input_threshold: f32,
        reference_hz: f32,
    ) -> Self {
        Self {
            estimator: PitchEstimator::new(sample_rate, config.frame_size, config.yin_threshold),
            frequency_window: RollingMedian::new(config.smoothing_window),
            cents_window: RollingMedian::new(config.smoothing_window),
            input_threshold,
            confidence_threshold: config.confidence_threshold,
            min_frequency_hz: config.min_frequency_hz,
            reference_hz,
        }
    }

    pub fn process(&mut self, frame: &[f32], tone_playing: bool) -> FrameOutput {
        let rms = compute_rms(frame);
        let amplitude = amplitude_level(rms);

        if tone_playing {
            return FrameOutput {
                tuner: None,
                amplitude,
            };
        }

        if rms < self.input_threshold {
            self.frequency_window.clear();
            self.cents_window.clear();
            return FrameOutput {
                tuner: Some(TunerResult::default()),
                amplitude,
            };
        }

        let estimate = self.estimator.estimate(frame);
        let trusted = rms > self.input_threshold
            && estimate.probability > self.confidence_threshold
            && estimate.frequency_hz > self.min_frequency_hz;

        if !trusted {
            return FrameOutput {
                tuner: Some(TunerResult::default()),
                amplitude,
            };
        }

        let frequency = self.frequency_window.push(estimate.frequency_hz);
        let tuner = match map_frequency(frequency, self.reference_hz) {
            Some(reading) => {
                let cents = self.cents_window.push(reading.cents);
                TunerResult {
                    note: reading.note.to_string(),
                    octave: Some(reading.octave),
                    frequency_hz: frequency,
                    cents,
                    is_locked: true,
                }
            }
            None => TunerResult::default(),
        };

        FrameOutput {
            tuner: Some(tuner),
            amplitude,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CaptureSettings {
    input_threshold: f32,
    reference_hz: f32,
}

struct CaptureRun {
    cancel: CancelToken,
    handle: JoinHandle<()>,
    recording: Option<PathBuf>,
}

/// Microphone owner and live tuner
pub struct CaptureEngine {
    input: Arc<dyn InputProvider>,
    config: CaptureConfig,
    settings: Mutex<CaptureSettings>,
    playback: Option<Arc<dyn PlaybackQuery>>,
    tuner_tx: watch::Sender<TunerResult>,
    amplitude_tx: watch::Sender<f32>,
    run: Mutex<Option<CaptureRun>>,
}

impl CaptureEngine {
    pub fn new(input: Arc<dyn InputProvider>, config: CaptureConfig) -> Self {
        let (tuner_tx, _) = watch::channel(TunerResult::default());
        let (amplitude_tx, _) = watch::channel(0.0);
        Self {
            input,
            config,
            settings: Mutex::new(CaptureSettings {
                input_threshold: 0.01,
                reference_hz: DEFAULT_REFERENCE_HZ,
            }),
            playback: None,
            tuner_tx,
            amplitude_tx,
            run: Mutex::new(None),
        }
    }

    /// Suppress pitch output whenever `query` reports a tone playing
    pub fn with_playback_query(mut self, query: Arc<dyn PlaybackQuery>) -> Self {
        self.playback = Some(query);
        self
    }

    /// RMS gate; applies from the next `start()`
    pub fn set_input_threshold(&self, threshold: f32) {
        if let Ok(mut settings) = self.settings.lock() {
            settings.input_threshold = threshold.max(0.0);
        }
    }

    /// A4 reference; applies from the next `start()`
    pub fn set_reference_frequency(&self, reference_hz: f32) {
        if let Ok(mut settings) = self.settings.lock() {
            settings.reference_hz = reference_hz;
        }
    }

    pub fn subscribe_tuner(&self) -> watch::Receiver<TunerResult> {
        self.tuner_tx.subscribe()
    }

    pub fn subscribe_amplitude(&self) -> watch::Receiver<f32> {
        self.amplitude_tx.subscribe()
    }

    pub fn tuner(&self) -> TunerResult {
        self.tuner_tx.borrow().clone()
    }

    pub fn amplitude(&self) -> f32 {
        *self.amplitude_tx.borrow()
    }

    /// False once the capture thread has exited, even without `stop()`
    pub fn is_running(&self) -> bool {
        self.run
            .lock()
            .map(|mut run| {
                Self::reap_finished(&mut run);
                run.is_some()
            })
            .unwrap_or(false)
    }

    /// Path of the take being recorded, if any
    pub fn recording_path(&self) -> Option<PathBuf> {
        self.run
            .lock()
            .ok()
            .and_then(|run| run.as_ref().and_then(|r| r.recording.clone()))
    }

    /// Acquire the microphone and start tracking
    ///
    /// While running, a new recording target restarts the session; `None` is
    /// a no-op. On device failure the engine stays stopped.
    pub fn start(&self, output_file: Option<PathBuf>) -> Result<(), AudioError> {
        // Held until the new run is installed so concurrent starts serialize
        let mut run = self.run.lock().map_err(|_| AudioError::LockPoisoned {
            component: "capture run state".to_string(),
        })?;
        Self::reap_finished(&mut run);

        if run.is_some() {
            if output_file.is_none() {
                tracing::debug!("[CaptureEngine] Already running; start() ignored");
                return Ok(());
            }
            tracing::info!("[CaptureEngine] Restarting for new recording target");
            if let Some(previous) = run.take() {
                self.shutdown_run(previous);
            }
        }

        let settings = *self.settings.lock().map_err(|_| AudioError::LockPoisoned {
            component: "capture settings".to_string(),
        })?;

        let cancel = CancelToken::new();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<u32, AudioError>>();
        let worker = CaptureWorker {
            input: Arc::clone(&self.input),
            config: self.config.clone(),
            settings,
            playback: self.playback.clone(),
            tuner_tx: self.tuner_tx.clone(),
            amplitude_tx: self.amplitude_tx.clone(),
            cancel: cancel.clone(),
            recording: output_file.clone(),
        };

        let handle = thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || worker.run(ready_tx))
            .map_err(|e| AudioError::HardwareError {
                details: format!("Failed to spawn capture thread: {}", e),
            })?;

        let ready = ready_rx.recv_timeout(DEVICE_READY_TIMEOUT).unwrap_or_else(|_| {
            Err(AudioError::DeviceUnavailable {
                device: "microphone".to_string(),
                reason: "device did not become ready".to_string(),
            })
        });

        match ready {
            Ok(sample_rate) => {
                tracing::info!(
                    "[CaptureEngine] Started at {} Hz (recording: {:?})",
                    sample_rate,
                    output_file
                );
                *run = Some(CaptureRun {
                    cancel,
                    handle,
                    recording: output_file,
                });
                Ok(())
            }
            Err(err) => {
                log_audio_error(&err, "CaptureEngine::start");
                cancel.cancel();
                join_with_timeout(handle, self.join_timeout(), "CaptureEngine");
                Err(err)
            }
        }
    }

    /// Stop tracking, finalize any recording and release the microphone
    ///
    /// Idempotent. Resets the tuner and amplitude to their silent values.
    pub fn stop(&self) {
        let previous = match self.run.lock() {
            Ok(mut run) => run.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        if let Some(run) = previous {
            self.shutdown_run(run);
        }

        self.tuner_tx.send_replace(TunerResult::default());
        self.amplitude_tx.send_replace(0.0);
    }

    fn shutdown_run(&self, run: CaptureRun) {
        run.cancel.cancel();
        join_with_timeout(run.handle, self.join_timeout(), "CaptureEngine");
        tracing::info!("[CaptureEngine] Stopped");
    }

    /// Drop a run whose thread already exited on its own
    fn reap_finished(run: &mut Option<CaptureRun>) {
        if !run.as_ref().is_some_and(|r| r.handle.is_finished()) {
            return;
        }
        if let Some(dead) = run.take() {
            if dead.handle.join().is_err() {
                tracing::error!("[CaptureEngine] Capture thread panicked");
            }
            tracing::warn!("[CaptureEngine] Capture thread exited; engine stopped");
        }
    }

    fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.config.join_timeout_ms)
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Everything the capture thread owns
struct CaptureWorker {
    input: Arc<dyn InputProvider>,
    config: CaptureConfig,
    settings: CaptureSettings,
    playback: Option<Arc<dyn PlaybackQuery>>,
    tuner_tx: watch::Sender<TunerResult>,
    amplitude_tx: watch::Sender<f32>,
    cancel: CancelToken,
    recording: Option<PathBuf>,
}

impl CaptureWorker {
    fn open_source(&self) -> Result<Box<dyn InputSource>, AudioError> {
        let request = InputRequest {
            sample_rate: self.config.sample_rate,
            channels: 1,
            buffer_frames: (2 * self.config.frame_size) as u32,
        };

        match self.input.open(&request) {
            Ok(source) => Ok(source),
            Err(err) => {
                tracing::warn!(
                    "[CaptureEngine] {} Hz mono unavailable ({}); retrying with device defaults",
                    request.sample_rate,
                    err
                );
                self.input.open_fallback()
            }
        }
    }

    fn open_writer(path: &Path, sample_rate: u32) -> Option<RecordingWriter> {
        match RecordingWriter::create(path, sample_rate) {
            Ok(writer) => Some(writer),
            Err(err) => {
                // Live tracking continues without a recording
                log_audio_error(&err, "CaptureEngine recording");
                None
            }
        }
    }

    fn run(self, ready_tx: mpsc::Sender<Result<u32, AudioError>>) {
        let mut source = match self.open_source() {
            Ok(source) => source,
            Err(err) => {
                let _ = ready_tx.send(Err(err));
                return;
            }
        };

        let sample_rate = source.sample_rate();
        let mut writer = self
            .recording
            .as_deref()
            .and_then(|path| Self::open_writer(path, sample_rate));

        if ready_tx.send(Ok(sample_rate)).is_err() {
            return;
        }

        let frame_size = self.config.frame_size.max(2);
        let hop = self.config.hop_size.clamp(1, frame_size);
        let mut pipeline = FramePipeline::new(
            sample_rate,
            &self.config,
            self.settings.input_threshold,
            self.settings.reference_hz,
        );

        let mut window = vec![0.0f32; frame_size];
        let mut pending: Vec<f32> = Vec::with_capacity(frame_size * 2);
        let mut read_buf = vec![0.0f32; hop];
        let mut first_frame = true;

        while !self.cancel.is_cancelled() {
            match source.read(&mut read_buf, READ_TIMEOUT) {
                Ok(n) => pending.extend_from_slice(&read_buf[..n]),
                Err(err) => {
                    log_audio_error(&err, "CaptureEngine read");
                    break;
                }
            }

            let mut needed = if first_frame { frame_size } else { hop };
            while pending.len() >= needed {
                let fresh = &pending[..needed];
                if first_frame {
                    window.copy_from_slice(fresh);
                } else {
                    window.copy_within(hop.., 0);
                    window[frame_size - hop..].copy_from_slice(fresh);
                }

                if let Some(w) = writer.as_mut() {
                    if let Err(err) = w.write(fresh) {
                        log_audio_error(&err, "CaptureEngine recording");
                    }
                }
                pending.drain(..needed);

                let playing = self.playback.as_ref().is_some_and(|p| p.is_playing());
                let output = pipeline.process(&window, playing);
                self.amplitude_tx.send_replace(output.amplitude);
                if let Some(tuner) = output.tuner {
                    self.tuner_tx.send_replace(tuner);
                }

                first_frame = false;
                needed = hop;
            }
        }

        if let Some(writer) = writer {
            match writer.finalize() {
                Ok(samples) => tracing::info!(
                    "[CaptureEngine] Recording finalized: {} samples",
                    samples
                ),
                Err(err) => log_audio_error(&err, "CaptureEngine finalize"),
            }
        }

        // A dead stream must not leave the last lock on display
        self.tuner_tx.send_replace(TunerResult::default());
        self.amplitude_tx.send_replace(0.0);
        // `source` drops here, releasing the device on this thread
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::backend::{FailingInputProvider, FixtureInputProvider};
    use crate::audio::tone_player::PlaybackState;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::time::Instant;

    fn sine(frequency: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| 0.5 * (2.0 * std::f32::consts::PI * frequency * i as f32 / 44_100.0).sin())
            .collect()
    }

    fn pipeline() -> FramePipeline {
        FramePipeline::new(44_100, &CaptureConfig::default(), 0.01, 440.0)
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn test_amplitude_level() {
        assert_eq!(amplitude_level(1.0), 100.0);
        assert_eq!(amplitude_level(0.0), 0.0);
        assert_eq!(amplitude_level(0.0005), 0.0);
        assert!((amplitude_level(0.01) - 100.0 / 3.0).abs() < 0.01);
        assert_eq!(amplitude_level(4.0), 100.0);
    }

    #[test]
    fn test_compute_rms() {
        assert_eq!(compute_rms(&[]), 0.0);
        assert!((compute_rms(&[0.5, -0.5, 0.5, -0.5]) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_loud_sine_locks() {
        let mut pipeline = pipeline();
        let output = pipeline.process(&sine(440.0, 4096), false);
        let tuner = output.tuner.unwrap();
        assert!(tuner.is_locked);
        assert_eq!(tuner.note, "A");
        assert_eq!(tuner.octave, Some(4));
        assert_eq!(tuner.cents, 0);
        assert!(output.amplitude > 80.0);
    }

    #[test]
    fn test_silence_resets_to_default() {
        let mut pipeline = pipeline();
        let output = pipeline.process(&vec![0.0; 4096], false);
        assert_eq!(output.tuner, Some(TunerResult::default()));
        assert_eq!(output.amplitude, 0.0);
    }

    #[test]
    fn test_tone_playing_suppresses_pitch_only() {
        let mut pipeline = pipeline();
        let output = pipeline.process(&sine(440.0, 4096), true);
        assert!(output.tuner.is_none());
        assert!(output.amplitude > 80.0);
    }

    #[test]
    fn test_unpitched_frame_keeps_smoothing_history() {
        let mut rng = StdRng::seed_from_u64(7);
        let noise: Vec<f32> = (0..4096).map(|_| rng.gen_range(-0.5..0.5)).collect();

        let mut pipeline = pipeline();
        pipeline.process(&sine(440.0, 4096), false);
        pipeline.process(&sine(440.0, 4096), false);

        let unpitched = pipeline.process(&noise, false).tuner.unwrap();
        assert!(!unpitched.is_locked);
        assert_eq!(unpitched.note, "--");

        // History survives: median of [440, 440, 466] is still A
        let next = pipeline.process(&sine(466.16, 4096), false).tuner.unwrap();
        assert_eq!(next.note, "A");
    }

    #[test]
    fn test_silence_clears_smoothing_history() {
        let mut pipeline = pipeline();
        pipeline.process(&sine(440.0, 4096), false);
        pipeline.process(&sine(440.0, 4096), false);
        pipeline.process(&vec![0.0; 4096], false);

        let next = pipeline.process(&sine(466.16, 4096), false).tuner.unwrap();
        assert_eq!(next.note, "A#");
    }

    #[test]
    fn test_engine_publishes_tuner() {
        let input = FixtureInputProvider::new(sine(440.0, 44_100), 44_100);
        let engine = CaptureEngine::new(Arc::new(input), CaptureConfig::default());
        let rx = engine.subscribe_tuner();

        engine.start(None).unwrap();
        assert!(wait_for(|| rx.borrow().is_locked));
        assert_eq!(rx.borrow().note, "A");

        engine.stop();
        assert_eq!(engine.tuner(), TunerResult::default());
        assert_eq!(engine.amplitude(), 0.0);
    }

    #[test]
    fn test_playback_query_suppresses_tuner() {
        let state = PlaybackState::new();
        state.set_playing(true);
        let input = FixtureInputProvider::new(sine(440.0, 44_100), 44_100);
        let engine = CaptureEngine::new(Arc::new(input), CaptureConfig::default())
            .with_playback_query(Arc::new(state));
        let amplitude = engine.subscribe_amplitude();

        engine.start(None).unwrap();
        assert!(wait_for(|| *amplitude.borrow() > 50.0));
        assert!(!engine.tuner().is_locked);
        engine.stop();
    }

    #[test]
    fn test_recording_writes_every_sample_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("take.wav");
        let samples = 4096 + 4 * 2048;
        let input = FixtureInputProvider::new(sine(220.0, samples), 44_100);
        let engine = CaptureEngine::new(Arc::new(input), CaptureConfig::default());
        let amplitude = engine.subscribe_amplitude();

        engine.start(Some(path.clone())).unwrap();
        assert_eq!(engine.recording_path(), Some(path.clone()));
        assert!(wait_for(|| *amplitude.borrow() > 0.0));
        thread::sleep(Duration::from_millis(100));
        engine.stop();

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, 44_100);
        assert_eq!(reader.len() as usize, samples);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 44 + 2 * samples as u64);
    }

    #[test]
    fn test_falls_back_to_device_defaults() {
        let input = FixtureInputProvider::new(vec![0.0; 8192], 48_000).rejecting_requested_format();
        let engine = CaptureEngine::new(Arc::new(input.clone()), CaptureConfig::default());
        engine.start(None).unwrap();
        assert!(engine.is_running());
        assert_eq!(input.open_count(), 1);
        engine.stop();
    }

    #[test]
    fn test_device_failure_leaves_engine_stopped() {
        let engine = CaptureEngine::new(Arc::new(FailingInputProvider), CaptureConfig::default());
        assert!(matches!(
            engine.start(None),
            Err(AudioError::DeviceUnavailable { .. })
        ));
        assert!(!engine.is_running());
    }

    #[test]
    fn test_start_semantics_while_running() {
        let input = FixtureInputProvider::new(vec![0.0; 8192], 44_100);
        let engine = CaptureEngine::new(Arc::new(input.clone()), CaptureConfig::default());

        engine.start(None).unwrap();
        engine.start(None).unwrap();
        assert_eq!(input.open_count(), 1);

        let dir = tempfile::tempdir().unwrap();
        engine.start(Some(dir.path().join("next.wav"))).unwrap();
        assert_eq!(input.open_count(), 2);

        engine.stop();
        engine.stop();
        assert!(!engine.is_running());
        assert!(dir.path().join("next.wav").exists());
    }

    #[test]
    fn test_stream_failure_resets_and_allows_restart() {
        let input = FixtureInputProvider::new(sine(440.0, 44_100), 44_100).failing_after(16_384);
        let engine = CaptureEngine::new(Arc::new(input.clone()), CaptureConfig::default());

        // The sine locks well before the stream drops
        engine.start(None).unwrap();
        assert!(wait_for(|| !engine.is_running()));
        assert_eq!(engine.tuner(), TunerResult::default());
        assert_eq!(engine.amplitude(), 0.0);

        engine.start(None).unwrap();
        assert_eq!(input.open_count(), 2);
        engine.stop();
    }

    #[test]
    fn test_concurrent_starts_open_one_stream() {
        let input = FixtureInputProvider::new(vec![0.0; 8192], 44_100);
        let engine = Arc::new(CaptureEngine::new(
            Arc::new(input.clone()),
            CaptureConfig::default(),
        ));

        let starters: Vec<_> = (0..4)
            .map(|_| {
                let engine = Arc::clone(&engine);
                thread::spawn(move || engine.start(None))
            })
            .collect();
        for starter in starters {
            starter.join().unwrap().unwrap();
        }

        assert_eq!(input.open_count(), 1);
        engine.stop();
    }
}
