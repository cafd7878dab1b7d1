// Tap-along latency calibration
//
// The calibrator plays a short train of clicks and the user taps along. Each
// tap is matched to its nearest click and the median of the signed
// differences becomes the latency offset subtracted from detected onsets.
//
// Phases: Idle → Listening (clicks playing, taps accepted) → Computing → Idle

use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

use crate::audio::clock::{join_with_timeout, CancelToken};
use crate::audio::synth;
use crate::config::{CalibrationConfig, PracticeSettings};
use crate::engine::backend::{OutputProvider, OutputSink, SystemTimeSource, TimeSource};
use crate::error::{log_calibration_error, CalibrationError, ErrorCode};

const DEVICE_READY_TIMEOUT: Duration = Duration::from_secs(3);
const SILENCE_CHUNK: usize = 512;
const JOIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalibrationPhase {
    Idle,
    Listening,
    Computing,
}

/// Progress notifications for a calibration run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CalibrationEvent {
    Started { click_count: usize },
    Click { index: usize, emitted_at_epoch_ms: i64 },
    Completed { offset_ms: u32 },
    Failed { code: i32, message: String },
}

/// One tap paired with the click it answers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationSample {
    pub tap_epoch_ms: i64,
    pub nearest_click_epoch_ms: i64,
}

impl CalibrationSample {
    /// Signed tap lag; negative when the tap came early
    pub fn delta_ms(&self) -> i64 {
        self.tap_epoch_ms - self.nearest_click_epoch_ms
    }
}

/// Pair every tap with its nearest click, keeping lags inside the window
///
/// Ties go to the earlier click.
pub fn match_taps(
    clicks: &[i64],
    taps: &[i64],
    min_delta_ms: i64,
    max_delta_ms: i64,
) -> Vec<CalibrationSample> {
    taps.iter()
        .filter_map(|&tap| {
            let nearest = clicks
                .iter()
                .copied()
                .min_by_key(|&click| (tap - click).abs())?;
            let sample = CalibrationSample {
                tap_epoch_ms: tap,
                nearest_click_epoch_ms: nearest,
            };
            (min_delta_ms..=max_delta_ms)
                .contains(&sample.delta_ms())
                .then_some(sample)
        })
        .collect()
}

/// Median of `values`; the rounded mean of the middle pair for even counts
pub fn median_ms(values: &[i64]) -> Option<i64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        Some(sorted[mid])
    } else {
        let sum = sorted[mid - 1] + sorted[mid];
        Some((sum as f64 / 2.0).round() as i64)
    }
}

/// Latency offset from recorded click and tap timestamps (epoch ms)
pub fn compute_latency_offset(
    clicks: &[i64],
    taps: &[i64],
    config: &CalibrationConfig,
) -> Result<u32, CalibrationError> {
    let deltas: Vec<i64> = match_taps(clicks, taps, config.min_delta_ms, config.max_delta_ms)
        .iter()
        .map(CalibrationSample::delta_ms)
        .collect();
    if deltas.len() < config.min_matches {
        return Err(CalibrationError::InsufficientSamples {
            required: config.min_matches,
            collected: deltas.len(),
        });
    }

    let median = median_ms(&deltas).unwrap_or(0).max(0);
    Ok((median as u32).min(PracticeSettings::LATENCY_OFFSET_MAX_MS))
}

#[derive(Debug)]
struct Collected {
    phase: CalibrationPhase,
    clicks: Vec<i64>,
    taps: Vec<i64>,
}

struct CalibrationRun {
    cancel: CancelToken,
    handle: JoinHandle<()>,
    outcome: Arc<Mutex<Option<Result<u32, CalibrationError>>>>,
}

/// Measures output-to-input latency with a tap-along click train
pub struct LatencyCalibrator {
    output: Arc<dyn OutputProvider>,
    time: Arc<dyn TimeSource>,
    config: CalibrationConfig,
    collected: Arc<Mutex<Collected>>,
    offset_tx: watch::Sender<u32>,
    events: broadcast::Sender<CalibrationEvent>,
    run: Mutex<Option<CalibrationRun>>,
}

impl LatencyCalibrator {
    pub fn new(output: Arc<dyn OutputProvider>, config: CalibrationConfig) -> Self {
        Self::with_time_source(output, config, Arc::new(SystemTimeSource::default()))
    }

    pub fn with_time_source(
        output: Arc<dyn OutputProvider>,
        config: CalibrationConfig,
        time: Arc<dyn TimeSource>,
    ) -> Self {
        let (offset_tx, _) = watch::channel(0);
        let (events, _) = broadcast::channel(32);
        Self {
            output,
            time,
            config,
            collected: Arc::new(Mutex::new(Collected {
                phase: CalibrationPhase::Idle,
                clicks: Vec::new(),
                taps: Vec::new(),
            })),
            offset_tx,
            events,
            run: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CalibrationEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_offset(&self) -> watch::Receiver<u32> {
        self.offset_tx.subscribe()
    }

    /// Current latency offset in milliseconds
    pub fn offset_ms(&self) -> u32 {
        *self.offset_tx.borrow()
    }

    /// Seed the offset, e.g. from persisted settings
    pub fn set_offset_ms(&self, offset_ms: u32) {
        self.offset_tx
            .send_replace(offset_ms.min(PracticeSettings::LATENCY_OFFSET_MAX_MS));
    }

    pub fn phase(&self) -> CalibrationPhase {
        lock_collected(&self.collected).phase
    }

    /// Begin playing clicks and accepting taps
    pub fn start(&self) -> Result<(), CalibrationError> {
        let mut run = self.run.lock().map_err(|_| CalibrationError::StatePoisoned)?;
        if let Some(previous) = run.as_ref() {
            if !previous.handle.is_finished() {
                let err = CalibrationError::AlreadyInProgress;
                log_calibration_error(&err, "start");
                return Err(err);
            }
        }
        if let Some(previous) = run.take() {
            join_with_timeout(previous.handle, JOIN_TIMEOUT, "LatencyCalibrator");
        }

        {
            let mut collected = lock_collected(&self.collected);
            collected.clicks.clear();
            collected.taps.clear();
        }

        let cancel = CancelToken::new();
        let outcome = Arc::new(Mutex::new(None));
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), CalibrationError>>();

        let worker = CalibrationWorker {
            output: Arc::clone(&self.output),
            time: Arc::clone(&self.time),
            config: self.config.clone(),
            collected: Arc::clone(&self.collected),
            offset_tx: self.offset_tx.clone(),
            events: self.events.clone(),
            cancel: cancel.clone(),
        };
        let worker_outcome = Arc::clone(&outcome);
        let handle = thread::Builder::new()
            .name("latency-calibration".to_string())
            .spawn(move || {
                let result = worker.run(ready_tx);
                *worker_outcome.lock().unwrap_or_else(|e| e.into_inner()) = Some(result);
            })
            .map_err(|e| CalibrationError::OutputUnavailable {
                reason: format!("failed to spawn calibration thread: {}", e),
            })?;

        let ready = ready_rx.recv_timeout(DEVICE_READY_TIMEOUT).unwrap_or_else(|_| {
            Err(CalibrationError::OutputUnavailable {
                reason: "device did not become ready".to_string(),
            })
        });

        if let Err(err) = ready {
            log_calibration_error(&err, "start");
            cancel.cancel();
            join_with_timeout(handle, JOIN_TIMEOUT, "LatencyCalibrator");
            return Err(err);
        }

        log::info!(
            "[LatencyCalibrator] Started: {} clicks every {} ms",
            self.config.click_count,
            self.config.click_interval_ms
        );
        *run = Some(CalibrationRun {
            cancel,
            handle,
            outcome,
        });
        Ok(())
    }

    /// Record a tap now
    pub fn tap(&self) -> Result<(), CalibrationError> {
        self.record_tap_at(self.time.epoch_ms())
    }

    /// Record a tap observed at `epoch_ms`
    pub fn record_tap_at(&self, epoch_ms: i64) -> Result<(), CalibrationError> {
        let mut collected = lock_collected(&self.collected);
        if collected.phase != CalibrationPhase::Listening {
            return Err(CalibrationError::NotListening);
        }
        collected.taps.push(epoch_ms);
        Ok(())
    }

    /// Block until the current run finishes and return its outcome
    pub fn wait(&self, timeout: Duration) -> Result<u32, CalibrationError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut run = self.run.lock().map_err(|_| CalibrationError::StatePoisoned)?;
                let finished = match run.as_ref() {
                    Some(current) => current.handle.is_finished(),
                    None => return Err(CalibrationError::NotListening),
                };
                if finished {
                    if let Some(done) = run.take() {
                        join_with_timeout(done.handle, JOIN_TIMEOUT, "LatencyCalibrator");
                        let outcome = done
                            .outcome
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .take();
                        return outcome.unwrap_or(Err(CalibrationError::StatePoisoned));
                    }
                }
            }

            if Instant::now() >= deadline {
                return Err(CalibrationError::Timeout {
                    reason: format!("still running after {} ms", timeout.as_millis()),
                });
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Start a run and block until it completes
    pub fn run_to_completion(&self) -> Result<u32, CalibrationError> {
        self.start()?;
        self.wait(self.expected_duration() + DEVICE_READY_TIMEOUT)
    }

    /// Abort the current run, discarding partial data. Idempotent.
    pub fn cancel(&self) {
        let previous = self
            .run
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(run) = previous {
            run.cancel.cancel();
            join_with_timeout(run.handle, JOIN_TIMEOUT, "LatencyCalibrator");
            log::info!("[LatencyCalibrator] Cancelled");
        }
    }

    /// Lead-in plus click train plus trailing pause
    pub fn expected_duration(&self) -> Duration {
        let c = &self.config;
        Duration::from_millis(
            c.lead_in_ms
                + c.click_interval_ms * c.click_count.saturating_sub(1) as u64
                + c.trailing_pause_ms,
        )
    }
}

impl Drop for LatencyCalibrator {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn lock_collected(collected: &Mutex<Collected>) -> MutexGuard<'_, Collected> {
    collected.lock().unwrap_or_else(|e| e.into_inner())
}

struct CalibrationWorker {
    output: Arc<dyn OutputProvider>,
    time: Arc<dyn TimeSource>,
    config: CalibrationConfig,
    collected: Arc<Mutex<Collected>>,
    offset_tx: watch::Sender<u32>,
    events: broadcast::Sender<CalibrationEvent>,
    cancel: CancelToken,
}

impl CalibrationWorker {
    fn run(self, ready_tx: mpsc::Sender<Result<(), CalibrationError>>) -> Result<u32, CalibrationError> {
        let mut sink = match self.output.open(44_100) {
            Ok(sink) => sink,
            Err(err) => {
                let err = CalibrationError::OutputUnavailable {
                    reason: err.to_string(),
                };
                let _ = ready_tx.send(Err(err.clone()));
                return Err(err);
            }
        };

        self.set_phase(CalibrationPhase::Listening);
        let _ = ready_tx.send(Ok(()));
        let _ = self.events.send(CalibrationEvent::Started {
            click_count: self.config.click_count,
        });

        let result = self
            .play_clicks(sink.as_mut())
            .and_then(|_| self.trailing_pause())
            .and_then(|_| self.compute());

        match &result {
            Ok(offset_ms) => {
                self.offset_tx.send_replace(*offset_ms);
                log::info!("[LatencyCalibrator] Latency offset: {} ms", offset_ms);
                let _ = self.events.send(CalibrationEvent::Completed {
                    offset_ms: *offset_ms,
                });
            }
            Err(err) => {
                log_calibration_error(err, "run");
                let _ = self.events.send(CalibrationEvent::Failed {
                    code: err.code(),
                    message: err.message(),
                });
            }
        }

        let mut collected = lock_collected(&self.collected);
        collected.phase = CalibrationPhase::Idle;
        collected.clicks.clear();
        collected.taps.clear();
        result
    }

    fn set_phase(&self, phase: CalibrationPhase) {
        lock_collected(&self.collected).phase = phase;
    }

    fn play_clicks(&self, sink: &mut dyn OutputSink) -> Result<(), CalibrationError> {
        let sample_rate = sink.sample_rate();
        let click = synth::calibration_click(
            self.config.click_frequency_hz,
            self.config.click_duration_ms,
            sample_rate,
        );
        let interval = synth::sample_count(self.config.click_interval_ms as f32, sample_rate);
        let gap = interval.saturating_sub(click.len());

        self.write_silence(
            sink,
            synth::sample_count(self.config.lead_in_ms as f32, sample_rate),
        )?;

        for index in 0..self.config.click_count {
            let emitted = self.time.epoch_ms();
            lock_collected(&self.collected).clicks.push(emitted);
            let _ = self.events.send(CalibrationEvent::Click {
                index,
                emitted_at_epoch_ms: emitted,
            });

            self.write(sink, &click)?;
            if index + 1 < self.config.click_count {
                self.write_silence(sink, gap)?;
            }
        }
        Ok(())
    }

    fn write(&self, sink: &mut dyn OutputSink, samples: &[f32]) -> Result<(), CalibrationError> {
        if self.cancel.is_cancelled() {
            return Err(CalibrationError::Cancelled);
        }
        sink.write(samples, &self.cancel)
            .map_err(|err| CalibrationError::OutputUnavailable {
                reason: err.to_string(),
            })
    }

    fn write_silence(&self, sink: &mut dyn OutputSink, len: usize) -> Result<(), CalibrationError> {
        let silence = [0.0f32; SILENCE_CHUNK];
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(SILENCE_CHUNK);
            self.write(sink, &silence[..n])?;
            remaining -= n;
        }
        Ok(())
    }

    fn trailing_pause(&self) -> Result<(), CalibrationError> {
        let pause = Duration::from_millis(self.config.trailing_pause_ms);
        if self.cancel.wait_for(pause) {
            return Err(CalibrationError::Cancelled);
        }
        Ok(())
    }

    fn compute(&self) -> Result<u32, CalibrationError> {
        let (clicks, taps) = {
            let mut collected = lock_collected(&self.collected);
            collected.phase = CalibrationPhase::Computing;
            (
                std::mem::take(&mut collected.clicks),
                std::mem::take(&mut collected.taps),
            )
        };
        log::debug!(
            "[LatencyCalibrator] Computing from {} clicks, {} taps",
            clicks.len(),
            taps.len()
        );
        compute_latency_offset(&clicks, &taps, &self.config)
    }
}
