//! Metronome - drift-free beat scheduling and click rendering
//!
//! Three threads per run, all stopped through one [`CancelToken`]:
//! - **render**: owns the output device, writes pre-rendered clicks padded
//!   with silence so beat `n` starts at sample `round(n × samples_per_beat)`
//! - **timing**: sleeps to `anchor + n × beat_duration` (absolute targets, so
//!   scheduling error never accumulates), stamps the beat and appends audible
//!   beats to the click log
//! - **dispatcher**: holds each beat until `target + metronome_offset` and
//!   publishes it on the broadcast channel, keeping slow subscribers and the
//!   offset delay off the timing thread
//!
//! Click log timestamps are emission times. Latency correction is applied on
//! the analysis side, to onsets only.

use std::fmt;
use std::str::FromStr;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::clock::{join_with_timeout, CancelToken};
use super::synth;
use crate::config::{MetronomeConfig, PracticeSettings};
use crate::engine::backend::{OutputProvider, SystemTimeSource, TimeSource};
use crate::error::{log_audio_error, AudioError};

pub const MIN_BPM: u32 = 20;
pub const MAX_BPM: u32 = 300;

/// How long `start()` waits for the output device
const DEVICE_READY_TIMEOUT: Duration = Duration::from_secs(3);

/// Time signature with a quarter or eighth note pulse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSignature {
    pub numerator: u32,
    pub denominator: u32,
}

impl Default for TimeSignature {
    fn default() -> Self {
        Self {
            numerator: 4,
            denominator: 4,
        }
    }
}

impl fmt::Display for TimeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

impl FromStr for TimeSignature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (num, den) = s
            .split_once('/')
            .ok_or_else(|| format!("expected n/d, got {:?}", s))?;
        let numerator: u32 = num
            .trim()
            .parse()
            .map_err(|_| format!("bad numerator in {:?}", s))?;
        let denominator: u32 = den
            .trim()
            .parse()
            .map_err(|_| format!("bad denominator in {:?}", s))?;

        if numerator == 0 || numerator > 16 {
            return Err(format!("numerator must be 1-16, got {}", numerator));
        }
        if denominator != 4 && denominator != 8 {
            return Err(format!("denominator must be 4 or 8, got {}", denominator));
        }
        Ok(Self {
            numerator,
            denominator,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BeatType {
    Accent,
    Normal,
    Mute,
}

impl BeatType {
    pub fn is_audible(self) -> bool {
        self != BeatType::Mute
    }
}

/// Ordered accent pattern, one entry per beat of the bar
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeatPattern(Vec<BeatType>);

impl BeatPattern {
    pub fn new(beats: Vec<BeatType>) -> Self {
        Self(beats)
    }

    /// Accent on one, normal on every other beat
    pub fn for_signature(signature: &TimeSignature) -> Self {
        let beats = (0..signature.numerator.max(1))
            .map(|i| if i == 0 { BeatType::Accent } else { BeatType::Normal })
            .collect();
        Self(beats)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Beat type at `index`, wrapping around the bar
    pub fn get(&self, index: usize) -> BeatType {
        if self.0.is_empty() {
            return BeatType::Normal;
        }
        self.0[index % self.0.len()]
    }

    pub fn beats(&self) -> &[BeatType] {
        &self.0
    }
}

impl Default for BeatPattern {
    fn default() -> Self {
        Self::for_signature(&TimeSignature::default())
    }
}

/// One scheduled beat as seen by subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeatEvent {
    /// Position in the bar (beat number mod pattern length)
    pub beat_index: usize,
    pub is_accent: bool,
    pub beat_type: BeatType,
    pub emitted_at_epoch_ms: i64,
}

/// Nanoseconds per beat for a tempo and pulse note value
pub fn beat_duration_nanos(bpm: u32, note_value: u32) -> u64 {
    let bpm = bpm.clamp(MIN_BPM, MAX_BPM) as f64;
    let note_value = note_value.max(1) as f64;
    (60e9 / bpm * (4.0 / note_value)) as u64
}

/// First sample of beat `n` in the rendered stream
pub fn beat_sample_position(n: u64, samples_per_beat: f64) -> u64 {
    (n as f64 * samples_per_beat).round() as u64
}

#[derive(Debug, Clone)]
struct SchedulerSettings {
    bpm: u32,
    pattern: BeatPattern,
    note_value: u32,
    metronome_offset_ms: u32,
}

struct RunHandles {
    cancel: CancelToken,
    threads: Vec<(&'static str, JoinHandle<()>)>,
}

struct PendingBeat {
    event: BeatEvent,
    due: Instant,
}

/// Pre-rendered click buffers at the output sample rate
struct ClickBank {
    accent: Vec<f32>,
    normal: Vec<f32>,
}

impl ClickBank {
    fn render(config: &MetronomeConfig, sample_rate: u32) -> Self {
        Self {
            accent: synth::metronome_click(
                config.accent_frequency_hz,
                config.click_duration_ms,
                sample_rate,
            ),
            normal: synth::metronome_click(
                config.normal_frequency_hz,
                config.click_duration_ms,
                sample_rate,
            ),
        }
    }

    fn for_beat(&self, beat: BeatType) -> &[f32] {
        match beat {
            BeatType::Accent => &self.accent,
            BeatType::Normal => &self.normal,
            BeatType::Mute => &[],
        }
    }
}

/// Drift-free metronome
pub struct MetronomeScheduler {
    output: Arc<dyn OutputProvider>,
    time: Arc<dyn TimeSource>,
    config: MetronomeConfig,
    settings: Mutex<SchedulerSettings>,
    beat_tx: broadcast::Sender<BeatEvent>,
    click_log: Arc<Mutex<Vec<i64>>>,
    run: Mutex<Option<RunHandles>>,
}

impl MetronomeScheduler {
    pub fn new(output: Arc<dyn OutputProvider>, config: MetronomeConfig) -> Self {
        Self::with_time_source(output, config, Arc::new(SystemTimeSource::default()))
    }

    pub fn with_time_source(
        output: Arc<dyn OutputProvider>,
        config: MetronomeConfig,
        time: Arc<dyn TimeSource>,
    ) -> Self {
        let (beat_tx, _) = broadcast::channel(64);
        Self {
            output,
            time,
            config,
            settings: Mutex::new(SchedulerSettings {
                bpm: 120,
                pattern: BeatPattern::default(),
                note_value: 4,
                metronome_offset_ms: 0,
            }),
            beat_tx,
            click_log: Arc::new(Mutex::new(Vec::new())),
            run: Mutex::new(None),
        }
    }

    /// Receive every beat published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<BeatEvent> {
        self.beat_tx.subscribe()
    }

    /// Set the tempo for the next `start()`; returns the clamped value
    pub fn set_bpm(&self, bpm: u32) -> Result<u32, AudioError> {
        if bpm == 0 {
            return Err(AudioError::BpmInvalid { bpm });
        }
        let bpm = bpm.clamp(MIN_BPM, MAX_BPM);
        self.lock_settings()?.bpm = bpm;
        Ok(bpm)
    }

    /// Set the accent pattern and pulse note value for the next `start()`
    ///
    /// Note values other than 4 and 8 fall back to 4.
    pub fn set_pattern(&self, pattern: BeatPattern, note_value: u32) -> Result<(), AudioError> {
        let note_value = if note_value == 8 { 8 } else { 4 };
        let mut settings = self.lock_settings()?;
        settings.pattern = pattern;
        settings.note_value = note_value;
        Ok(())
    }

    /// Delay between a beat's target time and its event delivery
    pub fn set_metronome_offset_ms(&self, offset_ms: u32) -> Result<(), AudioError> {
        self.lock_settings()?.metronome_offset_ms =
            offset_ms.min(PracticeSettings::METRONOME_OFFSET_MAX_MS);
        Ok(())
    }

    /// Apply tempo, signature, pattern and offset from practice settings
    pub fn configure(&self, settings: &PracticeSettings) -> Result<(), AudioError> {
        let settings = settings.sanitized();
        let signature = settings.parsed_time_signature();
        self.set_bpm(settings.bpm.max(1))?;
        self.set_pattern(settings.resolved_pattern(), signature.denominator)?;
        self.set_metronome_offset_ms(settings.metronome_offset_ms)
    }

    pub fn bpm(&self) -> u32 {
        self.settings
            .lock()
            .map(|s| s.bpm)
            .unwrap_or_else(|e| e.into_inner().bpm)
    }

    pub fn is_running(&self) -> bool {
        self.run.lock().map(|r| r.is_some()).unwrap_or(false)
    }

    /// Snapshot of emission timestamps (epoch ms) of audible beats
    pub fn click_log(&self) -> Vec<i64> {
        self.click_log
            .lock()
            .map(|log| log.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    /// Drain the click log
    pub fn take_click_log(&self) -> Vec<i64> {
        let mut log = self.click_log.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *log)
    }

    fn lock_settings(&self) -> Result<std::sync::MutexGuard<'_, SchedulerSettings>, AudioError> {
        self.settings.lock().map_err(|_| AudioError::LockPoisoned {
            component: "metronome settings".to_string(),
        })
    }

    /// Start clicking; a no-op when already running
    ///
    /// Fails only when the output device cannot be opened, in which case the
    /// scheduler stays stopped.
    pub fn start(&self) -> Result<(), AudioError> {
        let mut run = self.run.lock().map_err(|_| AudioError::LockPoisoned {
            component: "metronome run state".to_string(),
        })?;
        if run.is_some() {
            tracing::debug!("[Metronome] start() while running; ignoring");
            return Ok(());
        }

        let settings = self.lock_settings()?.clone();
        let beat_nanos = beat_duration_nanos(settings.bpm, settings.note_value);
        let cancel = CancelToken::new();

        // Render thread opens the device and reports (sample_rate, anchor)
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(u32, Instant), AudioError>>();
        let render = {
            let output = Arc::clone(&self.output);
            let config = self.config.clone();
            let pattern = settings.pattern.clone();
            let cancel = cancel.clone();
            thread::Builder::new()
                .name("metronome-render".to_string())
                .spawn(move || render_loop(output, config, pattern, beat_nanos, cancel, ready_tx))
                .map_err(|e| AudioError::HardwareError {
                    details: format!("Failed to spawn render thread: {}", e),
                })?
        };

        let anchor = match ready_rx.recv_timeout(DEVICE_READY_TIMEOUT) {
            Ok(Ok((sample_rate, anchor))) => {
                tracing::info!(
                    "[Metronome] Started: {} BPM, 1/{} pulse, {} beats/bar, output {} Hz",
                    settings.bpm,
                    settings.note_value,
                    settings.pattern.len(),
                    sample_rate
                );
                anchor
            }
            Ok(Err(err)) => {
                log_audio_error(&err, "MetronomeScheduler::start");
                cancel.cancel();
                join_with_timeout(render, self.join_timeout(), "Metronome");
                return Err(err);
            }
            Err(_) => {
                cancel.cancel();
                join_with_timeout(render, self.join_timeout(), "Metronome");
                let err = AudioError::DeviceUnavailable {
                    device: "output".to_string(),
                    reason: "device did not become ready".to_string(),
                };
                log_audio_error(&err, "MetronomeScheduler::start");
                return Err(err);
            }
        };

        let (beat_tx, beat_rx) = mpsc::channel::<PendingBeat>();

        let timing = {
            let time = Arc::clone(&self.time);
            let click_log = Arc::clone(&self.click_log);
            let cancel = cancel.clone();
            let pattern = settings.pattern.clone();
            let offset = Duration::from_millis(settings.metronome_offset_ms as u64);
            thread::Builder::new()
                .name("metronome-timing".to_string())
                .spawn(move || {
                    timing_loop(
                        anchor, beat_nanos, pattern, offset, time, click_log, cancel, beat_tx,
                    )
                })
        };

        let dispatcher = {
            let tx = self.beat_tx.clone();
            let cancel = cancel.clone();
            thread::Builder::new()
                .name("metronome-dispatch".to_string())
                .spawn(move || dispatch_loop(beat_rx, tx, cancel))
        };

        let mut threads = vec![("Metronome render", render)];
        let spawned = [("Metronome timing", timing), ("Metronome dispatch", dispatcher)];
        for (name, handle) in spawned {
            match handle {
                Ok(handle) => threads.push((name, handle)),
                Err(e) => {
                    cancel.cancel();
                    for (name, handle) in threads {
                        join_with_timeout(handle, self.join_timeout(), name);
                    }
                    return Err(AudioError::HardwareError {
                        details: format!("Failed to spawn {} thread: {}", name, e),
                    });
                }
            }
        }

        *run = Some(RunHandles { cancel, threads });
        Ok(())
    }

    /// Stop timing, dispatch and rendering and release the output device
    ///
    /// Idempotent.
    pub fn stop(&self) {
        let handles = match self.run.lock() {
            Ok(mut run) => run.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(handles) = handles else {
            return;
        };

        handles.cancel.cancel();
        for (name, handle) in handles.threads {
            join_with_timeout(handle, self.join_timeout(), name);
        }
        tracing::info!("[Metronome] Stopped");
    }

    fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.config.join_timeout_ms)
    }
}

impl Drop for MetronomeScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn render_loop(
    output: Arc<dyn OutputProvider>,
    config: MetronomeConfig,
    pattern: BeatPattern,
    beat_nanos: u64,
    cancel: CancelToken,
    ready_tx: mpsc::Sender<Result<(u32, Instant), AudioError>>,
) {
    // Device handle lives and dies on this thread
    let mut sink = match output.open(44_100) {
        Ok(sink) => sink,
        Err(err) => {
            let _ = ready_tx.send(Err(err));
            return;
        }
    };

    let sample_rate = sink.sample_rate();
    let clicks = ClickBank::render(&config, sample_rate);
    let samples_per_beat = sample_rate as f64 * beat_nanos as f64 / 1e9;
    let chunk = config.render_chunk_size.max(64);
    let silence = vec![0.0f32; chunk];

    if ready_tx.send(Ok((sample_rate, Instant::now()))).is_err() {
        return;
    }

    let mut beat: u64 = 0;
    while !cancel.is_cancelled() {
        let start = beat_sample_position(beat, samples_per_beat);
        let end = beat_sample_position(beat + 1, samples_per_beat);
        let beat_len = (end - start) as usize;

        let click = clicks.for_beat(pattern.get(beat as usize));
        let click = &click[..click.len().min(beat_len)];
        if let Err(err) = sink.write(click, &cancel) {
            log_audio_error(&err, "Metronome render");
            return;
        }

        let mut remaining = beat_len - click.len();
        while remaining > 0 && !cancel.is_cancelled() {
            let n = remaining.min(chunk);
            if let Err(err) = sink.write(&silence[..n], &cancel) {
                log_audio_error(&err, "Metronome render");
                return;
            }
            remaining -= n;
        }
        beat += 1;
    }
}

#[allow(clippy::too_many_arguments)]
fn timing_loop(
    anchor: Instant,
    beat_nanos: u64,
    pattern: BeatPattern,
    offset: Duration,
    time: Arc<dyn TimeSource>,
    click_log: Arc<Mutex<Vec<i64>>>,
    cancel: CancelToken,
    beats: mpsc::Sender<PendingBeat>,
) {
    let mut n: u64 = 0;
    loop {
        let target = anchor + Duration::from_nanos(n.saturating_mul(beat_nanos));
        if cancel.wait_until(target) {
            break;
        }

        let emitted = time.epoch_ms();
        let beat_type = pattern.get(n as usize);
        if beat_type.is_audible() {
            click_log
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(emitted);
        }

        let event = BeatEvent {
            beat_index: (n as usize) % pattern.len().max(1),
            is_accent: beat_type == BeatType::Accent,
            beat_type,
            emitted_at_epoch_ms: emitted,
        };
        if beats
            .send(PendingBeat {
                event,
                due: target + offset,
            })
            .is_err()
        {
            break;
        }
        n += 1;
    }
}

fn dispatch_loop(
    beats: mpsc::Receiver<PendingBeat>,
    tx: broadcast::Sender<BeatEvent>,
    cancel: CancelToken,
) {
    while !cancel.is_cancelled() {
        let pending = match beats.recv_timeout(Duration::from_millis(20)) {
            Ok(pending) => pending,
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        };
        if cancel.wait_until(pending.due) {
            break;
        }
        // No subscribers is fine
        let _ = tx.send(pending.event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::clock::epoch_ms;
    use crate::engine::backend::{NullOutputProvider, OutputSink};

    struct NoOutput;

    impl OutputProvider for NoOutput {
        fn open(&self, _sample_rate: u32) -> Result<Box<dyn OutputSink>, AudioError> {
            Err(AudioError::DeviceUnavailable {
                device: "output".to_string(),
                reason: "unplugged".to_string(),
            })
        }
    }

    fn scheduler() -> (MetronomeScheduler, NullOutputProvider) {
        let output = NullOutputProvider::new();
        let scheduler = MetronomeScheduler::new(Arc::new(output.clone()), MetronomeConfig::default());
        (scheduler, output)
    }

    #[test]
    fn test_time_signature_parsing() {
        assert_eq!("3/4".parse::<TimeSignature>().unwrap().numerator, 3);
        assert_eq!("6/8".parse::<TimeSignature>().unwrap().denominator, 8);
        assert!("4/3".parse::<TimeSignature>().is_err());
        assert!("0/4".parse::<TimeSignature>().is_err());
        assert!("waltz".parse::<TimeSignature>().is_err());
        assert_eq!(TimeSignature::default().to_string(), "4/4");
    }

    #[test]
    fn test_default_pattern_accents_first_beat() {
        let pattern = BeatPattern::for_signature(&"5/4".parse().unwrap());
        assert_eq!(pattern.len(), 5);
        assert_eq!(pattern.get(0), BeatType::Accent);
        assert!(pattern.beats()[1..].iter().all(|&b| b == BeatType::Normal));
        assert_eq!(pattern.get(5), BeatType::Accent);
    }

    #[test]
    fn test_beat_duration() {
        assert_eq!(beat_duration_nanos(120, 4), 500_000_000);
        assert_eq!(beat_duration_nanos(120, 8), 250_000_000);
        assert_eq!(beat_duration_nanos(60, 4), 1_000_000_000);
        // Clamped into range
        assert_eq!(beat_duration_nanos(1000, 4), beat_duration_nanos(300, 4));
    }

    #[test]
    fn test_beat_sample_positions_do_not_drift() {
        let spb = 48_000.0 * 60.0 / 140.0;
        assert_eq!(beat_sample_position(0, spb), 0);
        assert_eq!(beat_sample_position(1, spb), 20_571);
        assert_eq!(beat_sample_position(2, spb), 41_143);
        assert_eq!(beat_sample_position(7000, spb), 144_000_000);
    }

    #[test]
    fn test_set_bpm_clamps() {
        let (scheduler, _) = scheduler();
        assert_eq!(scheduler.set_bpm(500).unwrap(), 300);
        assert_eq!(scheduler.set_bpm(5).unwrap(), 20);
        assert!(matches!(scheduler.set_bpm(0), Err(AudioError::BpmInvalid { bpm: 0 })));
        assert_eq!(scheduler.bpm(), 20);
    }

    #[test]
    fn test_beats_follow_tempo() {
        let (scheduler, output) = scheduler();
        scheduler.set_bpm(120).unwrap();
        let mut rx = scheduler.subscribe();
        scheduler.start().unwrap();

        let events: Vec<BeatEvent> = (0..5).map(|_| rx.blocking_recv().unwrap()).collect();
        scheduler.stop();

        let indices: Vec<usize> = events.iter().map(|e| e.beat_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 0]);
        assert!(events[0].is_accent && !events[1].is_accent && events[4].is_accent);

        let span = events[4].emitted_at_epoch_ms - events[0].emitted_at_epoch_ms;
        assert!((span - 2000).abs() <= 40, "4 beats took {} ms", span);
        assert!(output.samples_written() > 0);
    }

    #[test]
    fn test_muted_beats_are_not_logged() {
        let (scheduler, _) = scheduler();
        scheduler
            .set_pattern(
                BeatPattern::new(vec![
                    BeatType::Accent,
                    BeatType::Mute,
                    BeatType::Normal,
                    BeatType::Mute,
                ]),
                4,
            )
            .unwrap();
        let mut rx = scheduler.subscribe();
        scheduler.start().unwrap();

        let events: Vec<BeatEvent> = (0..4).map(|_| rx.blocking_recv().unwrap()).collect();
        scheduler.stop();

        assert_eq!(events[1].beat_type, BeatType::Mute);
        let log = scheduler.take_click_log();
        assert_eq!(log.len(), 2);
        assert!((log[1] - log[0] - 1000).abs() <= 40);
        assert!(scheduler.take_click_log().is_empty());
    }

    #[test]
    fn test_offset_delays_delivery() {
        let (scheduler, _) = scheduler();
        scheduler.set_metronome_offset_ms(200).unwrap();
        let mut rx = scheduler.subscribe();
        scheduler.start().unwrap();

        let event = rx.blocking_recv().unwrap();
        let delivered = epoch_ms();
        scheduler.stop();

        assert!(delivered - event.emitted_at_epoch_ms >= 190);
    }

    #[test]
    fn test_start_and_stop_are_idempotent() {
        let (scheduler, _) = scheduler();
        scheduler.stop();
        scheduler.start().unwrap();
        scheduler.start().unwrap();
        assert!(scheduler.is_running());
        scheduler.stop();
        scheduler.stop();
        assert!(!scheduler.is_running());

        // Restart after stop
        scheduler.start().unwrap();
        assert!(scheduler.is_running());
        scheduler.stop();
    }

    #[test]
    fn test_missing_output_device_keeps_scheduler_stopped() {
        let scheduler = MetronomeScheduler::new(Arc::new(NoOutput), MetronomeConfig::default());
        assert!(matches!(
            scheduler.start(),
            Err(AudioError::DeviceUnavailable { .. })
        ));
        assert!(!scheduler.is_running());
    }
}
