// SessionManager: owner of the practice-session audio components
//
// Single Responsibility: sequencing capture, metronome and analysis for one
// practice take. Holds the only CaptureEngine and MetronomeScheduler so the
// microphone and output are never acquired twice.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

use crate::analysis::{AnalysisResult, RhythmAnalyzer, RhythmParams};
use crate::audio::capture::{CaptureEngine, TunerResult};
use crate::audio::clock::epoch_ms;
use crate::audio::metronome::{BeatEvent, MetronomeScheduler};
use crate::audio::tone_player::TonePlayer;
use crate::calibration::LatencyCalibrator;
use crate::config::{AppConfig, PracticeSettings};
use crate::engine::backend::{InputProvider, OutputProvider};
use crate::error::{log_audio_error, log_calibration_error, AudioError, CalibrationError};

/// Outcome of one recorded take
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub recording_path: PathBuf,
    pub session_duration_seconds: f64,
    /// Audible clicks, seconds from the start of the take
    pub click_times_seconds: Vec<f64>,
    pub latency_offset_ms: u32,
    pub analysis: AnalysisResult,
}

struct ActiveSession {
    started_at_epoch_ms: i64,
    recording: PathBuf,
    settings: PracticeSettings,
}

/// Convert emission timestamps to seconds relative to `started_at_epoch_ms`
///
/// Clicks logged before the take started are dropped.
pub fn clicks_relative_to(clicks_epoch_ms: &[i64], started_at_epoch_ms: i64) -> Vec<f64> {
    clicks_epoch_ms
        .iter()
        .filter(|&&t| t >= started_at_epoch_ms)
        .map(|&t| (t - started_at_epoch_ms) as f64 / 1000.0)
        .collect()
}

/// Coordinates capture, metronome, reference tones and calibration
pub struct SessionManager {
    capture: CaptureEngine,
    metronome: MetronomeScheduler,
    tone: TonePlayer,
    calibrator: LatencyCalibrator,
    analyzer: RhythmAnalyzer,
    settings: Mutex<PracticeSettings>,
    active: Mutex<Option<ActiveSession>>,
    recording_dir: PathBuf,
}

impl SessionManager {
    pub fn new(
        input: Arc<dyn InputProvider>,
        output: Arc<dyn OutputProvider>,
        config: AppConfig,
    ) -> Self {
        let tone = TonePlayer::new(Arc::clone(&output));
        let capture = CaptureEngine::new(input, config.capture.clone())
            .with_playback_query(Arc::new(tone.playback_state()));
        let metronome = MetronomeScheduler::new(Arc::clone(&output), config.metronome.clone());
        let calibrator = LatencyCalibrator::new(output, config.calibration.clone());

        let manager = Self {
            capture,
            metronome,
            tone,
            calibrator,
            analyzer: RhythmAnalyzer::new(config.onset_detection.clone()),
            settings: Mutex::new(PracticeSettings::default()),
            active: Mutex::new(None),
            recording_dir: std::env::temp_dir(),
        };
        if let Err(err) = manager.apply_settings(&config.practice) {
            log_audio_error(&err, "SessionManager::new");
        }
        manager
    }

    /// Directory for session recordings (system temp dir by default)
    pub fn with_recording_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.recording_dir = dir.into();
        self
    }

    /// Push practice settings into every component
    ///
    /// Capture thresholds take effect on the next capture start; tempo and
    /// pattern on the next metronome start.
    pub fn apply_settings(&self, settings: &PracticeSettings) -> Result<(), AudioError> {
        let settings = settings.sanitized();
        self.capture.set_input_threshold(settings.input_threshold);
        self.capture
            .set_reference_frequency(settings.reference_frequency_hz);
        self.metronome.configure(&settings)?;
        self.calibrator.set_offset_ms(settings.latency_offset_ms);
        *self.lock_settings()? = settings;
        Ok(())
    }

    pub fn settings(&self) -> PracticeSettings {
        self.settings
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    pub fn capture(&self) -> &CaptureEngine {
        &self.capture
    }

    pub fn metronome(&self) -> &MetronomeScheduler {
        &self.metronome
    }

    pub fn calibrator(&self) -> &LatencyCalibrator {
        &self.calibrator
    }

    pub fn subscribe_tuner(&self) -> watch::Receiver<TunerResult> {
        self.capture.subscribe_tuner()
    }

    pub fn subscribe_amplitude(&self) -> watch::Receiver<f32> {
        self.capture.subscribe_amplitude()
    }

    pub fn subscribe_beats(&self) -> broadcast::Receiver<BeatEvent> {
        self.metronome.subscribe()
    }

    /// Live tuner without recording
    pub fn start_monitoring(&self) -> Result<(), AudioError> {
        self.capture.start(None)
    }

    pub fn stop_monitoring(&self) {
        self.capture.stop();
    }

    /// Play a plucked reference tone; the tuner ignores it while it sounds
    pub fn play_reference_tone(&self, frequency_hz: f32, duration_ms: f32) -> Result<(), AudioError> {
        self.tone.play(frequency_hz, duration_ms)
    }

    pub fn is_session_active(&self) -> bool {
        self.active.lock().map(|a| a.is_some()).unwrap_or(false)
    }

    /// Start a recorded take
    ///
    /// Any running capture is stopped and restarted with a fresh recording
    /// file. The metronome runs unless `settings.bpm` is 0 (free play).
    /// Returns the recording path.
    pub fn start_session(&self, settings: &PracticeSettings) -> Result<PathBuf, AudioError> {
        let mut active = self.lock_active()?;
        if active.is_some() {
            let err = AudioError::AlreadyRunning;
            log_audio_error(&err, "SessionManager::start_session");
            return Err(err);
        }

        self.apply_settings(settings)?;
        let settings = self.settings();

        let recording = self
            .recording_dir
            .join(format!("guitar_trainer_session_{}.wav", epoch_ms()));

        self.metronome.stop();
        self.capture.stop();
        self.capture.start(Some(recording.clone()))?;
        let started_at_epoch_ms = epoch_ms();

        self.metronome.take_click_log();
        if settings.bpm > 0 {
            if let Err(err) = self.metronome.start() {
                self.capture.stop();
                return Err(err);
            }
        }

        tracing::info!(
            "[SessionManager] Session started: {} BPM {} -> {:?}",
            settings.bpm,
            settings.time_signature,
            recording
        );
        *active = Some(ActiveSession {
            started_at_epoch_ms,
            recording: recording.clone(),
            settings,
        });
        Ok(recording)
    }

    /// Stop the take and analyze the recording
    ///
    /// Metronome stops first so no click is logged after the recording ends.
    pub fn stop_session(&self) -> Result<SessionReport, AudioError> {
        let session = self.lock_active()?.take().ok_or_else(|| {
            let err = AudioError::NotRunning;
            log_audio_error(&err, "SessionManager::stop_session");
            err
        })?;

        self.metronome.stop();
        self.capture.stop();
        let stopped_at = epoch_ms();

        let click_times_seconds =
            clicks_relative_to(&self.metronome.take_click_log(), session.started_at_epoch_ms);
        let latency_offset_ms = self.latency_offset();

        let params = RhythmParams {
            target_bpm: session.settings.bpm,
            rhythm_margin: session.settings.rhythm_margin,
            latency_offset_ms,
            click_times_seconds: click_times_seconds.clone(),
        };
        let analysis = self.analyzer.analyze_file(&session.recording, &params);

        tracing::info!(
            "[SessionManager] Session stopped: {} hits, consistency {}",
            analysis.hits.len(),
            analysis.consistency
        );

        Ok(SessionReport {
            recording_path: session.recording,
            session_duration_seconds: (stopped_at - session.started_at_epoch_ms).max(0) as f64
                / 1000.0,
            click_times_seconds,
            latency_offset_ms,
            analysis,
        })
    }

    /// Score an existing recording with the current settings
    pub fn analyze_recording(&self, path: &Path, click_times_seconds: Vec<f64>) -> AnalysisResult {
        let settings = self.settings();
        let params = RhythmParams {
            target_bpm: settings.bpm,
            rhythm_margin: settings.rhythm_margin,
            latency_offset_ms: self.latency_offset(),
            click_times_seconds,
        };
        self.analyzer.analyze_file(path, &params)
    }

    pub fn latency_offset(&self) -> u32 {
        self.calibrator.offset_ms()
    }

    pub fn set_latency_offset(&self, offset_ms: u32) {
        self.calibrator.set_offset_ms(offset_ms);
        if let Ok(mut settings) = self.settings.lock() {
            settings.latency_offset_ms = self.calibrator.offset_ms();
        }
    }

    /// Run a full tap-along calibration, blocking until it finishes
    ///
    /// Taps are fed through `calibrator().tap()` from another thread. The
    /// metronome is silenced for the duration. Refused while a session is
    /// recording, since the take would lose its click track.
    pub fn calibrate(&self) -> Result<u32, CalibrationError> {
        if self.is_session_active() {
            let err = CalibrationError::SessionActive;
            log_calibration_error(&err, "SessionManager::calibrate");
            return Err(err);
        }
        self.metronome.stop();
        let offset = self.calibrator.run_to_completion()?;
        if let Ok(mut settings) = self.settings.lock() {
            settings.latency_offset_ms = offset;
        }
        Ok(offset)
    }

    /// Stop everything; an in-flight session is discarded
    pub fn shutdown(&self) {
        self.calibrator.cancel();
        self.tone.stop();
        self.metronome.stop();
        self.capture.stop();
        if let Ok(mut active) = self.active.lock() {
            active.take();
        }
        tracing::debug!("[SessionManager] Shut down");
    }

    /// Time the calibrator needs for one run
    pub fn calibration_duration(&self) -> Duration {
        self.calibrator.expected_duration()
    }

    fn lock_settings(&self) -> Result<MutexGuard<'_, PracticeSettings>, AudioError> {
        self.settings.lock().map_err(|_| AudioError::LockPoisoned {
            component: "session settings".to_string(),
        })
    }

    fn lock_active(&self) -> Result<MutexGuard<'_, Option<ActiveSession>>, AudioError> {
        self.active.lock().map_err(|_| AudioError::LockPoisoned {
            component: "active session".to_string(),
        })
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::backend::{FailingInputProvider, FixtureInputProvider, NullOutputProvider};

    fn manager(input: Arc<dyn InputProvider>) -> SessionManager {
        SessionManager::new(input, Arc::new(NullOutputProvider::new()), AppConfig::default())
    }

    #[test]
    fn test_clicks_relative_to_session_start() {
        let clicks = [900, 1000, 1500, 2000];
        assert_eq!(clicks_relative_to(&clicks, 1000), vec![0.0, 0.5, 1.0]);
        assert!(clicks_relative_to(&[], 1000).is_empty());
    }

    #[test]
    fn test_stop_without_session_is_not_running() {
        let manager = manager(Arc::new(FixtureInputProvider::new(vec![0.0; 4096], 44_100)));
        assert!(matches!(manager.stop_session(), Err(AudioError::NotRunning)));
    }

    #[test]
    fn test_settings_are_sanitized() {
        let manager = manager(Arc::new(FixtureInputProvider::new(vec![0.0; 4096], 44_100)));
        let settings = PracticeSettings {
            latency_offset_ms: 900,
            bpm: 500,
            ..PracticeSettings::default()
        };
        manager.apply_settings(&settings).unwrap();
        assert_eq!(manager.latency_offset(), PracticeSettings::LATENCY_OFFSET_MAX_MS);
        assert_eq!(manager.metronome().bpm(), 300);
    }

    #[test]
    fn test_session_records_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        let input = FixtureInputProvider::new(vec![0.0; 44_100], 44_100);
        let manager = manager(Arc::new(input)).with_recording_dir(dir.path());

        let path = manager.start_session(&PracticeSettings::default()).unwrap();
        assert!(manager.is_session_active());
        assert!(manager.metronome().is_running());
        assert!(matches!(
            manager.start_session(&PracticeSettings::default()),
            Err(AudioError::AlreadyRunning)
        ));

        std::thread::sleep(Duration::from_millis(1200));
        let report = manager.stop_session().unwrap();

        assert_eq!(report.recording_path, path);
        assert!(path.exists());
        assert!(!manager.metronome().is_running());
        assert!(!manager.capture().is_running());
        // Clicks at roughly 0, 0.5 and 1.0 s
        assert!((2..=4).contains(&report.click_times_seconds.len()));
        assert!(report.session_duration_seconds >= 1.1);
        // Silent take: nothing to score
        assert_eq!(report.analysis.bpm, 0);
        assert_eq!(report.analysis.consistency, 0);
    }

    #[test]
    fn test_free_play_session_runs_without_metronome() {
        let dir = tempfile::tempdir().unwrap();
        let input = FixtureInputProvider::new(vec![0.0; 8192], 44_100);
        let manager = manager(Arc::new(input)).with_recording_dir(dir.path());

        let settings = PracticeSettings {
            bpm: 0,
            ..PracticeSettings::default()
        };
        manager.start_session(&settings).unwrap();
        assert!(!manager.metronome().is_running());
        assert!(manager.capture().is_running());

        let report = manager.stop_session().unwrap();
        assert!(report.click_times_seconds.is_empty());
    }

    #[test]
    fn test_calibrate_refused_during_session() {
        let dir = tempfile::tempdir().unwrap();
        let input = FixtureInputProvider::new(vec![0.0; 8192], 44_100);
        let manager = manager(Arc::new(input)).with_recording_dir(dir.path());

        manager.start_session(&PracticeSettings::default()).unwrap();
        assert_eq!(manager.calibrate(), Err(CalibrationError::SessionActive));
        assert!(manager.metronome().is_running());
        assert!(manager.is_session_active());

        manager.stop_session().unwrap();
    }

    #[test]
    fn test_failed_capture_leaves_no_session() {
        let manager = manager(Arc::new(FailingInputProvider));
        assert!(manager.start_session(&PracticeSettings::default()).is_err());
        assert!(!manager.is_session_active());
        assert!(!manager.metronome().is_running());
    }
}
