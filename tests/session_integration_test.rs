//! Integration tests for the practice session flow
//!
//! Devices are replaced by the stub backends: the fixture input replays a
//! synthetic take and the null output paces metronome clicks in real time.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use guitar_trainer::analysis::NoteType;
use guitar_trainer::audio::TunerResult;
use guitar_trainer::engine::{FixtureInputProvider, NullOutputProvider};
use guitar_trainer::{AppConfig, AudioError, PracticeSettings, SessionManager};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const SAMPLE_RATE: u32 = 44_100;

/// Frame-aligned length so capture records every fixture sample
const TAKE_SAMPLES: usize = 4096 + 41 * 2048;

fn offbeat_take() -> Vec<f32> {
    let mut signal = vec![0.0f32; TAKE_SAMPLES];
    let mut rng = StdRng::seed_from_u64(3);
    let decay = SAMPLE_RATE as f32 * 0.01;

    // "and" of beats 1-4 at 120 BPM
    for attack in [0.25, 0.75, 1.25, 1.75] {
        let start = (attack * SAMPLE_RATE as f64) as usize;
        for offset in 0..(SAMPLE_RATE as usize / 25) {
            let envelope = (-(offset as f32) / decay).exp();
            signal[start + offset] = rng.gen_range(-0.8..0.8) * envelope;
        }
    }
    signal
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
fn test_recorded_session_is_scored_against_the_grid() {
    let dir = tempfile::tempdir().unwrap();
    let input = FixtureInputProvider::new(offbeat_take(), SAMPLE_RATE);
    let manager = SessionManager::new(
        Arc::new(input),
        Arc::new(NullOutputProvider::new()),
        AppConfig::default(),
    )
    .with_recording_dir(dir.path());

    let settings = PracticeSettings {
        bpm: 120,
        ..PracticeSettings::default()
    };
    let recording = manager.start_session(&settings).unwrap();
    thread::sleep(Duration::from_millis(2200));
    let report = manager.stop_session().unwrap();

    assert_eq!(report.recording_path, recording);
    let reader = hound::WavReader::open(&recording).unwrap();
    assert_eq!(reader.len() as usize, TAKE_SAMPLES);

    // Clicks at 0, 0.5, 1.0, 1.5, 2.0 s
    assert!(report.click_times_seconds.len() >= 4);
    for (i, click) in report.click_times_seconds.iter().enumerate() {
        assert!((click - 0.5 * i as f64).abs() < 0.05, "click {} at {}", i, click);
    }

    let analysis = &report.analysis;
    assert_eq!(analysis.bpm, 120);
    assert_eq!(analysis.hits.len(), 4, "hits: {:?}", analysis.hits);
    assert_eq!(analysis.hits_on_beat, 4);
    assert_eq!(analysis.consistency, 100);
    assert!(analysis
        .hits
        .iter()
        .all(|hit| hit.note_type == NoteType::Perfect));
}

#[test]
fn test_monitoring_tracks_pitch_then_resets() {
    // Open A string: fundamental plus a weaker octave
    let tone: Vec<f32> = (0..SAMPLE_RATE as usize)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            let w = 2.0 * std::f32::consts::PI * 110.0 * t;
            0.4 * w.sin() + 0.15 * (2.0 * w).sin()
        })
        .collect();
    let manager = SessionManager::new(
        Arc::new(FixtureInputProvider::new(tone, SAMPLE_RATE)),
        Arc::new(NullOutputProvider::new()),
        AppConfig::default(),
    );
    let tuner = manager.subscribe_tuner();

    manager.start_monitoring().unwrap();
    assert!(wait_for(|| tuner.borrow().is_locked));
    {
        let reading = tuner.borrow();
        assert_eq!(reading.note, "A");
        assert_eq!(reading.octave, Some(2));
    }

    manager.stop_monitoring();
    assert_eq!(*tuner.borrow(), TunerResult::default());
}

#[test]
fn test_session_replaces_monitoring_capture() {
    let dir = tempfile::tempdir().unwrap();
    let input = FixtureInputProvider::new(vec![0.0; 8192], SAMPLE_RATE);
    let manager = SessionManager::new(
        Arc::new(input.clone()),
        Arc::new(NullOutputProvider::new()),
        AppConfig::default(),
    )
    .with_recording_dir(dir.path());

    manager.start_monitoring().unwrap();
    manager.start_session(&PracticeSettings::default()).unwrap();
    assert_eq!(input.open_count(), 2);
    assert!(manager.capture().recording_path().is_some());

    manager.stop_session().unwrap();
    assert!(matches!(manager.stop_session(), Err(AudioError::NotRunning)));
    assert!(!manager.capture().is_running());
}
