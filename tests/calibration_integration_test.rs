//! Integration tests for tap-along latency calibration
//!
//! A helper thread plays the part of the user: it listens for click events
//! and taps a fixed delay after each one.

use std::sync::Arc;
use std::thread;

use guitar_trainer::calibration::{CalibrationEvent, CalibrationPhase};
use guitar_trainer::config::CalibrationConfig;
use guitar_trainer::engine::{FixtureInputProvider, NullOutputProvider};
use guitar_trainer::{AppConfig, CalibrationError, PracticeSettings, SessionManager};

fn manager() -> Arc<SessionManager> {
    let config = AppConfig {
        calibration: CalibrationConfig {
            click_interval_ms: 120,
            lead_in_ms: 50,
            trailing_pause_ms: 150,
            ..CalibrationConfig::default()
        },
        ..AppConfig::default()
    };
    Arc::new(SessionManager::new(
        Arc::new(FixtureInputProvider::new(vec![0.0; 4096], 44_100)),
        Arc::new(NullOutputProvider::new()),
        config,
    ))
}

/// Tap `lag_ms` after every click, skipping clicks where `skip(index)`
fn spawn_tapper(
    manager: &Arc<SessionManager>,
    lag_ms: i64,
    skip: fn(usize) -> bool,
) -> thread::JoinHandle<usize> {
    let mut events = manager.calibrator().subscribe();
    let manager = Arc::clone(manager);
    thread::spawn(move || {
        let mut taps = 0;
        while let Ok(event) = events.blocking_recv() {
            match event {
                CalibrationEvent::Click {
                    index,
                    emitted_at_epoch_ms,
                } if !skip(index) => {
                    manager
                        .calibrator()
                        .record_tap_at(emitted_at_epoch_ms + lag_ms)
                        .unwrap();
                    taps += 1;
                }
                CalibrationEvent::Completed { .. } | CalibrationEvent::Failed { .. } => break,
                _ => {}
            }
        }
        taps
    })
}

#[test]
fn test_calibration_measures_tap_lag() {
    let manager = manager();
    let tapper = spawn_tapper(&manager, 42, |_| false);

    assert_eq!(manager.calibrate(), Ok(42));
    assert_eq!(tapper.join().unwrap(), 8);
    assert_eq!(manager.latency_offset(), 42);
    assert_eq!(manager.settings().latency_offset_ms, 42);
    assert_eq!(manager.calibrator().phase(), CalibrationPhase::Idle);
}

#[test]
fn test_too_few_taps_keep_previous_offset() {
    let manager = manager();
    manager.set_latency_offset(75);
    let tapper = spawn_tapper(&manager, 30, |index| index >= 2);

    assert!(matches!(
        manager.calibrate(),
        Err(CalibrationError::InsufficientSamples {
            required: 3,
            collected: 2
        })
    ));
    assert_eq!(tapper.join().unwrap(), 2);
    assert_eq!(manager.latency_offset(), 75);
}

#[test]
fn test_calibrated_offset_survives_settings_roundtrip() {
    let manager = manager();
    // Lag stays under half the 120 ms click interval so taps match their own click
    let tapper = spawn_tapper(&manager, 50, |_| false);
    assert_eq!(manager.calibrate(), Ok(50));
    tapper.join().unwrap();

    // Hosts persist the offset through PracticeSettings
    let persisted = manager.settings();
    let restored = SessionManager::new(
        Arc::new(FixtureInputProvider::new(vec![0.0; 4096], 44_100)),
        Arc::new(NullOutputProvider::new()),
        AppConfig {
            practice: PracticeSettings {
                latency_offset_ms: persisted.latency_offset_ms,
                ..PracticeSettings::default()
            },
            ..AppConfig::default()
        },
    );
    assert_eq!(restored.latency_offset(), 50);
}
