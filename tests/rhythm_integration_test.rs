//! Integration tests for offline rhythm scoring
//!
//! Synthetic takes are written to disk with hound and scored through the
//! public `RhythmAnalyzer` API, the same path a finished session takes.

use std::path::Path;

use guitar_trainer::analysis::{NoteType, RhythmAnalyzer, RhythmParams};
use guitar_trainer::audio::RecordingWriter;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const SAMPLE_RATE: u32 = 44_100;

/// Decaying noise bursts (pick attacks) at the given times
fn strummed_take(duration_s: f64, attacks_s: &[f64]) -> Vec<f32> {
    let total = (duration_s * SAMPLE_RATE as f64) as usize;
    let mut signal = vec![0.0f32; total];
    let mut rng = StdRng::seed_from_u64(42);
    let decay = SAMPLE_RATE as f32 * 0.01;

    for &attack in attacks_s {
        let start = (attack * SAMPLE_RATE as f64) as usize;
        for offset in 0..(SAMPLE_RATE as usize / 25) {
            if start + offset < total {
                let envelope = (-(offset as f32) / decay).exp();
                signal[start + offset] = rng.gen_range(-0.8..0.8) * envelope;
            }
        }
    }
    signal
}

fn write_take(path: &Path, samples: &[f32]) {
    let mut writer = RecordingWriter::create(path, SAMPLE_RATE).unwrap();
    writer.write(samples).unwrap();
    writer.finalize().unwrap();
}

fn params(bpm: u32) -> RhythmParams {
    RhythmParams {
        target_bpm: bpm,
        ..RhythmParams::default()
    }
}

#[test]
fn test_on_beat_take_scores_full_consistency() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("on_beat.wav");
    let attacks: Vec<f64> = (1..=8).map(|k| 0.5 * k as f64).collect();
    write_take(&path, &strummed_take(4.6, &attacks));

    let result = RhythmAnalyzer::default().analyze_file(&path, &params(120));

    assert_eq!(result.bpm, 120);
    assert_eq!(result.hits.len(), 8, "hits: {:?}", result.hits);
    assert_eq!(result.hits_on_beat, 8);
    assert_eq!(result.consistency, 100);
    assert!(result
        .hits
        .iter()
        .all(|hit| hit.note_type == NoteType::Perfect));
    assert!((result.session_duration_seconds - 4.6).abs() < 0.01);
}

#[test]
fn test_late_take_is_corrected_by_latency_offset() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("late.wav");
    // Every attack lands 60 ms late
    let attacks: Vec<f64> = (1..=6).map(|k| 0.5 * k as f64 + 0.06).collect();
    write_take(&path, &strummed_take(3.6, &attacks));

    let analyzer = RhythmAnalyzer::default();
    let uncorrected = analyzer.analyze_file(&path, &params(120));
    assert!(uncorrected.hits_on_beat < 6);

    let corrected = analyzer.analyze_file(
        &path,
        &RhythmParams {
            latency_offset_ms: 60,
            ..params(120)
        },
    );
    assert_eq!(corrected.hits_on_beat, 6);
    assert_eq!(corrected.consistency, 100);
}

#[test]
fn test_free_play_reports_every_attack() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("free.wav");
    write_take(&path, &strummed_take(2.0, &[0.3, 0.9, 1.4]));

    let result = RhythmAnalyzer::default().analyze_file(&path, &params(0));
    assert_eq!(result.bpm, 0);
    assert_eq!(result.consistency, 0);
    assert_eq!(result.hits.len(), 3);
    assert!(result.hits.iter().all(|hit| hit.note_type == NoteType::Good));
}

#[test]
fn test_silent_and_missing_recordings_score_zero() {
    let dir = tempfile::tempdir().unwrap();
    let silent = dir.path().join("silent.wav");
    write_take(&silent, &vec![0.0; SAMPLE_RATE as usize]);

    let analyzer = RhythmAnalyzer::default();
    let result = analyzer.analyze_file(&silent, &params(120));
    assert_eq!(result.bpm, 0);
    assert_eq!(result.consistency, 0);
    assert!(result.hits.is_empty());

    let missing = analyzer.analyze_file(&dir.path().join("missing.wav"), &params(120));
    assert_eq!(missing.bpm, 0);
    assert!(missing.hits.is_empty());

    // Header plus a handful of samples: below the minimum file size
    let tiny = dir.path().join("tiny.wav");
    write_take(&tiny, &[0.5; 16]);
    assert!(analyzer.analyze_file(&tiny, &params(120)).hits.is_empty());
}
