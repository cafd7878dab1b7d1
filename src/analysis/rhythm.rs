//! Rhythm analysis - post-session onset scoring against the metronome grid
//!
//! Pipeline for one recorded take:
//! 1. Spectral-flux onsets, shifted earlier by the calibrated latency
//! 2. Adaptive salience gate relative to the take's mean salience
//! 3. Metronome bleed separation using the recorded click times
//! 4. Duplicate clustering (one onset per plucked note)
//! 5. Classification against the nearest sixteenth of the target tempo
//!
//! Degenerate takes (missing file, tiny file, nothing detected) produce a
//! zero-valued [`AnalysisResult`] rather than an error.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::analysis::onset::{Onset, OnsetDetector};
use crate::audio::wav;
use crate::config::OnsetDetectionConfig;

/// Onsets quieter than this are discarded outright
const MIN_SALIENCE: f64 = 0.005;

/// Perfect window half-width in milliseconds
const PERFECT_WINDOW_MS: f64 = 35.0;
/// Good window grows by this many milliseconds per unit of margin
const MARGIN_SCALE_MS: f64 = 80.0;
/// Miss window as a fraction of the sixteenth-note duration
const MISS_FRACTION: f64 = 0.9;

/// Click separation thresholds (seconds and salience ratios)
const BASELINE_WINDOW_S: f64 = 0.040;
const NEAR_CLICK_S: f64 = 0.050;
const FAR_FROM_CLICK_S: f64 = 0.120;
const NEAR_CLICK_BASELINE_RATIO: f64 = 1.1;
const NEAR_CLICK_MAX_RATIO: f64 = 0.25;
const MID_BASELINE_RATIO: f64 = 0.9;
const FALLBACK_BASELINE_RATIO: f64 = 0.2;
const MIN_BASELINE_SAMPLES: usize = 3;

/// Cluster window bounds in milliseconds
const CLUSTER_MIN_MS: f64 = 50.0;
const CLUSTER_MAX_MS: f64 = 130.0;
const FREE_PLAY_CLUSTER_MS: f64 = 80.0;

/// Timing grade of one hit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoteType {
    Perfect,
    Good,
    Miss,
    Ghost,
}

/// One scored onset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RhythmHit {
    pub time_seconds: f64,
    pub target_time_seconds: f64,
    /// Nearest whole beat, counted from 0 at the start of the take
    pub beat_number: i64,
    /// Positive when late
    pub deviation_ms: f64,
    pub note_type: NoteType,
    pub is_ghost_note: bool,
}

/// Summary of one take
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub bpm: u32,
    /// 0-100
    pub consistency: u32,
    pub hits: Vec<RhythmHit>,
    /// Hits that count towards scoring (everything but ghosts)
    pub total_beats: usize,
    /// Perfect plus Good hits
    pub hits_on_beat: usize,
    pub session_duration_seconds: f64,
}

impl AnalysisResult {
    /// Result for a take with nothing to score
    pub fn zero(session_duration_seconds: f64) -> Self {
        Self {
            bpm: 0,
            consistency: 0,
            hits: Vec::new(),
            total_beats: 0,
            hits_on_beat: 0,
            session_duration_seconds,
        }
    }
}

/// Per-take analysis inputs supplied by the session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RhythmParams {
    /// 0 selects free play
    pub target_bpm: u32,
    /// 0.0-0.5; widens the Good window
    pub rhythm_margin: f64,
    pub latency_offset_ms: u32,
    /// Audible metronome clicks, seconds from the start of the take
    pub click_times_seconds: Vec<f64>,
}

/// Offline rhythm analyzer for recorded takes
pub struct RhythmAnalyzer {
    config: OnsetDetectionConfig,
}

impl Default for RhythmAnalyzer {
    fn default() -> Self {
        Self::new(OnsetDetectionConfig::default())
    }
}

impl RhythmAnalyzer {
    pub fn new(config: OnsetDetectionConfig) -> Self {
        Self { config }
    }

    /// Analyze a WAV recording
    ///
    /// Never fails: unreadable or tiny files produce a zero result.
    pub fn analyze_file(&self, path: &Path, params: &RhythmParams) -> AnalysisResult {
        let size = match std::fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(err) => {
                tracing::warn!("[RhythmAnalyzer] Recording {:?} unavailable: {}", path, err);
                return AnalysisResult::zero(0.0);
            }
        };

        if size < self.config.min_file_bytes {
            tracing::info!(
                "[RhythmAnalyzer] Recording {:?} too small ({} bytes); nothing to analyze",
                path,
                size
            );
            return AnalysisResult::zero(0.0);
        }

        let (samples, spec) = match wav::load_samples(path) {
            Ok(loaded) => loaded,
            Err(err) => {
                tracing::warn!("[RhythmAnalyzer] {}", err);
                return AnalysisResult::zero(0.0);
            }
        };

        let duration = samples.len() as f64 / spec.sample_rate.max(1) as f64;
        self.analyze_samples(&samples, spec.sample_rate, duration, params)
    }

    /// Analyze in-memory mono samples
    pub fn analyze_samples(
        &self,
        samples: &[f32],
        sample_rate: u32,
        session_duration_seconds: f64,
        params: &RhythmParams,
    ) -> AnalysisResult {
        let detector = OnsetDetector::with_config(sample_rate, &self.config);
        let onsets = detector.detect(samples);
        tracing::debug!(
            "[RhythmAnalyzer] {} raw onsets in {:.2}s",
            onsets.len(),
            session_duration_seconds
        );
        analyze_onsets(onsets, session_duration_seconds, params)
    }
}

/// Score detected onsets (steps 1-6 after detection)
pub fn analyze_onsets(
    onsets: Vec<Onset>,
    session_duration_seconds: f64,
    params: &RhythmParams,
) -> AnalysisResult {
    let offset_s = params.latency_offset_ms as f64 / 1000.0;
    let corrected: Vec<Onset> = onsets
        .into_iter()
        .map(|o| Onset {
            time_seconds: (o.time_seconds - offset_s).max(0.0),
            salience: o.salience,
        })
        .filter(|o| o.salience >= MIN_SALIENCE)
        .collect();

    let gated = apply_adaptive_gate(corrected);
    let separated = if params.click_times_seconds.is_empty() {
        gated
    } else {
        separate_metronome_bleed(gated, &params.click_times_seconds)
    };

    let window_ms = cluster_window_ms(params.target_bpm);
    let clustered = cluster_onsets(separated, window_ms);

    if clustered.is_empty() {
        return AnalysisResult::zero(session_duration_seconds);
    }

    if params.target_bpm == 0 {
        return free_play_result(&clustered, session_duration_seconds);
    }

    score_against_grid(&clustered, params, session_duration_seconds)
}

/// Keep onsets at or above max(0.5 × mean salience, 0.005)
fn apply_adaptive_gate(onsets: Vec<Onset>) -> Vec<Onset> {
    if onsets.is_empty() {
        return onsets;
    }
    let mean = onsets.iter().map(|o| o.salience).sum::<f64>() / onsets.len() as f64;
    let gate = (0.5 * mean).max(MIN_SALIENCE);
    onsets.into_iter().filter(|o| o.salience >= gate).collect()
}

fn nearest_distance(time: f64, sorted_clicks: &[f64]) -> f64 {
    let idx = sorted_clicks.partition_point(|&c| c < time);
    let after = sorted_clicks.get(idx).map(|c| c - time);
    let before = idx.checked_sub(1).map(|i| time - sorted_clicks[i]);
    match (before, after) {
        (Some(b), Some(a)) => b.min(a),
        (Some(b), None) => b,
        (None, Some(a)) => a,
        (None, None) => f64::INFINITY,
    }
}

fn median(values: &mut [f64]) -> f64 {
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

/// Drop onsets that are most likely the metronome click bleeding into the mic
pub fn separate_metronome_bleed(onsets: Vec<Onset>, click_times_seconds: &[f64]) -> Vec<Onset> {
    if onsets.is_empty() || click_times_seconds.is_empty() {
        return onsets;
    }

    let mut clicks = click_times_seconds.to_vec();
    clicks.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let max_salience = onsets.iter().map(|o| o.salience).fold(0.0, f64::max);

    // Salience of onsets that sit alone next to a click: the click loudness
    let mut isolated: Vec<f64> = clicks
        .iter()
        .filter_map(|&click| {
            let mut near = onsets
                .iter()
                .filter(|o| (o.time_seconds - click).abs() <= BASELINE_WINDOW_S);
            match (near.next(), near.next()) {
                (Some(only), None) => Some(only.salience),
                _ => None,
            }
        })
        .collect();

    let baseline = if isolated.len() >= MIN_BASELINE_SAMPLES {
        median(&mut isolated)
    } else {
        FALLBACK_BASELINE_RATIO * max_salience
    };

    tracing::debug!(
        "[RhythmAnalyzer] Click baseline {:.4} from {} isolated onsets",
        baseline,
        isolated.len()
    );

    onsets
        .into_iter()
        .filter(|o| {
            let d = nearest_distance(o.time_seconds, &clicks);
            if d > FAR_FROM_CLICK_S {
                true
            } else if d < NEAR_CLICK_S {
                o.salience > NEAR_CLICK_BASELINE_RATIO * baseline
                    || o.salience > NEAR_CLICK_MAX_RATIO * max_salience
            } else {
                o.salience > MID_BASELINE_RATIO * baseline
            }
        })
        .collect()
}

/// Cluster window for a tempo: 0.8 × sixteenth clamped to [50, 130] ms
pub fn cluster_window_ms(target_bpm: u32) -> f64 {
    if target_bpm == 0 {
        return FREE_PLAY_CLUSTER_MS;
    }
    let sixteenth_ms = 60_000.0 / target_bpm as f64 / 4.0;
    (0.8 * sixteenth_ms).clamp(CLUSTER_MIN_MS, CLUSTER_MAX_MS)
}

/// Collapse onsets closer than `window_ms` to the first onset of their
/// cluster, keeping the loudest of each cluster
pub fn cluster_onsets(mut onsets: Vec<Onset>, window_ms: f64) -> Vec<Onset> {
    onsets.sort_by(|a, b| {
        a.time_seconds
            .partial_cmp(&b.time_seconds)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let window_s = window_ms / 1000.0;
    let mut clustered: Vec<Onset> = Vec::new();
    let mut cluster_start = f64::NEG_INFINITY;

    for onset in onsets {
        match clustered.last_mut() {
            Some(loudest) if onset.time_seconds - cluster_start < window_s => {
                if onset.salience > loudest.salience {
                    *loudest = onset;
                }
            }
            _ => {
                cluster_start = onset.time_seconds;
                clustered.push(onset);
            }
        }
    }

    clustered
}

/// Grade a signed deviation
pub fn classify_deviation(deviation_ms: f64, rhythm_margin: f64, sixteenth_ms: f64) -> NoteType {
    let magnitude = deviation_ms.abs();
    if magnitude <= PERFECT_WINDOW_MS {
        NoteType::Perfect
    } else if magnitude <= PERFECT_WINDOW_MS + MARGIN_SCALE_MS * rhythm_margin {
        NoteType::Good
    } else if magnitude <= MISS_FRACTION * sixteenth_ms {
        NoteType::Miss
    } else {
        NoteType::Ghost
    }
}

const SUBDIVISIONS: [f64; 7] = [0.0, 0.25, -0.25, 0.5, -0.5, 0.75, -0.75];

fn score_against_grid(
    onsets: &[Onset],
    params: &RhythmParams,
    session_duration_seconds: f64,
) -> AnalysisResult {
    let quarter_s = 60.0 / params.target_bpm as f64;
    let sixteenth_ms = quarter_s * 1000.0 / 4.0;

    let hits: Vec<RhythmHit> = onsets
        .iter()
        .map(|onset| {
            let t = onset.time_seconds;
            let beat = (t / quarter_s).round();
            let target = SUBDIVISIONS
                .iter()
                .map(|sub| (beat + sub) * quarter_s)
                .fold(f64::NAN, |best, candidate| {
                    if best.is_nan() || (t - candidate).abs() < (t - best).abs() {
                        candidate
                    } else {
                        best
                    }
                });

            let deviation_ms = (t - target) * 1000.0;
            let note_type = classify_deviation(deviation_ms, params.rhythm_margin, sixteenth_ms);
            RhythmHit {
                time_seconds: t,
                target_time_seconds: target,
                beat_number: beat as i64,
                deviation_ms,
                note_type,
                is_ghost_note: note_type == NoteType::Ghost,
            }
        })
        .collect();

    let tally = tally_hits(&hits);

    tracing::info!(
        "[RhythmAnalyzer] {} BPM: {} hits, {} on beat, consistency {}",
        params.target_bpm,
        tally.total_beats,
        tally.hits_on_beat,
        tally.consistency
    );

    AnalysisResult {
        bpm: params.target_bpm,
        consistency: tally.consistency,
        hits,
        total_beats: tally.total_beats,
        hits_on_beat: tally.hits_on_beat,
        session_duration_seconds,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HitTally {
    consistency: u32,
    total_beats: usize,
    hits_on_beat: usize,
}

/// Ghost hits are noise and stay out of every denominator
fn tally_hits(hits: &[RhythmHit]) -> HitTally {
    let count = |kind: NoteType| hits.iter().filter(|h| h.note_type == kind).count();
    let perfect = count(NoteType::Perfect);
    let good = count(NoteType::Good);
    let meaningful = hits.len() - count(NoteType::Ghost);

    let consistency = if meaningful == 0 {
        0
    } else {
        let pct = |n: usize| (100.0 * n as f64 / meaningful as f64).round() as u32;
        // Two rounded halves can reach 101
        (pct(perfect) + pct(good)).min(100)
    };

    HitTally {
        consistency,
        total_beats: meaningful,
        hits_on_beat: perfect + good,
    }
}

fn free_play_result(onsets: &[Onset], session_duration_seconds: f64) -> AnalysisResult {
    let hits: Vec<RhythmHit> = onsets
        .iter()
        .enumerate()
        .map(|(index, onset)| RhythmHit {
            time_seconds: onset.time_seconds,
            target_time_seconds: onset.time_seconds,
            beat_number: index as i64,
            deviation_ms: 0.0,
            note_type: NoteType::Good,
            is_ghost_note: false,
        })
        .collect();

    AnalysisResult {
        bpm: 0,
        consistency: 0,
        total_beats: hits.len(),
        hits_on_beat: 0,
        hits,
        session_duration_seconds,
    }
}
