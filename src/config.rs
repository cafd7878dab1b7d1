//! Configuration management for practice sessions
//!
//! This module provides runtime configuration loading from JSON files.
//! `PracticeSettings` is the surface host collaborators fill in (thresholds,
//! margins, offsets, tempo); the remaining sections tune the capture,
//! onset detection, metronome and calibration internals.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::audio::metronome::{BeatPattern, BeatType, TimeSignature, MAX_BPM, MIN_BPM};

/// Complete application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub practice: PracticeSettings,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub onset_detection: OnsetDetectionConfig,
    #[serde(default)]
    pub metronome: MetronomeConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
}

/// Settings supplied by the host application for one practice session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PracticeSettings {
    /// RMS gate below which the tuner reports silence
    pub input_threshold: f32,
    /// Loosens the Good window: 35 ms + 80 ms × margin
    pub rhythm_margin: f64,
    /// Calibrated round-trip latency subtracted from detected onsets
    pub latency_offset_ms: u32,
    /// Delay applied to beat events to line haptics up with the audible click
    pub metronome_offset_ms: u32,
    /// Tuning reference for A4
    pub reference_frequency_hz: f32,
    pub bpm: u32,
    /// "numerator/denominator", denominator 4 or 8
    pub time_signature: String,
    /// Empty means "accent on one, normal elsewhere"
    #[serde(default)]
    pub beat_pattern: Vec<BeatType>,
}

impl Default for PracticeSettings {
    fn default() -> Self {
        Self {
            input_threshold: 0.01,
            rhythm_margin: 0.0,
            latency_offset_ms: 0,
            metronome_offset_ms: 0,
            reference_frequency_hz: 440.0,
            bpm: 120,
            time_signature: "4/4".to_string(),
            beat_pattern: Vec::new(),
        }
    }
}

impl PracticeSettings {
    pub const LATENCY_OFFSET_MAX_MS: u32 = 300;
    pub const METRONOME_OFFSET_MAX_MS: u32 = 400;
    pub const RHYTHM_MARGIN_MAX: f64 = 0.5;

    /// Clamp every field into its documented range
    pub fn sanitized(&self) -> Self {
        let reference = if self.reference_frequency_hz.is_finite() && self.reference_frequency_hz > 0.0
        {
            self.reference_frequency_hz
        } else {
            440.0
        };

        Self {
            input_threshold: self.input_threshold.max(0.0),
            rhythm_margin: self.rhythm_margin.clamp(0.0, Self::RHYTHM_MARGIN_MAX),
            latency_offset_ms: self.latency_offset_ms.min(Self::LATENCY_OFFSET_MAX_MS),
            metronome_offset_ms: self.metronome_offset_ms.min(Self::METRONOME_OFFSET_MAX_MS),
            reference_frequency_hz: reference,
            // 0 stays 0: free play
            bpm: if self.bpm == 0 {
                0
            } else {
                self.bpm.clamp(MIN_BPM, MAX_BPM)
            },
            time_signature: self.time_signature.clone(),
            beat_pattern: self.beat_pattern.clone(),
        }
    }

    /// Parsed time signature, falling back to 4/4 when malformed
    pub fn parsed_time_signature(&self) -> TimeSignature {
        self.time_signature.parse().unwrap_or_else(|err| {
            log::warn!(
                "[Config] Invalid time signature {:?}: {}. Using 4/4.",
                self.time_signature,
                err
            );
            TimeSignature::default()
        })
    }

    /// Beat pattern matching the time signature numerator
    ///
    /// A configured pattern of the wrong length is replaced by the default
    /// accent-on-one pattern.
    pub fn resolved_pattern(&self) -> BeatPattern {
        let signature = self.parsed_time_signature();
        let pattern = BeatPattern::new(self.beat_pattern.clone());
        if pattern.len() == signature.numerator as usize {
            pattern
        } else {
            BeatPattern::for_signature(&signature)
        }
    }
}

/// Streaming pitch/amplitude pipeline parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    /// Analysis frame size in samples
    pub frame_size: usize,
    /// Samples advanced per frame (frame_size - overlap)
    pub hop_size: usize,
    /// Pitch estimates at or below this probability are ignored
    pub confidence_threshold: f32,
    /// Lowest frequency accepted as a pitch
    pub min_frequency_hz: f32,
    /// Rolling median window for frequency and cents
    pub smoothing_window: usize,
    /// YIN absolute threshold on the normalized difference function
    pub yin_threshold: f32,
    /// Bounded wait when joining the processing thread
    pub join_timeout_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            frame_size: 4096,
            hop_size: 2048,
            confidence_threshold: 0.85,
            min_frequency_hz: 20.0,
            smoothing_window: 3,
            yin_threshold: 0.20,
            join_timeout_ms: 1000,
        }
    }
}

/// Onset detection algorithm parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnsetDetectionConfig {
    /// Peak threshold on the normalized spectral flux, clamped to [0.005, 0.4]
    pub threshold: f64,
    /// FFT window size in samples
    pub window_size: usize,
    /// Hop size for overlapping windows
    pub hop_size: usize,
    /// Recordings smaller than this are treated as empty takes
    pub min_file_bytes: u64,
}

impl OnsetDetectionConfig {
    pub const THRESHOLD_MIN: f64 = 0.005;
    pub const THRESHOLD_MAX: f64 = 0.4;

    pub fn clamped_threshold(&self) -> f64 {
        self.threshold.clamp(Self::THRESHOLD_MIN, Self::THRESHOLD_MAX)
    }
}

impl Default for OnsetDetectionConfig {
    fn default() -> Self {
        Self {
            threshold: 0.03,
            window_size: 1024,
            hop_size: 512,
            min_file_bytes: 1000,
        }
    }
}

/// Metronome click rendering parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetronomeConfig {
    pub accent_frequency_hz: f32,
    pub normal_frequency_hz: f32,
    pub click_duration_ms: f32,
    /// Samples handed to the output per write while padding silence
    pub render_chunk_size: usize,
    pub join_timeout_ms: u64,
}

impl Default for MetronomeConfig {
    fn default() -> Self {
        Self {
            accent_frequency_hz: 1200.0,
            normal_frequency_hz: 800.0,
            click_duration_ms: 50.0,
            render_chunk_size: 512,
            join_timeout_ms: 1000,
        }
    }
}

/// Tap-latency calibration protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    pub click_count: usize,
    pub click_interval_ms: u64,
    pub lead_in_ms: u64,
    pub trailing_pause_ms: u64,
    pub click_frequency_hz: f32,
    pub click_duration_ms: f32,
    /// Minimum number of matched taps for a valid estimate
    pub min_matches: usize,
    /// Earliest accepted tap relative to its click
    pub min_delta_ms: i64,
    /// Latest accepted tap relative to its click
    pub max_delta_ms: i64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            click_count: 8,
            click_interval_ms: 750,
            lead_in_ms: 1500,
            trailing_pause_ms: 1500,
            click_frequency_hz: 1000.0,
            click_duration_ms: 30.0,
            min_matches: 3,
            min_delta_ms: -200,
            max_delta_ms: 1000,
        }
    }
}

impl AppConfig {
    /// Load configuration from JSON file
    ///
    /// # Arguments
    /// * `path` - Path to JSON config file
    ///
    /// # Returns
    /// The loaded configuration, or defaults if the file is missing or the
    /// JSON is invalid.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Self {
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => {
                    log::info!("[Config] Loaded configuration from {:?}", path.as_ref());
                    config
                }
                Err(err) => {
                    log::warn!(
                        "[Config] Failed to parse JSON from {:?}: {}. Using defaults.",
                        path.as_ref(),
                        err
                    );
                    Self::default()
                }
            },
            Err(err) => {
                log::warn!(
                    "[Config] Failed to read config file {:?}: {}. Using defaults.",
                    path.as_ref(),
                    err
                );
                Self::default()
            }
        }
    }

    /// Load configuration from the default location
    pub fn load() -> Self {
        Self::load_from_file("assets/practice_config.json")
    }
}
