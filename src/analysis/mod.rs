// Analysis module - pitch tracking and post-session rhythm scoring
//
// Architecture:
// - Live path: PitchEstimator → RollingMedian → map_frequency (driven by
//   audio::capture on its own thread)
// - Offline path: OnsetDetector → RhythmAnalyzer → AnalysisResult

pub mod median;
pub mod note;
pub mod onset;
pub mod pitch;
pub mod rhythm;

pub use median::RollingMedian;
pub use note::{map_frequency, NoteReading, DEFAULT_REFERENCE_HZ, NOTE_NAMES};
pub use onset::{Onset, OnsetDetector};
pub use pitch::{PitchEstimate, PitchEstimator};
pub use rhythm::{
    analyze_onsets, classify_deviation, cluster_onsets, AnalysisResult, NoteType, RhythmAnalyzer,
    RhythmHit, RhythmParams,
};
