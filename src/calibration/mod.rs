// Calibration module - tap-along output latency measurement
//
// LatencyCalibrator plays a click train, collects taps, and publishes the
// median tap lag as the latency offset used by rhythm analysis.

pub mod latency;

pub use latency::{
    compute_latency_offset, match_taps, median_ms, CalibrationEvent, CalibrationPhase,
    CalibrationSample, LatencyCalibrator,
};
