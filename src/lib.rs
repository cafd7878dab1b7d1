// Guitar Trainer Core - practice audio engine
// Live tuner, drift-free metronome, post-session rhythm scoring and
// tap-along latency calibration

// Module declarations
pub mod analysis;
pub mod audio;
pub mod calibration;
pub mod config;
pub mod engine;
pub mod error;
pub mod managers;

// Re-exports for convenience
pub use config::{AppConfig, PracticeSettings};
pub use error::{AudioError, CalibrationError, ErrorCode};
pub use managers::{SessionManager, SessionReport};

/// Install the fmt subscriber for `tracing` and bridged `log` records
///
/// Writes to stderr so stdout stays free for JSON reports. Safe to call more
/// than once; later calls are no-ops.
pub fn init_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
