// Managers Module
//
// SessionManager owns the single CaptureEngine and MetronomeScheduler of a
// practice session and sequences them around recording and analysis.

pub mod session_manager;

pub use session_manager::{clicks_relative_to, SessionManager, SessionReport};
