//! Engine module housing the device layer.
//!
//! Trait-based backends (`backend`) let the capture, metronome and tone
//! components run against real `cpal` devices or deterministic stubs.

pub mod backend;

pub use backend::{
    CpalBackend, FailingInputProvider, FixtureInputProvider, InputProvider, InputRequest,
    InputSource, NullOutputProvider, OutputProvider, OutputSink, SystemTimeSource, TimeSource,
};
