// Audio module - device-facing components and signal generation
//
// - capture: microphone → live tuner/amplitude, optional WAV recording
// - metronome: drift-free beat scheduling with click rendering
// - tone_player: plucked reference tones
// - synth: pure tone/click generators
// - wav: 16-bit PCM recording and loading
// - clock: cancellable waits and bounded thread joins

pub mod capture;
pub mod clock;
pub mod metronome;
pub mod synth;
pub mod tone_player;
pub mod wav;

pub use capture::{amplitude_level, compute_rms, CaptureEngine, FramePipeline, TunerResult};
pub use clock::{epoch_ms, CancelToken};
pub use metronome::{
    BeatEvent, BeatPattern, BeatType, MetronomeScheduler, TimeSignature, MAX_BPM, MIN_BPM,
};
pub use tone_player::{PlaybackQuery, PlaybackState, TonePlayer};
pub use wav::{load_samples, RecordingWriter};
