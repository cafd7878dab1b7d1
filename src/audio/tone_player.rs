//! Reference tone playback
//!
//! Plays a synthesized plucked string on the output device and raises a
//! shared [`PlaybackState`] flag while it sounds, so the capture pipeline can
//! ignore its own reference tone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::clock::{join_with_timeout, CancelToken};
use super::synth;
use crate::engine::backend::OutputProvider;
use crate::error::{log_audio_error, AudioError};

const WRITE_CHUNK: usize = 1024;
const DEVICE_READY_TIMEOUT: Duration = Duration::from_secs(3);

/// Read-only view of whether a reference tone is audible
pub trait PlaybackQuery: Send + Sync {
    fn is_playing(&self) -> bool;
}

/// Shared tone-playing flag
#[derive(Debug, Clone, Default)]
pub struct PlaybackState(Arc<AtomicBool>);

impl PlaybackState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_playing(&self, playing: bool) {
        self.0.store(playing, Ordering::Release);
    }
}

impl PlaybackQuery for PlaybackState {
    fn is_playing(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Clears the flag when the playback thread exits by any path
struct PlayingGuard(PlaybackState);

impl PlayingGuard {
    fn raise(state: PlaybackState) -> Self {
        state.set_playing(true);
        Self(state)
    }
}

impl Drop for PlayingGuard {
    fn drop(&mut self) {
        self.0.set_playing(false);
    }
}

pub struct TonePlayer {
    output: Arc<dyn OutputProvider>,
    state: PlaybackState,
    current: Mutex<Option<(CancelToken, JoinHandle<()>)>>,
    join_timeout: Duration,
}

impl TonePlayer {
    pub fn new(output: Arc<dyn OutputProvider>) -> Self {
        Self::with_state(output, PlaybackState::new())
    }

    /// Player raising an existing flag, e.g. one already handed to capture
    pub fn with_state(output: Arc<dyn OutputProvider>, state: PlaybackState) -> Self {
        Self {
            output,
            state,
            current: Mutex::new(None),
            join_timeout: Duration::from_secs(1),
        }
    }

    pub fn playback_state(&self) -> PlaybackState {
        self.state.clone()
    }

    pub fn is_playing(&self) -> bool {
        self.state.is_playing()
    }

    /// Play a plucked tone, interrupting any tone already sounding
    pub fn play(&self, frequency_hz: f32, duration_ms: f32) -> Result<(), AudioError> {
        self.stop();

        let cancel = CancelToken::new();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), AudioError>>();
        let output = Arc::clone(&self.output);
        let state = self.state.clone();
        let thread_cancel = cancel.clone();

        let handle = thread::Builder::new()
            .name("tone-player".to_string())
            .spawn(move || {
                let mut sink = match output.open(44_100) {
                    Ok(sink) => sink,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                let tone = synth::pluck_tone(frequency_hz, duration_ms, sink.sample_rate());
                let _guard = PlayingGuard::raise(state);
                for chunk in tone.chunks(WRITE_CHUNK) {
                    if thread_cancel.is_cancelled() {
                        break;
                    }
                    if let Err(err) = sink.write(chunk, &thread_cancel) {
                        log_audio_error(&err, "TonePlayer");
                        break;
                    }
                }
            })
            .map_err(|e| AudioError::HardwareError {
                details: format!("Failed to spawn tone thread: {}", e),
            })?;

        let ready = ready_rx
            .recv_timeout(DEVICE_READY_TIMEOUT)
            .unwrap_or_else(|_| {
                Err(AudioError::DeviceUnavailable {
                    device: "output".to_string(),
                    reason: "device did not become ready".to_string(),
                })
            });

        if let Err(err) = ready {
            log_audio_error(&err, "TonePlayer::play");
            cancel.cancel();
            join_with_timeout(handle, self.join_timeout, "TonePlayer");
            return Err(err);
        }

        tracing::info!(
            "[TonePlayer] Playing {:.2} Hz for {:.0} ms",
            frequency_hz,
            duration_ms
        );
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        *current = Some((cancel, handle));
        Ok(())
    }

    /// Silence the current tone, if any. Idempotent.
    pub fn stop(&self) {
        let previous = self
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some((cancel, handle)) = previous {
            cancel.cancel();
            join_with_timeout(handle, self.join_timeout, "TonePlayer");
        }
    }
}

impl Drop for TonePlayer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::backend::{NullOutputProvider, OutputSink};
    use std::time::Instant;

    struct NoOutput;

    impl OutputProvider for NoOutput {
        fn open(&self, _sample_rate: u32) -> Result<Box<dyn OutputSink>, AudioError> {
            Err(AudioError::DeviceUnavailable {
                device: "output".to_string(),
                reason: "unplugged".to_string(),
            })
        }
    }

    fn wait_for(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn test_flag_raised_while_playing() {
        let output = NullOutputProvider::new();
        let player = TonePlayer::new(Arc::new(output.clone()));
        let state = player.playback_state();

        player.play(110.0, 300.0).unwrap();
        assert!(wait_for(|| state.is_playing(), Duration::from_millis(500)));
        assert!(wait_for(|| !state.is_playing(), Duration::from_secs(2)));
        assert_eq!(output.samples_written(), synth::sample_count(300.0, 44_100));
    }

    #[test]
    fn test_stop_interrupts_and_clears_flag() {
        let player = TonePlayer::new(Arc::new(NullOutputProvider::new()));
        player.play(220.0, 5000.0).unwrap();
        assert!(wait_for(|| player.is_playing(), Duration::from_millis(500)));

        player.stop();
        assert!(!player.is_playing());
        player.stop();
    }

    #[test]
    fn test_shared_state_is_visible_to_queries() {
        let state = PlaybackState::new();
        let query: Arc<dyn PlaybackQuery> = Arc::new(state.clone());
        assert!(!query.is_playing());
        state.set_playing(true);
        assert!(query.is_playing());
    }

    #[test]
    fn test_missing_device_is_reported() {
        let player = TonePlayer::new(Arc::new(NoOutput));
        assert!(matches!(
            player.play(440.0, 100.0),
            Err(AudioError::DeviceUnavailable { .. })
        ));
        assert!(!player.is_playing());
    }
}
