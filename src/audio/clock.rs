// Clock helpers shared by the capture, metronome and calibration threads
//
// CancelToken is the one primitive every blocking wait in the crate goes
// through, so a single `cancel()` wakes the timing loop, the dispatcher and
// the render thread at once.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Wall-clock milliseconds since the Unix epoch
pub fn epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Condvar-backed cancellation flag
///
/// Clones share the same flag. Once cancelled a token stays cancelled; create
/// a fresh token for the next run.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (lock, cvar) = &*self.inner;
        let mut cancelled = lock.lock().unwrap_or_else(|e| e.into_inner());
        *cancelled = true;
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        let (lock, _) = &*self.inner;
        *lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Block until `deadline` or cancellation
    ///
    /// Returns `true` when the token was cancelled, `false` when the deadline
    /// was reached.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let (lock, cvar) = &*self.inner;
        let mut cancelled = lock.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if *cancelled {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = cvar
                .wait_timeout(cancelled, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            cancelled = guard;
        }
    }

    /// Block for `duration` or until cancellation; `true` when cancelled
    pub fn wait_for(&self, duration: Duration) -> bool {
        self.wait_until(Instant::now() + duration)
    }
}

/// Join a worker thread, giving up after `timeout`
///
/// `JoinHandle::join` has no timeout, so this polls `is_finished()`. A thread
/// that overstays is detached and logged. Returns whether the thread joined.
pub fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration, component: &str) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            tracing::warn!(
                "[{}] Worker did not stop within {:?}; detaching",
                component,
                timeout
            );
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }

    if handle.join().is_err() {
        tracing::error!("[{}] Worker thread panicked", component);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_wait_reaches_deadline() {
        let token = CancelToken::new();
        let start = Instant::now();
        assert!(!token.wait_for(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_cancel_wakes_waiter() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = thread::spawn(move || waiter.wait_for(Duration::from_secs(10)));

        thread::sleep(Duration::from_millis(20));
        token.cancel();

        assert!(handle.join().unwrap());
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_join_with_timeout() {
        let quick = thread::spawn(|| {});
        assert!(join_with_timeout(quick, Duration::from_secs(1), "test"));

        let token = CancelToken::new();
        let waiter = token.clone();
        let slow = thread::spawn(move || {
            waiter.wait_for(Duration::from_secs(5));
        });
        assert!(!join_with_timeout(slow, Duration::from_millis(30), "test"));
        token.cancel();
    }

    #[test]
    fn test_epoch_ms_is_recent() {
        // 2020-01-01 in epoch milliseconds
        assert!(epoch_ms() > 1_577_836_800_000);
    }
}
