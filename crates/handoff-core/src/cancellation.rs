//! In-process cancellation primitive.
//!
//! The coordination protocol's blocking calls (`Coordinator::listen`, `Coordinator::connect`,
//! `UpgradeSession::get_files`) each take a `&Cancellation` instead of an
//! async-runtime context: a flag plus a condvar is enough to make a blocking
//! `flock` retry loop or socket read interruptible from another thread, and
//! it keeps the crate off an async runtime entirely.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Clone, Default)]
pub struct Cancellation(Arc<Inner>);

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    /// A `Cancellation` that never fires; used when bootstrap callers don't
    /// need to bound how long they wait for the coordination lock.
    pub fn never() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
        let _guard = self.0.mutex.lock().unwrap();
        self.0.condvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    /// Sleep for at most `dur`, waking early if cancelled. Used by the
    /// directory-lock poll/backoff loop so a contended `flock` can still be
    /// interrupted promptly.
    pub fn wait_timeout(&self, dur: Duration) {
        if self.is_cancelled() {
            return;
        }
        let guard = self.0.mutex.lock().unwrap();
        let (_guard, _timeout) = self
            .0
            .condvar
            .wait_timeout_while(guard, dur, |_| !self.0.cancelled.load(Ordering::SeqCst))
            .unwrap();
    }

    /// Run `poll` repeatedly with exponential-ish backoff (capped at
    /// `max_backoff`) until it returns `Some`, `deadline` elapses, or this
    /// token is cancelled. Returns `None` on cancellation or timeout.
    pub fn poll_until<T>(
        &self,
        deadline: Option<Instant>,
        max_backoff: Duration,
        mut poll: impl FnMut() -> Option<T>,
    ) -> PollOutcome<T> {
        let mut backoff = Duration::from_millis(1);
        loop {
            if let Some(value) = poll() {
                return PollOutcome::Ready(value);
            }
            if self.is_cancelled() {
                return PollOutcome::Cancelled;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return PollOutcome::TimedOut;
                }
            }
            self.wait_timeout(backoff);
            backoff = (backoff * 2).min(max_backoff);
        }
    }
}

pub enum PollOutcome<T> {
    Ready(T),
    Cancelled,
    TimedOut,
}
