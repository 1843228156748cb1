//! One-shot broadcast signal.
//!
//! A `Signal` fires at most once. Every waiter, past or future, observes the
//! fired state without consuming it, so waiting on an already-fired signal
//! returns immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// A one-shot signal observed by any number of waiters.
#[derive(Debug, Default)]
pub struct Signal {
    fired: AtomicBool,
    gate: Mutex<()>,
    cond: Condvar,
}

impl Signal {
    /// Create an unfired signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal, waking every waiter.
    ///
    /// Returns `true` only for the caller that actually fired it.
    pub fn fire(&self) -> bool {
        // The flag flips under the gate so a waiter between its check and
        // `Condvar::wait` cannot miss the notification.
        let _gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.cond.notify_all();
        true
    }

    /// Whether the signal has fired.
    pub fn is_set(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Block until the signal fires.
    pub fn wait(&self) {
        if self.is_set() {
            return;
        }
        let mut gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        while !self.is_set() {
            gate = self
                .cond
                .wait(gate)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until the signal fires or `timeout` elapses.
    ///
    /// Returns whether the signal fired. A timeout too large to represent
    /// as a deadline waits without bound.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_set() {
            return true;
        }
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.wait();
            return true;
        };
        let mut gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        while !self.is_set() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _) = self
                .cond
                .wait_timeout(gate, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            gate = next;
        }
        true
    }
}
