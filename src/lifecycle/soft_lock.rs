//! Three-phase, one-shot lifecycle lock.
//!
//! `SoftLock` tracks a single watched entity through `Idle -> Started ->
//! Released -> Done`. It guards nothing; it only tells waiters which phase
//! the entity has reached. Each transition fires exactly once no matter how
//! many callers race to trigger it.

use crate::lifecycle::signal::Signal;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Lifecycle phase of a [`SoftLock`]. Phases only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    /// Nothing has happened yet.
    Idle,
    /// The entity appeared.
    Started,
    /// The entity went away; `wait` callers are released.
    Released,
    /// The lifecycle is over.
    Done,
}

/// A one-shot lifecycle lock with broadcast wake-ups.
///
/// Once `Done`, the lock is inert. Create a fresh one per entity.
#[derive(Debug, Default)]
pub struct SoftLock {
    guard: Mutex<()>,
    started: Signal,
    released: Signal,
    done: Signal,
}

impl SoftLock {
    /// Create an `Idle` lock.
    pub fn new() -> Self {
        Self::default()
    }

    fn transition(&self) -> MutexGuard<'_, ()> {
        self.guard.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move `Idle -> Started`.
    ///
    /// Returns `true` for exactly one caller; everyone else gets `false`.
    pub fn start(&self) -> bool {
        let _guard = self.transition();
        self.started.fire()
    }

    /// Whether the lock has reached `Started`.
    pub fn started(&self) -> bool {
        self.started.is_set()
    }

    /// Move `Started -> Released`.
    ///
    /// A no-op while still `Idle`: the release is dropped, not queued.
    pub fn release(&self) {
        let _guard = self.transition();
        if !self.started.is_set() {
            return;
        }
        self.released.fire();
    }

    /// Whether the lock has reached `Released`.
    pub fn released(&self) -> bool {
        self.released.is_set()
    }

    /// Block until released.
    ///
    /// An un-started lock can never be released, so this passes straight
    /// through while `Idle`.
    pub fn wait(&self) {
        if !self.started() {
            return;
        }
        self.released.wait();
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`.
    ///
    /// Returns `true` when released or passed through.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if !self.started() {
            return true;
        }
        self.released.wait_timeout(timeout)
    }

    /// Force the lock to `Done` from any phase.
    ///
    /// `started` and `released` fire first, so observers never see `Done`
    /// without the earlier phases.
    pub fn done(&self) {
        let _guard = self.transition();
        self.started.fire();
        self.released.fire();
        self.done.fire();
    }

    /// Whether the lock has reached `Done`.
    pub fn finished(&self) -> bool {
        self.done.is_set()
    }

    /// Drive the lock through every remaining phase.
    ///
    /// Afterwards `started()`, `released()` and `finished()` are all `true`.
    pub fn close(&self) {
        self.start();
        self.release();
        self.done();
    }

    /// Block until `Done`, whether or not the lock ever started.
    pub fn wait_for_done(&self) {
        self.done.wait();
    }

    /// Like [`wait_for_done`](Self::wait_for_done) with a bound.
    pub fn wait_for_done_timeout(&self, timeout: Duration) -> bool {
        self.done.wait_timeout(timeout)
    }

    /// Block until `Started`.
    pub fn wait_for_start(&self) {
        self.started.wait();
    }

    /// Like [`wait_for_start`](Self::wait_for_start) with a bound.
    pub fn wait_for_start_timeout(&self, timeout: Duration) -> bool {
        self.started.wait_timeout(timeout)
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        if self.finished() {
            Phase::Done
        } else if self.released() {
            Phase::Released
        } else if self.started() {
            Phase::Started
        } else {
            Phase::Idle
        }
    }
}

impl fmt::Display for SoftLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SoftLock(started={}, released={}, finished={})",
            self.started(),
            self.released(),
            self.finished()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::{Arc, Barrier};
    use std::thread;

    const PATIENCE: Duration = Duration::from_secs(5);

    fn assert_terminal(lock: &SoftLock) {
        assert!(lock.started());
        assert!(lock.released());
        assert!(lock.finished());
        assert_eq!(lock.phase(), Phase::Done);
    }

    #[test]
    fn test_start_first_call_wins() {
        let lock = SoftLock::new();
        assert!(lock.start());
        assert!(!lock.start());
        assert!(lock.started());
    }

    #[test]
    fn test_started_before_start() {
        let lock = SoftLock::new();
        assert!(!lock.started());
        assert_eq!(lock.phase(), Phase::Idle);
    }

    #[test]
    fn test_concurrent_start_has_one_winner() {
        let lock = Arc::new(SoftLock::new());
        let barrier = Arc::new(Barrier::new(16));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    lock.start()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
        assert!(lock.started());
    }

    #[test]
    fn test_release_before_start_is_dropped() {
        let lock = SoftLock::new();
        lock.release();
        assert!(!lock.released());

        lock.start();
        assert!(!lock.released());

        lock.release();
        assert!(lock.released());
        assert_eq!(lock.phase(), Phase::Released);
    }

    #[test]
    fn test_release_wakes_waiter() {
        let lock = Arc::new(SoftLock::new());
        lock.start();

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                lock.wait();
                tx.send(()).unwrap();
            })
        };

        // Still blocked.
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        lock.release();
        rx.recv_timeout(PATIENCE).unwrap();
        waiter.join().unwrap();
    }

    #[test]
    fn test_wait_passes_through_when_idle() {
        let lock = Arc::new(SoftLock::new());

        // Returns without anyone starting the lock.
        lock.wait();
        assert!(!lock.started());

        let starter = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                lock.start();
            })
        };
        let releaser = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                lock.wait_for_start();
                lock.release();
            })
        };
        starter.join().unwrap();
        releaser.join().unwrap();

        assert!(lock.started());
        assert!(lock.released());
        assert!(!lock.finished());

        lock.done();
        assert!(lock.finished());
    }

    #[test]
    fn test_wait_for_done_blocks_until_done() {
        let lock = Arc::new(SoftLock::new());

        // Never started, still blocks.
        assert!(!lock.wait_for_done_timeout(Duration::from_millis(50)));

        let finisher = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                lock.done();
            })
        };

        lock.wait_for_done();
        finisher.join().unwrap();
        assert_terminal(&lock);
    }

    #[test]
    fn test_done_cascades_from_idle() {
        let lock = SoftLock::new();
        lock.done();
        assert_terminal(&lock);
    }

    #[test]
    fn test_close_unblocks_done_waiter() {
        let lock = Arc::new(SoftLock::new());
        let waiter = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || lock.wait_for_done_timeout(PATIENCE))
        };

        lock.close();
        assert!(waiter.join().unwrap());
        assert_terminal(&lock);
    }

    #[test]
    fn test_close_from_every_phase() {
        let idle = SoftLock::new();
        idle.close();
        assert_terminal(&idle);

        let started = SoftLock::new();
        started.start();
        started.close();
        assert_terminal(&started);

        let released = SoftLock::new();
        released.start();
        released.release();
        released.close();
        assert_terminal(&released);

        let done = SoftLock::new();
        done.start();
        done.release();
        done.done();
        done.close();
        assert_terminal(&done);
    }

    #[test]
    fn test_close_is_idempotent() {
        let lock = SoftLock::new();
        for _ in 0..3 {
            lock.close();
            assert_terminal(&lock);
        }
        assert!(!lock.start());
    }

    #[test]
    fn test_timed_waits_accept_max_duration() {
        let lock = Arc::new(SoftLock::new());
        let waiter = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || lock.wait_for_start_timeout(Duration::MAX))
        };

        thread::sleep(Duration::from_millis(20));
        lock.close();
        assert!(waiter.join().unwrap());
        assert!(lock.wait_timeout(Duration::MAX));
        assert!(lock.wait_for_done_timeout(Duration::MAX));
    }

    #[test]
    fn test_display() {
        let lock = SoftLock::new();
        lock.start();
        assert_eq!(
            lock.to_string(),
            "SoftLock(started=true, released=false, finished=false)"
        );
    }
}
