//! Monotonic clock abstraction and expiring timers.
//!
//! The reactor never reads the wall clock directly; a [`Clock`] is threaded
//! through every manager so tests can drive time deterministically with
//! [`ManualClock`] instead of sleeping.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// A monotonic time source, in milliseconds since an arbitrary epoch.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Production clock backed by [`std::time::Instant`].
#[derive(Clone)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        self.start.elapsed().as_millis() as i64
    }
}

/// Test clock that only advances when told to.
#[derive(Clone, Default)]
pub struct ManualClock(Arc<AtomicI64>);

impl ManualClock {
    #[must_use]
    pub fn new(start_ms: i64) -> Self {
        Self(Arc::new(AtomicI64::new(start_ms)))
    }

    pub fn advance(&self, delta_ms: i64) {
        self.0.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: i64) {
        self.0.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// An expiring, resettable timer with a client-controlled interval.
///
/// Used for the heartbeat interval, the poll (`max.poll.interval.ms`)
/// timer, and the auto-commit timer.
#[derive(Debug, Clone, Copy)]
pub struct Timer {
    interval_ms: i64,
    deadline_ms: i64,
}

impl Timer {
    /// Creates a timer already expired at `now`, so the first `poll` fires
    /// immediately.
    #[must_use]
    pub fn expired_now(now_ms: i64, interval_ms: i64) -> Self {
        Self {
            interval_ms,
            deadline_ms: now_ms,
        }
    }

    #[must_use]
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.deadline_ms
    }

    #[must_use]
    pub fn remaining_ms(&self, now_ms: i64) -> i64 {
        (self.deadline_ms - now_ms).max(0)
    }

    /// Restarts the timer's countdown from `now`, using the current interval.
    pub fn reset(&mut self, now_ms: i64) {
        self.deadline_ms = now_ms + self.interval_ms;
    }

    /// Updates the interval for subsequent resets without changing the
    /// current deadline.
    pub fn set_interval(&mut self, interval_ms: i64) {
        self.interval_ms = interval_ms;
    }

    #[must_use]
    pub fn interval_ms(&self) -> i64 {
        self.interval_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expires_and_resets() {
        let mut t = Timer::expired_now(0, 100);
        assert!(t.is_expired(0));
        t.reset(0);
        assert!(!t.is_expired(50));
        assert!(t.is_expired(100));
        assert_eq!(t.remaining_ms(50), 50);
    }

    #[test]
    fn manual_clock_advances_deterministically() {
        let clock = ManualClock::new(10);
        assert_eq!(clock.now_ms(), 10);
        clock.advance(5);
        assert_eq!(clock.now_ms(), 15);
        clock.set(100);
        assert_eq!(clock.now_ms(), 100);
    }
}
