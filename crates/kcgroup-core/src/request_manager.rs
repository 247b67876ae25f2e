//! The request-manager contract shared by every poller the reactor drives,
//! and the retry-with-backoff substrate they all use.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use backoff::backoff::Backoff as _;
use backoff::ExponentialBackoff;
use rand::Rng;

use crate::network::UnsentRequest;

/// What a manager produced on this tick. `next_wake_ms` is advisory: the
/// reactor folds it into the outer poll timeout, it never blocks the
/// manager itself.
#[derive(Default)]
pub struct PollResult {
    pub next_wake_ms: Option<i64>,
    pub unsent: Vec<UnsentRequest>,
}

impl PollResult {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn wake_at(next_wake_ms: i64) -> Self {
        Self {
            next_wake_ms: Some(next_wake_ms),
            unsent: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_request(mut self, request: UnsentRequest) -> Self {
        self.unsent.push(request);
        self
    }
}

/// Common capability every request manager exposes to the reactor,
/// dispatched dynamically so the reactor can hold a homogeneous list of
/// pollers. Must be safe to call on every tick, idle or not.
pub trait RequestManager {
    fn poll(&mut self, now_ms: i64) -> PollResult;

    fn max_time_to_wait(&self, now_ms: i64) -> i64;

    fn name(&self) -> &'static str;
}

/// Lets a manager be shared with other collaborators (e.g. the application
/// event processor) via `Rc<RefCell<_>>` while still registering with the
/// reactor as a plain `Box<dyn RequestManager>`.
impl<T: RequestManager> RequestManager for Rc<RefCell<T>> {
    fn poll(&mut self, now_ms: i64) -> PollResult {
        RefCell::borrow_mut(self).poll(now_ms)
    }

    fn max_time_to_wait(&self, now_ms: i64) -> i64 {
        self.borrow().max_time_to_wait(now_ms)
    }

    fn name(&self) -> &'static str {
        self.borrow().name()
    }
}

/// Exponential backoff with jitter, capped, resettable on success, guarding
/// against concurrent duplicate requests via `in_flight`.
pub struct Retry {
    backoff: ExponentialBackoff,
    in_flight: bool,
    next_attempt_ms: i64,
}

impl Retry {
    #[must_use]
    pub fn new(now_ms: i64, initial: Duration, max: Duration) -> Self {
        let backoff = ExponentialBackoff {
            initial_interval: initial,
            max_interval: max,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };
        Self {
            backoff,
            in_flight: false,
            next_attempt_ms: now_ms,
        }
    }

    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn mark_in_flight(&mut self) {
        self.in_flight = true;
    }

    /// Clears the in-flight guard without touching the backoff schedule;
    /// used after a response/failure has been read back, before deciding
    /// whether to call `record_success`/`record_failure`.
    pub fn clear_in_flight(&mut self) {
        self.in_flight = false;
    }

    pub fn record_success(&mut self) {
        self.in_flight = false;
        self.backoff.reset();
        self.next_attempt_ms = 0;
    }

    /// Schedules the next retry after `now_ms`, applying jitter on top of
    /// the exponential schedule.
    pub fn record_failure(&mut self, now_ms: i64) {
        self.in_flight = false;
        let interval = self.backoff.next_backoff().unwrap_or(self.backoff.max_interval);
        let jitter_ms = rand::rng().random_range(0..=50);
        self.next_attempt_ms = now_ms + interval.as_millis() as i64 + jitter_ms;
    }

    /// Clears the schedule so the next `ready` call succeeds immediately —
    /// used for `NOT_COORDINATOR`/`COORDINATOR_NOT_AVAILABLE`, which retry
    /// without backoff.
    pub fn clear_backoff(&mut self, now_ms: i64) {
        self.backoff.reset();
        self.next_attempt_ms = now_ms;
    }

    #[must_use]
    pub fn ready(&self, now_ms: i64) -> bool {
        !self.in_flight && now_ms >= self.next_attempt_ms
    }

    #[must_use]
    pub fn next_attempt_ms(&self) -> i64 {
        self.next_attempt_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backs_off_and_resets_on_success() {
        let mut retry = Retry::new(0, Duration::from_millis(100), Duration::from_secs(1));
        assert!(retry.ready(0));
        retry.mark_in_flight();
        assert!(!retry.ready(0));

        retry.record_failure(0);
        assert!(!retry.ready(0));
        assert!(retry.next_attempt_ms() >= 100);

        retry.record_success();
        assert!(retry.ready(0));
    }

    #[test]
    fn clear_backoff_retries_immediately() {
        let mut retry = Retry::new(0, Duration::from_millis(100), Duration::from_secs(1));
        retry.mark_in_flight();
        retry.record_failure(0);
        assert!(!retry.ready(0));
        retry.clear_backoff(0);
        assert!(retry.ready(0));
    }
}
