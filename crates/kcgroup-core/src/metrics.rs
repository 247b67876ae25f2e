//! Counters and gauges the reactor surfaces on well-known names, mirroring
//! `EventPublisher`/`DefaultEventPublisher`: a trait with no-op default
//! methods so a caller who doesn't care about observability pays nothing.

/// Observability hook injected into a [`crate::reactor::Reactor`]. Every
/// method has a no-op default; implement only the ones a given deployment
/// actually wants to wire to a real metrics backend.
pub trait Metrics {
    fn record_unsent_requests(&self, _count: usize) {}

    fn record_tracked_completables(&self, _count: usize) {}

    fn record_callback_enqueued(&self, _method: &'static str) {}

    fn record_state_transition(&self, _from: &'static str, _to: &'static str) {}
}

/// Default implementation that discards everything. Useful for tests or
/// when no metrics backend is wired up.
#[derive(Default)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {}
