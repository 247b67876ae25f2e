//! Background event handler contract: the one-way channel the
//! reactor uses to hand the user thread an error to surface, or a
//! rebalance-listener callback to run. The user thread answers a
//! `CallbackNeeded` by running the listener and enqueuing a
//! `RebalanceListenerCallbackCompleted` application event (see
//! `crate::events`) — it is a round trip across two event types, not a
//! future embedded in this one.

use kcgroup_types::{Assignment, GroupError};

use crate::subscription::RebalanceMethod;

/// A rebalance-listener invocation the background/user thread must perform.
#[derive(Debug, Clone)]
pub struct CallbackRequest {
    pub method: RebalanceMethod,
    pub partitions: Assignment,
    /// The reconciliation generation active when this was issued; if it has
    /// since changed, the eventual completion event is discarded.
    pub generation: u64,
}

#[derive(Debug, Clone)]
pub enum BackgroundEvent {
    /// A fatal or surfaced error the user thread should raise to the
    /// application (e.g. from `poll()`).
    Error(GroupError),
    CallbackNeeded(CallbackRequest),
}

/// Enqueues events for the user thread to consume. Implemented by whatever
/// bridges to the public consumer API (out of scope for this core).
pub trait BackgroundEventSink {
    fn enqueue(&mut self, event: BackgroundEvent);
}
