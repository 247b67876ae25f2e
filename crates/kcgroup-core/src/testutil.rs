//! In-memory test doubles for every external collaborator the reactor
//! needs, mirroring how `DefaultEventPublisher` gives the host something
//! to run against with no real broker, metrics backend, or callback
//! listener wired up. Exported so both this crate's own tests and
//! downstream integration tests can build a [`crate::reactor::Reactor`]
//! without a live cluster.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use kcgroup_types::{Assignment, TopicId, TopicName};

use crate::background::{BackgroundEvent, BackgroundEventSink, CallbackRequest};
use crate::metadata::MetadataCache;
use crate::network::{NetworkClient, RequestBody, RequestOutcome, TransportError, UnsentRequest};
use crate::subscription::SubscriptionState;

/// A [`NetworkClient`] that resolves every request immediately with a
/// caller-supplied responder, rather than doing any real I/O. Unanswered
/// requests are left for the reactor's reaper to time out, so tests can
/// exercise deadline handling by simply not responding.
///
/// `sent` is reference-counted so a caller can keep a handle to it after
/// the network client itself has been boxed and handed to a
/// [`crate::reactor::Reactor`], which takes ownership of it.
#[derive(Default)]
pub struct InMemoryNetwork {
    responder: Option<Box<dyn FnMut(&RequestBody) -> Option<RequestOutcome>>>,
    sent: Rc<RefCell<Vec<RequestBody>>>,
}

impl InMemoryNetwork {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a function called once per sent request; returning `None`
    /// leaves the request pending (eligible for the reaper to expire).
    pub fn respond_with(
        &mut self,
        responder: impl FnMut(&RequestBody) -> Option<RequestOutcome> + 'static,
    ) {
        self.responder = Some(Box::new(responder));
    }

    /// A shared handle to everything sent so far, readable after this
    /// network client has been moved into a reactor.
    #[must_use]
    pub fn sent_handle(&self) -> Rc<RefCell<Vec<RequestBody>>> {
        Rc::clone(&self.sent)
    }
}

impl NetworkClient for InMemoryNetwork {
    fn send_all(&mut self, requests: Vec<UnsentRequest>) {
        for request in requests {
            self.sent.borrow_mut().push(request.body.clone());
            let outcome = self
                .responder
                .as_mut()
                .and_then(|responder| responder(&request.body));
            if let Some(outcome) = outcome {
                request.completion.resolve(outcome);
            }
        }
    }

    fn poll(&mut self, _timeout_ms: i64, _now_ms: i64) {}
}

/// A [`TransportError::Disconnected`] outcome, for tests exercising retry
/// paths.
#[must_use]
pub fn disconnected_outcome() -> RequestOutcome {
    RequestOutcome::Failure {
        error: TransportError::Disconnected,
        latency_ms: 0,
    }
}

/// A [`MetadataCache`] returning a fixed topic-name map, never refreshed.
pub struct FixedMetadata(pub HashMap<TopicId, TopicName>);

impl FixedMetadata {
    #[must_use]
    pub fn empty() -> Self {
        Self(HashMap::new())
    }
}

impl MetadataCache for FixedMetadata {
    fn topic_names(&self) -> HashMap<TopicId, TopicName> {
        self.0.clone()
    }

    fn request_update(&mut self, _force: bool) {}
}

/// A [`SubscriptionState`] with no listener and no partitions, useful for
/// tests that only care about the heartbeat/commit lifecycle.
#[derive(Default)]
pub struct NoopSubscription;

impl SubscriptionState for NoopSubscription {
    fn assigned_partitions(&self) -> Assignment {
        Assignment::new()
    }

    fn subscribed_topics(&self) -> Vec<TopicId> {
        Vec::new()
    }

    fn has_auto_assigned_partitions(&self) -> bool {
        true
    }

    fn has_rebalance_listener(&self) -> bool {
        false
    }

    fn assign_from_subscribed(&mut self, _partitions: Assignment) {}

    fn assign_from_subscribed_awaiting_callback(&mut self, _all: Assignment, _added: Assignment) {}

    fn enable_partitions_awaiting_callback(&mut self, _added: &Assignment) {}

    fn mark_pending_revocation(&mut self, _revoked: &Assignment) {}
}

/// A [`BackgroundEventSink`] that just records everything it's handed, in
/// order, for assertions.
#[derive(Default)]
pub struct RecordingSink(pub Vec<BackgroundEvent>);

impl RecordingSink {
    #[must_use]
    pub fn new() -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self::default()))
    }

    #[must_use]
    pub fn callbacks(&self) -> Vec<&CallbackRequest> {
        self.0
            .iter()
            .filter_map(|event| match event {
                BackgroundEvent::CallbackNeeded(callback) => Some(callback),
                BackgroundEvent::Error(_) => None,
            })
            .collect()
    }
}

impl BackgroundEventSink for RecordingSink {
    fn enqueue(&mut self, event: BackgroundEvent) {
        self.0.push(event);
    }
}
