//! Dispatches every [`ApplicationEvent`] the user-facing API thread
//! enqueues onto the collaborator that owns the corresponding effect.
//!
//! The processor never blocks: for events whose effect is asynchronous
//! (a commit, an offset fetch, a metadata lookup) it takes the future the
//! owning manager hands back and parks it until `poll` resolves it, then
//! forwards the result through the event's own reply channel. Nothing here
//! spawns a task — the reactor drives this forward one tick at a time, the
//! same as every other manager.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use kcgroup_types::{GroupError, OffsetAndTimestamp, Partition, TopicId, TopicName};

use crate::background::{BackgroundEvent, BackgroundEventSink};
use crate::commit::CommitManager;
use crate::coordinator::CoordinatorManager;
use crate::events::{ApplicationEvent, EventOutcome, Reply};
use crate::heartbeat::HeartbeatManager;
use crate::membership::MembershipManager;
use crate::metadata::MetadataCache;
use crate::network::{RequestBody, RequestOutcome, ResponseBody, UnsentRequest};
use crate::offsets::OffsetsManager;
use crate::reaper::{Completable, CompletableFuture, Reaper};
use crate::reconcile::ReconciliationEngine;
use crate::subscription::SubscriptionState;

struct PendingMetadataFetch {
    future: CompletableFuture<RequestOutcome>,
    completable: Completable<HashMap<TopicId, TopicName>>,
}

enum PendingReply {
    Unit(CompletableFuture<()>, Reply),
    CommittedOffsets(CompletableFuture<HashMap<Partition, i64>>, Reply),
    Offsets(CompletableFuture<HashMap<Partition, OffsetAndTimestamp>>, Reply),
    TopicMetadata(CompletableFuture<HashMap<TopicId, TopicName>>, Reply),
}

pub struct ApplicationEventProcessor {
    membership: Rc<RefCell<MembershipManager>>,
    reconciliation: Rc<RefCell<ReconciliationEngine>>,
    subscription: Rc<RefCell<dyn SubscriptionState>>,
    metadata: Rc<RefCell<dyn MetadataCache>>,
    commit: Rc<RefCell<CommitManager>>,
    heartbeat: Rc<RefCell<HeartbeatManager>>,
    offsets: Rc<RefCell<OffsetsManager>>,
    coordinator: Rc<RefCell<CoordinatorManager>>,
    background: Rc<RefCell<dyn BackgroundEventSink>>,
    reaper: Rc<RefCell<Reaper>>,
    pending: Vec<PendingReply>,
    metadata_outbox: Vec<UnsentRequest>,
    metadata_pending: Vec<PendingMetadataFetch>,
}

impl ApplicationEventProcessor {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        membership: Rc<RefCell<MembershipManager>>,
        reconciliation: Rc<RefCell<ReconciliationEngine>>,
        subscription: Rc<RefCell<dyn SubscriptionState>>,
        metadata: Rc<RefCell<dyn MetadataCache>>,
        commit: Rc<RefCell<CommitManager>>,
        heartbeat: Rc<RefCell<HeartbeatManager>>,
        offsets: Rc<RefCell<OffsetsManager>>,
        coordinator: Rc<RefCell<CoordinatorManager>>,
        background: Rc<RefCell<dyn BackgroundEventSink>>,
        reaper: Rc<RefCell<Reaper>>,
    ) -> Self {
        Self {
            membership,
            reconciliation,
            subscription,
            metadata,
            commit,
            heartbeat,
            offsets,
            coordinator,
            background,
            reaper,
            pending: Vec::new(),
            metadata_outbox: Vec::new(),
            metadata_pending: Vec::new(),
        }
    }

    /// Handles one event. Never panics on a malformed or stale event — the
    /// worst that happens is a reply channel getting dropped, which the
    /// caller observes as a cancelled future.
    pub fn dispatch(&mut self, event: ApplicationEvent, now_ms: i64) {
        match event {
            ApplicationEvent::Poll { poll_time_ms } => {
                self.commit.borrow_mut().update_auto_commit_timer(poll_time_ms);
                self.heartbeat.borrow_mut().note_application_poll(now_ms);
            }
            ApplicationEvent::Commit { offsets, reply } => {
                let future = self.commit.borrow_mut().add_offset_commit_request(offsets, now_ms + 30_000);
                self.pending.push(PendingReply::Unit(future, reply));
            }
            ApplicationEvent::FetchCommittedOffset { partitions, reply } => {
                let future = self.commit.borrow_mut().add_offset_fetch_request(partitions, now_ms + 30_000);
                self.pending.push(PendingReply::CommittedOffsets(future, reply));
            }
            ApplicationEvent::MetadataUpdate { new_topics } => {
                tracing::debug!(count = new_topics.len(), "requesting metadata refresh");
                self.metadata.borrow_mut().request_update(true);
            }
            ApplicationEvent::AssignmentChange { offsets, now_ms: changed_at } => {
                self.commit.borrow_mut().set_positions(offsets);
                self.commit.borrow_mut().update_auto_commit_timer(changed_at);
                self.commit.borrow_mut().trigger_async_auto_commit(changed_at);
            }
            ApplicationEvent::TopicMetadata { topic, reply } => {
                let future = self.fetch_topic_metadata(vec![topic], now_ms);
                self.pending.push(PendingReply::TopicMetadata(future, reply));
            }
            ApplicationEvent::ListOffsets { timestamps, require_timestamps, reply } => {
                let future = self.offsets.borrow_mut().fetch_offsets(timestamps, require_timestamps, now_ms + 30_000);
                self.pending.push(PendingReply::Offsets(future, reply));
            }
            ApplicationEvent::ResetPositions => {
                let mut offsets = self.offsets.borrow_mut();
                offsets.mark_reset_needed();
                offsets.reset_positions_if_needed(now_ms);
            }
            ApplicationEvent::ValidatePositions => {
                let mut offsets = self.offsets.borrow_mut();
                offsets.mark_validate_needed();
                offsets.validate_positions_if_needed(now_ms);
            }
            ApplicationEvent::SubscriptionChange => {
                self.membership.borrow_mut().on_subscription_updated();
            }
            ApplicationEvent::Unsubscribe { reply } => {
                let future = self.membership.borrow_mut().leave_group(now_ms);
                self.pending.push(PendingReply::Unit(future, reply));
            }
            ApplicationEvent::RebalanceListenerCallbackCompleted { method, generation, error } => {
                self.resume_rebalance_callback(method, generation, error);
            }
            ApplicationEvent::WaitForJoinGroup { reply } => {
                let future = self.membership.borrow_mut().notify_on_stable(now_ms);
                self.pending.push(PendingReply::Unit(future, reply));
            }
        }
    }

    /// Tries the reconciliation engine first — it owns the normal
    /// revoke/assign callbacks issued during `RECONCILING` — and falls back
    /// to the membership manager, which owns the fence/leave/stale-driven
    /// lifecycle callbacks. A completion event belongs to exactly one of
    /// the two.
    fn resume_rebalance_callback(
        &mut self,
        method: crate::subscription::RebalanceMethod,
        generation: u64,
        error: Option<String>,
    ) {
        let owned_by_engine = self.reconciliation.borrow().is_awaiting(method, generation);
        if owned_by_engine {
            let mut engine = self.reconciliation.borrow_mut();
            let mut membership = self.membership.borrow_mut();
            let callback = engine.on_callback_completed(&mut membership, &self.subscription, method, generation, error);
            drop(membership);
            drop(engine);
            if let Some(callback) = callback {
                self.background.borrow_mut().enqueue(BackgroundEvent::CallbackNeeded(callback));
            }
            return;
        }

        if !self.membership.borrow_mut().on_callback_completed(method, generation) {
            tracing::warn!(?method, generation, "no reconciliation step or lifecycle callback awaiting this completion");
        }
    }

    fn fetch_topic_metadata(&mut self, topics: Vec<TopicId>, now_ms: i64) -> CompletableFuture<HashMap<TopicId, TopicName>> {
        let deadline_ms = now_ms + 30_000;
        let (user_completable, user_future) = Reaper::track::<HashMap<TopicId, TopicName>>(&self.reaper, deadline_ms);
        let (wire_completion, wire_future) = Reaper::track::<RequestOutcome>(&self.reaper, deadline_ms);
        self.metadata_outbox.push(UnsentRequest {
            body: RequestBody::Metadata { topics },
            target_node: self.coordinator.borrow().known_coordinator().map(str::to_string),
            deadline_ms,
            completion: wire_completion,
        });
        self.metadata_pending.push(PendingMetadataFetch {
            future: wire_future,
            completable: user_completable,
        });
        user_future
    }

    /// Collects requests queued this tick for the network client.
    pub fn drain_outbound(&mut self) -> Vec<UnsentRequest> {
        std::mem::take(&mut self.metadata_outbox)
    }

    /// Advances every in-flight reply and metadata fetch by one step.
    /// Called by the reactor once per tick, after the request managers.
    pub fn poll(&mut self) {
        self.poll_metadata_wire();
        self.poll_pending();
    }

    fn poll_metadata_wire(&mut self) {
        let mut still_pending = Vec::with_capacity(self.metadata_pending.len());
        for mut entry in self.metadata_pending.drain(..) {
            match entry.future.try_take() {
                None => still_pending.push(entry),
                Some(Ok(RequestOutcome::Response { body: ResponseBody::Metadata { topic_names }, .. })) => {
                    entry.completable.resolve(topic_names);
                }
                Some(Ok(_)) => entry.completable.fail(GroupError::Retriable("unexpected response to metadata request".into())),
                Some(Err(err)) => entry.completable.fail(err),
            }
        }
        self.metadata_pending = still_pending;
    }

    fn poll_pending(&mut self) {
        let mut still_pending = Vec::with_capacity(self.pending.len());
        for entry in self.pending.drain(..) {
            match entry {
                PendingReply::Unit(mut future, reply) => match future.try_take() {
                    None => still_pending.push(PendingReply::Unit(future, reply)),
                    Some(result) => {
                        let _ = reply.send(result.map(|()| EventOutcome::Unit));
                    }
                },
                PendingReply::CommittedOffsets(mut future, reply) => match future.try_take() {
                    None => still_pending.push(PendingReply::CommittedOffsets(future, reply)),
                    Some(result) => {
                        let _ = reply.send(result.map(EventOutcome::CommittedOffsets));
                    }
                },
                PendingReply::Offsets(mut future, reply) => match future.try_take() {
                    None => still_pending.push(PendingReply::Offsets(future, reply)),
                    Some(result) => {
                        let _ = reply.send(result.map(EventOutcome::Offsets));
                    }
                },
                PendingReply::TopicMetadata(mut future, reply) => match future.try_take() {
                    None => still_pending.push(PendingReply::TopicMetadata(future, reply)),
                    Some(result) => {
                        let _ = reply.send(result.map(EventOutcome::TopicMetadata));
                    }
                },
            }
        }
        self.pending = still_pending;
    }
}
