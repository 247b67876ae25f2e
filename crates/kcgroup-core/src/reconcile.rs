//! The reconciliation engine: drives the local assignment from
//! its current value toward the coordinator's target, suspending across
//! revocation commits and rebalance-listener callbacks, and discarding any
//! suspended step whose captured generation has gone stale.

use std::cell::RefCell;
use std::rc::Rc;

use kcgroup_types::{Assignment, TopicId};

use crate::background::CallbackRequest;
use crate::commit::CommitManager;
use crate::membership::MembershipManager;
use crate::metadata::MetadataCache;
use crate::reaper::CompletableFuture;
use crate::subscription::{RebalanceMethod, SubscriptionState};

/// Where a reconciliation attempt currently sits. Each suspended variant
/// captures the generation active when it started, the computed diff, and
/// enough of the resolved target to resume without recomputing it.
enum ReconcileStep {
    Idle,
    AwaitingRevocationCommit {
        generation: u64,
        revoked: Assignment,
        added: Assignment,
        resolved_target: Assignment,
        commit: CompletableFuture<()>,
    },
    AwaitingRevokedCallback {
        generation: u64,
        added: Assignment,
        resolved_target: Assignment,
    },
    AwaitingAssignedCallback {
        generation: u64,
        added: Assignment,
        resolved_target: Assignment,
    },
}

pub struct ReconciliationEngine {
    step: ReconcileStep,
    last_callback_error: Option<String>,
}

impl ReconciliationEngine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            step: ReconcileStep::Idle,
            last_callback_error: None,
        }
    }

    /// Surfaces (and clears) the last recorded rebalance-listener failure,
    /// for the next user-visible call to report.
    pub fn take_last_callback_error(&mut self) -> Option<String> {
        self.last_callback_error.take()
    }

    /// Drives the engine forward by one step. Returns a callback the
    /// reactor must hand to the background sink, if this tick produced one.
    pub fn poll(
        &mut self,
        membership: &mut MembershipManager,
        subscription: &Rc<RefCell<dyn SubscriptionState>>,
        metadata: &dyn MetadataCache,
        commit: &mut CommitManager,
        now_ms: i64,
    ) -> Option<CallbackRequest> {
        match std::mem::replace(&mut self.step, ReconcileStep::Idle) {
            ReconcileStep::Idle => self.try_start(membership, subscription, metadata, commit, now_ms),
            ReconcileStep::AwaitingRevocationCommit { generation, revoked, added, resolved_target, commit: mut commit_future } => {
                if generation != membership.generation() {
                    membership.set_reconciliation_in_progress(false);
                    return None;
                }
                match commit_future.try_take() {
                    None => {
                        self.step = ReconcileStep::AwaitingRevocationCommit {
                            generation,
                            revoked,
                            added,
                            resolved_target,
                            commit: commit_future,
                        };
                        None
                    }
                    Some(_) => self.begin_revocation_callback(membership, subscription, generation, revoked, added, resolved_target),
                }
            }
            ReconcileStep::AwaitingRevokedCallback { generation, added, resolved_target } => {
                self.step = ReconcileStep::AwaitingRevokedCallback { generation, added, resolved_target };
                None
            }
            ReconcileStep::AwaitingAssignedCallback { generation, added, resolved_target } => {
                self.step = ReconcileStep::AwaitingAssignedCallback { generation, added, resolved_target };
                None
            }
        }
    }

    fn try_start(
        &mut self,
        membership: &mut MembershipManager,
        subscription: &Rc<RefCell<dyn SubscriptionState>>,
        metadata: &dyn MetadataCache,
        commit: &mut CommitManager,
        now_ms: i64,
    ) -> Option<CallbackRequest> {
        if membership.state() != crate::membership::MembershipState::Reconciling {
            return None;
        }
        let Some(target) = membership.target_assignment().cloned() else {
            return None;
        };

        let known = metadata.topic_names();
        let mut resolved_target = Assignment::new();
        let mut still_awaiting: Vec<TopicId> = Vec::new();
        for partition in target.iter() {
            if known.contains_key(&partition.topic_id) {
                resolved_target.insert(partition);
            } else if !still_awaiting.contains(&partition.topic_id) {
                still_awaiting.push(partition.topic_id);
            }
        }
        // Resolvable topics still drive the revoke/add cycle; unresolved
        // ones stay in awaiting-metadata until a later poll resolves them.
        membership.set_awaiting_metadata(still_awaiting);

        let current = membership.current_assignment().clone();
        let revoked = current.difference(&resolved_target);
        let added = resolved_target.difference(&current);
        let generation = membership.generation();

        membership.set_reconciliation_in_progress(true);

        if revoked.is_empty() {
            return self.begin_revocation_callback(membership, subscription, generation, revoked, added, resolved_target);
        }

        let commit_future = commit.maybe_auto_commit_sync_before_revocation(now_ms + 30_000);
        self.step = ReconcileStep::AwaitingRevocationCommit {
            generation,
            revoked,
            added,
            resolved_target,
            commit: commit_future,
        };
        None
    }

    fn begin_revocation_callback(
        &mut self,
        membership: &mut MembershipManager,
        subscription: &Rc<RefCell<dyn SubscriptionState>>,
        generation: u64,
        revoked: Assignment,
        added: Assignment,
        resolved_target: Assignment,
    ) -> Option<CallbackRequest> {
        if generation != membership.generation() {
            membership.set_reconciliation_in_progress(false);
            return None;
        }

        if revoked.is_empty() {
            return self.begin_assigned_callback(membership, subscription, generation, added, resolved_target, true);
        }

        subscription.borrow_mut().mark_pending_revocation(&revoked);

        if !subscription.borrow().has_rebalance_listener() {
            return self.begin_assigned_callback(membership, subscription, generation, added, resolved_target, false);
        }

        self.step = ReconcileStep::AwaitingRevokedCallback { generation, added, resolved_target };
        Some(CallbackRequest {
            method: RebalanceMethod::OnPartitionsRevoked,
            partitions: revoked,
            generation,
        })
    }

    fn begin_assigned_callback(
        &mut self,
        membership: &mut MembershipManager,
        subscription: &Rc<RefCell<dyn SubscriptionState>>,
        generation: u64,
        added: Assignment,
        resolved_target: Assignment,
        revoked_empty: bool,
    ) -> Option<CallbackRequest> {
        if generation != membership.generation() {
            membership.set_reconciliation_in_progress(false);
            return None;
        }

        if added.is_empty() {
            // Target equals current exactly: nothing was revoked or added,
            // so the subscription must not be touched at all.
            if !revoked_empty {
                subscription.borrow_mut().assign_from_subscribed(resolved_target.clone());
            }
            self.finalize(membership, resolved_target);
            return None;
        }

        if !subscription.borrow().has_rebalance_listener() {
            subscription.borrow_mut().assign_from_subscribed(resolved_target.clone());
            self.finalize(membership, resolved_target);
            return None;
        }

        subscription
            .borrow_mut()
            .assign_from_subscribed_awaiting_callback(resolved_target.clone(), added.clone());
        self.step = ReconcileStep::AwaitingAssignedCallback { generation, added: added.clone(), resolved_target };
        Some(CallbackRequest {
            method: RebalanceMethod::OnPartitionsAssigned,
            partitions: added,
            generation,
        })
    }

    /// Called by the processor when `CONSUMER_REBALANCE_LISTENER_CALLBACK_COMPLETED`
    /// arrives. Returns `true` if this engine owned the callback (matching
    /// generation/method), `false` if it should be routed elsewhere (the
    /// membership manager's own lifecycle callbacks).
    pub fn on_callback_completed(
        &mut self,
        membership: &mut MembershipManager,
        subscription: &Rc<RefCell<dyn SubscriptionState>>,
        method: RebalanceMethod,
        generation: u64,
        error: Option<String>,
    ) -> Option<CallbackRequest> {
        if let Some(error) = error {
            self.last_callback_error = Some(error);
        }

        match std::mem::replace(&mut self.step, ReconcileStep::Idle) {
            ReconcileStep::AwaitingRevokedCallback {
                generation: awaited_generation,
                added,
                resolved_target,
            } if awaited_generation == generation && method == RebalanceMethod::OnPartitionsRevoked => {
                if awaited_generation != membership.generation() {
                    membership.set_reconciliation_in_progress(false);
                    return None;
                }
                self.begin_assigned_callback(membership, subscription, generation, added, resolved_target, false)
            }
            ReconcileStep::AwaitingAssignedCallback {
                generation: awaited_generation,
                added,
                resolved_target,
            } if awaited_generation == generation && method == RebalanceMethod::OnPartitionsAssigned => {
                if awaited_generation != membership.generation() {
                    membership.set_reconciliation_in_progress(false);
                    return None;
                }
                if self.last_callback_error.is_none() {
                    subscription.borrow_mut().enable_partitions_awaiting_callback(&added);
                }
                self.finalize(membership, resolved_target);
                None
            }
            other => {
                self.step = other;
                None
            }
        }
    }

    /// Whether `on_callback_completed` actually matched an awaited step —
    /// used by the processor to decide whether to route the completion to
    /// the membership manager's own lifecycle callback instead.
    #[must_use]
    pub fn is_awaiting(&self, method: RebalanceMethod, generation: u64) -> bool {
        match &self.step {
            ReconcileStep::AwaitingRevokedCallback { generation: g, .. } => {
                *g == generation && method == RebalanceMethod::OnPartitionsRevoked
            }
            ReconcileStep::AwaitingAssignedCallback { generation: g, .. } => {
                *g == generation && method == RebalanceMethod::OnPartitionsAssigned
            }
            _ => false,
        }
    }

    fn finalize(&mut self, membership: &mut MembershipManager, resolved_target: Assignment) {
        membership.set_current_assignment(resolved_target);
        membership.transition_to_acknowledging();
        membership.set_reconciliation_in_progress(false);
        self.step = ReconcileStep::Idle;
    }
}

impl Default for ReconciliationEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::CommitManager;
    use crate::coordinator::CoordinatorManager;
    use crate::membership::{MembershipState, SentHeartbeatKind};
    use crate::metadata::MetadataCache;
    use crate::reaper::Reaper;
    use kcgroup_types::{MemberEpoch, MemberId, Partition};
    use std::collections::HashMap;
    use uuid::Uuid;

    struct FakeMetadata(HashMap<TopicId, kcgroup_types::TopicName>);
    impl MetadataCache for FakeMetadata {
        fn topic_names(&self) -> HashMap<TopicId, kcgroup_types::TopicName> {
            self.0.clone()
        }
        fn request_update(&mut self, _force: bool) {}
    }

    #[derive(Default)]
    struct RecordingSubscription {
        assigned: Assignment,
        has_listener: bool,
        assign_calls: u32,
        awaiting_calls: u32,
    }
    impl SubscriptionState for RecordingSubscription {
        fn assigned_partitions(&self) -> Assignment {
            self.assigned.clone()
        }
        fn subscribed_topics(&self) -> Vec<TopicId> {
            Vec::new()
        }
        fn has_auto_assigned_partitions(&self) -> bool {
            true
        }
        fn has_rebalance_listener(&self) -> bool {
            self.has_listener
        }
        fn assign_from_subscribed(&mut self, partitions: Assignment) {
            self.assigned = partitions;
            self.assign_calls += 1;
        }
        fn assign_from_subscribed_awaiting_callback(&mut self, all: Assignment, _added: Assignment) {
            self.assigned = all;
            self.awaiting_calls += 1;
        }
        fn enable_partitions_awaiting_callback(&mut self, _added: &Assignment) {}
        fn mark_pending_revocation(&mut self, _revoked: &Assignment) {}
    }

    fn topic(n: u128) -> TopicId {
        TopicId::from_uuid(Uuid::from_u128(n))
    }

    fn setup() -> (
        MembershipManager,
        ReconciliationEngine,
        Rc<RefCell<dyn SubscriptionState>>,
        CommitManager,
    ) {
        let reaper = Reaper::new();
        let membership = MembershipManager::new(None, Rc::clone(&reaper));
        let coordinator = Rc::new(RefCell::new(CoordinatorManager::new("g1".into(), 10_000, 0, Rc::clone(&reaper))));
        let commit_membership = Rc::new(RefCell::new(MembershipManager::new(None, Rc::clone(&reaper))));
        let commit = CommitManager::new("g1".into(), false, 5_000, 0, commit_membership, coordinator, reaper);
        let subscription: Rc<RefCell<dyn SubscriptionState>> =
            Rc::new(RefCell::new(RecordingSubscription { has_listener: true, ..Default::default() }));
        (membership, ReconciliationEngine::new(), subscription, commit)
    }

    #[test]
    fn reconciliation_without_listener_applies_immediately_and_assigns() {
        let (mut membership, mut engine, subscription, mut commit) = setup();
        {
            let mut sub = subscription.borrow_mut();
            // Downcast isn't available; rebuild without a listener instead.
            let _ = &mut *sub;
        }
        let subscription: Rc<RefCell<dyn SubscriptionState>> =
            Rc::new(RefCell::new(RecordingSubscription { has_listener: false, ..Default::default() }));

        membership.begin_joining();
        let t1 = topic(1);
        let assignment = Assignment::from_partitions([Partition::new(t1, 0), Partition::new(t1, 1)]);
        membership.on_heartbeat_success(MemberId::new("m1").unwrap(), MemberEpoch(1), Some(assignment.clone()));
        assert_eq!(membership.state(), MembershipState::Reconciling);

        let mut names = HashMap::new();
        names.insert(t1, kcgroup_types::TopicName::new("orders").unwrap());
        let metadata = FakeMetadata(names);

        let callback = engine.poll(&mut membership, &subscription, &metadata, &mut commit, 0);
        assert!(callback.is_none(), "no listener means no callback round trip");
        assert_eq!(membership.state(), MembershipState::Acknowledging);
        assert_eq!(membership.current_assignment(), &assignment);
    }

    #[test]
    fn reconciliation_with_listener_requests_assigned_callback() {
        let (mut membership, mut engine, subscription, mut commit) = setup();
        membership.begin_joining();
        let t1 = topic(1);
        let assignment = Assignment::from_partitions([Partition::new(t1, 0)]);
        membership.on_heartbeat_success(MemberId::new("m1").unwrap(), MemberEpoch(1), Some(assignment.clone()));

        let mut names = HashMap::new();
        names.insert(t1, kcgroup_types::TopicName::new("orders").unwrap());
        let metadata = FakeMetadata(names);

        let callback = engine.poll(&mut membership, &subscription, &metadata, &mut commit, 0);
        let callback = callback.expect("added partitions with a listener must request a callback");
        assert_eq!(callback.method, RebalanceMethod::OnPartitionsAssigned);
        assert_eq!(membership.state(), MembershipState::Reconciling);

        let generation = membership.generation();
        let follow_up = engine.on_callback_completed(
            &mut membership,
            &subscription,
            RebalanceMethod::OnPartitionsAssigned,
            generation,
            None,
        );
        assert!(follow_up.is_none());
        assert_eq!(membership.state(), MembershipState::Acknowledging);
        assert_eq!(membership.current_assignment(), &assignment);
    }

    #[test]
    fn stale_generation_on_resume_is_discarded() {
        let (mut membership, mut engine, subscription, mut commit) = setup();
        membership.begin_joining();
        let t1 = topic(1);
        let assignment = Assignment::from_partitions([Partition::new(t1, 0)]);
        membership.on_heartbeat_success(MemberId::new("m1").unwrap(), MemberEpoch(1), Some(assignment));

        let mut names = HashMap::new();
        names.insert(t1, kcgroup_types::TopicName::new("orders").unwrap());
        let metadata = FakeMetadata(names);

        let callback = engine.poll(&mut membership, &subscription, &metadata, &mut commit, 0).unwrap();
        let stale_generation = callback.generation;

        // Fence bumps the generation, making the in-flight callback stale.
        membership.set_current_assignment(Assignment::new());
        membership.on_fenced();

        let follow_up = engine.on_callback_completed(
            &mut membership,
            &subscription,
            RebalanceMethod::OnPartitionsAssigned,
            stale_generation,
            None,
        );
        assert!(follow_up.is_none());
        // Membership is driven by its own fence path, not the engine; the
        // engine simply must not resurrect the discarded step.
        assert_eq!(membership.state(), MembershipState::Fenced);
    }

    #[test]
    fn identical_target_does_not_touch_the_subscription() {
        let reaper = Reaper::new();
        let mut membership = MembershipManager::new(None, Rc::clone(&reaper));
        let coordinator = Rc::new(RefCell::new(CoordinatorManager::new("g1".into(), 10_000, 0, Rc::clone(&reaper))));
        let commit_membership = Rc::new(RefCell::new(MembershipManager::new(None, Rc::clone(&reaper))));
        let mut commit = CommitManager::new("g1".into(), false, 5_000, 0, commit_membership, coordinator, reaper);
        let concrete = Rc::new(RefCell::new(RecordingSubscription { has_listener: true, ..Default::default() }));
        let subscription: Rc<RefCell<dyn SubscriptionState>> = concrete.clone();
        let mut engine = ReconciliationEngine::new();

        membership.begin_joining();
        let t1 = topic(1);
        let assignment = Assignment::from_partitions([Partition::new(t1, 0)]);
        membership.on_heartbeat_success(MemberId::new("m1").unwrap(), MemberEpoch(1), Some(assignment.clone()));

        let mut names = HashMap::new();
        names.insert(t1, kcgroup_types::TopicName::new("orders").unwrap());
        let metadata = FakeMetadata(names);

        // First reconciliation actually applies the assignment.
        let callback = engine.poll(&mut membership, &subscription, &metadata, &mut commit, 0);
        let generation = membership.generation();
        engine.on_callback_completed(
            &mut membership,
            &subscription,
            callback.unwrap().method,
            generation,
            None,
        );
        membership.on_heartbeat_request_generated(SentHeartbeatKind::Regular);
        assert_eq!(membership.state(), MembershipState::Stable);
        assert_eq!(concrete.borrow().assign_calls, 0, "a listener-driven assign uses assign_from_subscribed_awaiting_callback");

        // A heartbeat delivers the exact same target again: no revoke, no
        // add, and the subscription must not be re-assigned at all.
        membership.on_heartbeat_success(MemberId::new("m1").unwrap(), MemberEpoch(2), Some(assignment.clone()));
        assert_eq!(membership.state(), MembershipState::Reconciling);

        let calls_before = concrete.borrow().assign_calls;
        let follow_up = engine.poll(&mut membership, &subscription, &metadata, &mut commit, 0);
        assert!(follow_up.is_none());
        assert_eq!(membership.state(), MembershipState::Acknowledging);
        assert_eq!(membership.current_assignment(), &assignment);
        assert_eq!(concrete.borrow().assign_calls, calls_before, "identical target must not re-assign the subscription");
    }

    #[test]
    fn revoked_and_added_compute_correctly() {
        let t1 = topic(1);
        let current = Assignment::from_partitions([Partition::new(t1, 0), Partition::new(t1, 1)]);
        let target = Assignment::from_partitions([Partition::new(t1, 1), Partition::new(t1, 2)]);
        assert_eq!(current.difference(&target), Assignment::from_partitions([Partition::new(t1, 0)]));
        assert_eq!(target.difference(&current), Assignment::from_partitions([Partition::new(t1, 2)]));
    }
}
