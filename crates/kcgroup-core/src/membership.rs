//! The membership state machine: ten states, a narrow set of
//! legal transitions, and the bookkeeping ([`MemberId`]/[`MemberEpoch`]/
//! assignment/generation) every other manager reads or mutates through it.
//! The reactor is the only thread that ever touches a `MembershipManager`.

use std::rc::Rc;
use std::cell::RefCell;

use kcgroup_types::{Assignment, FatalReason, GroupError, MemberEpoch, MemberId, Partition, TopicId};

use crate::background::CallbackRequest;
use crate::reaper::{Completable, CompletableFuture, Reaper};
use crate::subscription::RebalanceMethod;

/// The membership lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MembershipState {
    Unsubscribed,
    Joining,
    Reconciling,
    Acknowledging,
    Stable,
    PrepareLeaving,
    Leaving,
    Fenced,
    Fatal,
    Stale,
}

/// Which kind of heartbeat the reactor just handed to the network client;
/// determines what `on_heartbeat_request_generated` does — it fires for
/// leave heartbeats as well as regular ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentHeartbeatKind {
    Regular,
    Leave,
    PollTimerLeave,
}

fn is_legal_transition(from: MembershipState, to: MembershipState) -> bool {
    use MembershipState::{
        Acknowledging, Fatal, Fenced, Joining, Leaving, PrepareLeaving, Reconciling, Stable,
        Stale, Unsubscribed,
    };
    matches!(
        (from, to),
        (Unsubscribed, Joining)
            | (Unsubscribed, Fatal)
            | (Joining, Reconciling)
            | (Joining, Fatal)
            | (Joining, Stale)
            | (Reconciling, Acknowledging)
            | (Reconciling, Joining)
            | (Reconciling, PrepareLeaving)
            | (Reconciling, Fatal)
            | (Reconciling, Stale)
            | (Acknowledging, Stable)
            | (Acknowledging, Reconciling)
            | (Acknowledging, Joining)
            | (Acknowledging, PrepareLeaving)
            | (Acknowledging, Fatal)
            | (Acknowledging, Stale)
            | (Stable, Reconciling)
            | (Stable, PrepareLeaving)
            | (Stable, Joining)
            | (Stable, Fatal)
            | (Stable, Stale)
            | (PrepareLeaving, Leaving)
            | (PrepareLeaving, Unsubscribed)
            | (PrepareLeaving, Fatal)
            | (Leaving, Unsubscribed)
            | (Leaving, Fatal)
            | (Fenced, Joining)
            | (Fenced, Unsubscribed)
            | (Fenced, Fatal)
            | (Stale, Joining)
    )
}

/// Registered via `register_state_listener`. Invoked inline with
/// the mutation, only when the member id or epoch actually changed.
pub type StateListener = Box<dyn FnMut(Option<MemberId>, Option<MemberEpoch>)>;

pub struct MembershipManager {
    state: MembershipState,
    member_id: MemberId,
    member_epoch: MemberEpoch,
    current_assignment: Assignment,
    target_assignment: Option<Assignment>,
    awaiting_metadata: Vec<TopicId>,
    reconciliation_in_progress: bool,
    group_instance_id: Option<String>,
    generation: u64,
    listener: Option<StateListener>,

    leave_waiters: Vec<Completable<()>>,
    leave_in_flight: bool,
    pending_leave_epoch: Option<MemberEpoch>,
    stable_waiters: Vec<Completable<()>>,

    awaiting_lifecycle_callback: Option<(RebalanceMethod, u64)>,
    pending_callback: Option<CallbackRequest>,

    reaper: Rc<RefCell<Reaper>>,
}

impl MembershipManager {
    #[must_use]
    pub fn new(group_instance_id: Option<String>, reaper: Rc<RefCell<Reaper>>) -> Self {
        Self {
            state: MembershipState::Unsubscribed,
            member_id: MemberId::empty(),
            member_epoch: MemberEpoch::NOT_JOINED,
            current_assignment: Assignment::new(),
            target_assignment: None,
            awaiting_metadata: Vec::new(),
            reconciliation_in_progress: false,
            group_instance_id,
            generation: 0,
            listener: None,
            leave_waiters: Vec::new(),
            leave_in_flight: false,
            pending_leave_epoch: None,
            stable_waiters: Vec::new(),
            awaiting_lifecycle_callback: None,
            pending_callback: None,
            reaper,
        }
    }

    pub fn register_state_listener(&mut self, listener: StateListener) {
        self.listener = Some(listener);
    }

    #[must_use]
    pub fn state(&self) -> MembershipState {
        self.state
    }

    #[must_use]
    pub fn member_id(&self) -> &MemberId {
        &self.member_id
    }

    #[must_use]
    pub fn member_epoch(&self) -> MemberEpoch {
        self.member_epoch
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn current_assignment(&self) -> &Assignment {
        &self.current_assignment
    }

    #[must_use]
    pub fn target_assignment(&self) -> Option<&Assignment> {
        self.target_assignment.as_ref()
    }

    #[must_use]
    pub fn group_instance_id(&self) -> Option<&str> {
        self.group_instance_id.as_deref()
    }

    #[must_use]
    pub fn awaiting_metadata(&self) -> &[TopicId] {
        &self.awaiting_metadata
    }

    pub fn set_awaiting_metadata(&mut self, topics: Vec<TopicId>) {
        self.awaiting_metadata = topics;
    }

    #[must_use]
    pub fn reconciliation_in_progress(&self) -> bool {
        self.reconciliation_in_progress
    }

    pub fn set_reconciliation_in_progress(&mut self, value: bool) {
        self.reconciliation_in_progress = value;
    }

    /// Called by the reconciliation engine once it has computed and applied
    /// the new subscription state; `target_assignment` is left untouched so
    /// a still-unresolved remainder keeps driving the `RECONCILING` loop.
    pub fn set_current_assignment(&mut self, assignment: Assignment) {
        self.current_assignment = assignment;
    }

    fn notify_listener(&mut self, member_id_changed: bool, epoch_changed: bool) {
        if !member_id_changed && !epoch_changed {
            return;
        }
        if let Some(listener) = &mut self.listener {
            let id = if self.member_id.is_empty() {
                None
            } else {
                Some(self.member_id.clone())
            };
            let epoch = Some(self.member_epoch);
            listener(id, epoch);
        }
    }

    fn transition_to(&mut self, new_state: MembershipState) {
        if self.state == new_state {
            return;
        }
        if !is_legal_transition(self.state, new_state) {
            if cfg!(debug_assertions) {
                panic!(
                    "illegal membership transition {:?} -> {:?}",
                    self.state, new_state
                );
            }
            tracing::warn!(
                from = ?self.state,
                to = ?new_state,
                "ignoring illegal membership state transition"
            );
            return;
        }
        tracing::debug!(from = ?self.state, to = ?new_state, "membership state transition");
        self.state = new_state;
        if new_state == MembershipState::Stable {
            for waiter in self.stable_waiters.drain(..) {
                waiter.resolve(());
            }
        }
    }

    /// Resolves the next time the member reaches `Stable`, or immediately
    /// if it already has.
    pub fn notify_on_stable(&mut self, now_ms: i64) -> CompletableFuture<()> {
        if self.state == MembershipState::Stable {
            return self.already_resolved(());
        }
        let (completable, future) = Reaper::track::<()>(&self.reaper, now_ms + 60_000);
        self.stable_waiters.push(completable);
        future
    }

    /// Called when the application changes its topic subscription.
    pub fn on_subscription_updated(&mut self) {
        self.begin_joining();
    }

    /// Exposed for the reconciliation engine, which is the only caller
    /// allowed to drive `RECONCILING -> ACKNOWLEDGING`.
    pub(crate) fn transition_to_acknowledging(&mut self) {
        self.transition_to(MembershipState::Acknowledging);
    }

    pub fn take_pending_callback(&mut self) -> Option<CallbackRequest> {
        self.pending_callback.take()
    }

    // ---- heartbeat-driven operations ----

    pub fn on_heartbeat_success(&mut self, member_id: MemberId, epoch: MemberEpoch, assignment: Option<Assignment>) {
        let id_changed = !member_id.is_empty() && member_id != self.member_id;
        let epoch_changed = epoch != self.member_epoch;
        if id_changed {
            self.member_id = member_id;
        }
        self.member_epoch = epoch;
        self.notify_listener(id_changed, epoch_changed);

        if matches!(
            self.state,
            MembershipState::PrepareLeaving | MembershipState::Leaving | MembershipState::Fatal
        ) {
            // Discard silently (spec: "Receiving a new target while
            // PREPARE_LEAVING discards the new target silently").
            return;
        }

        if let Some(target) = assignment {
            self.target_assignment = Some(target);
            if matches!(self.state, MembershipState::Joining | MembershipState::Stable) {
                self.transition_to(MembershipState::Reconciling);
            }
        }
    }

    pub fn on_heartbeat_request_generated(&mut self, kind: SentHeartbeatKind) {
        match kind {
            SentHeartbeatKind::Regular => {
                if self.state == MembershipState::Acknowledging {
                    if self.awaiting_metadata.is_empty() {
                        self.transition_to(MembershipState::Stable);
                    } else {
                        self.transition_to(MembershipState::Reconciling);
                    }
                }
            }
            SentHeartbeatKind::Leave => {
                if self.state == MembershipState::Leaving {
                    self.transition_to(MembershipState::Unsubscribed);
                    self.member_id = MemberId::empty();
                    self.member_epoch = MemberEpoch::NOT_JOINED;
                    self.resolve_leave_waiters();
                }
            }
            SentHeartbeatKind::PollTimerLeave => {
                self.transition_to(MembershipState::Stale);
                self.schedule_lost_callback();
            }
        }
    }

    pub fn on_heartbeat_failure(&mut self, retriable: bool, reason: Option<String>) {
        if !retriable {
            self.transition_to_fatal(
                reason.unwrap_or_else(|| "non-retriable heartbeat failure".to_string()),
            );
        }
    }

    pub fn on_fenced(&mut self) {
        match self.state {
            MembershipState::Stable | MembershipState::Reconciling | MembershipState::Acknowledging => {
                self.generation += 1;
                self.member_epoch = MemberEpoch::NOT_JOINED;
                self.target_assignment = None;
                self.awaiting_metadata.clear();
                self.reconciliation_in_progress = false;
                self.transition_to(MembershipState::Fenced);
                self.schedule_lost_callback();
            }
            MembershipState::PrepareLeaving | MembershipState::Leaving => {
                // No-op besides nudging toward UNSUBSCRIBED; the in-flight
                // leave continues to drive that transition itself.
            }
            _ => {}
        }
    }

    fn schedule_lost_callback(&mut self) {
        let partitions = std::mem::take(&mut self.current_assignment);
        self.awaiting_lifecycle_callback = Some((RebalanceMethod::OnPartitionsLost, self.generation));
        self.pending_callback = Some(CallbackRequest {
            method: RebalanceMethod::OnPartitionsLost,
            partitions,
            generation: self.generation,
        });
    }

    /// Resumes after `on_partitions_lost`/`on_partitions_revoked` (for the
    /// leave path) completes. Returns `true` if this manager was the one
    /// awaiting it (generation + method matched).
    pub fn on_callback_completed(&mut self, method: RebalanceMethod, generation: u64) -> bool {
        match self.awaiting_lifecycle_callback {
            Some((awaited_method, awaited_generation))
                if awaited_method == method && awaited_generation == generation =>
            {
                self.awaiting_lifecycle_callback = None;
            }
            _ => return false,
        }

        match self.state {
            MembershipState::Fenced => {
                self.transition_to(MembershipState::Joining);
            }
            MembershipState::PrepareLeaving => {
                self.transition_to(MembershipState::Leaving);
                self.member_epoch = self.pending_leave_epoch.take().unwrap_or(MemberEpoch::LEAVE_DYNAMIC);
            }
            MembershipState::Stale => {
                // Nothing further here; `maybe_rejoin_stale_member` drives
                // STALE -> JOINING once the user resets the poll timer.
            }
            _ => {}
        }
        true
    }

    /// Multiple concurrent calls all resolve together when the single
    /// in-flight leave attempt completes.
    pub fn leave_group(&mut self, now_ms: i64) -> CompletableFuture<()> {
        if matches!(self.state, MembershipState::Unsubscribed | MembershipState::Stale) {
            return self.already_resolved(());
        }

        let (completable, future) = Reaper::track::<()>(&self.reaper, now_ms + 60_000);
        self.leave_waiters.push(completable);

        if !self.leave_in_flight {
            self.leave_in_flight = true;
            self.generation += 1;
            let is_static = self.group_instance_id.is_some();
            self.pending_leave_epoch = Some(if is_static {
                MemberEpoch::LEAVE_STATIC
            } else {
                MemberEpoch::LEAVE_DYNAMIC
            });
            self.target_assignment = None;
            self.reconciliation_in_progress = false;
            self.transition_to(MembershipState::PrepareLeaving);

            if self.current_assignment.is_empty() {
                // Nothing to revoke; skip straight to LEAVING.
                self.transition_to(MembershipState::Leaving);
                self.member_epoch = self.pending_leave_epoch.take().unwrap_or(MemberEpoch::LEAVE_DYNAMIC);
            } else {
                let partitions = self.current_assignment.clone();
                self.awaiting_lifecycle_callback =
                    Some((RebalanceMethod::OnPartitionsRevoked, self.generation));
                self.pending_callback = Some(CallbackRequest {
                    method: RebalanceMethod::OnPartitionsRevoked,
                    partitions,
                    generation: self.generation,
                });
            }
        }

        future
    }

    fn resolve_leave_waiters(&mut self) {
        self.leave_in_flight = false;
        for waiter in self.leave_waiters.drain(..) {
            waiter.resolve(());
        }
    }

    fn already_resolved(&self, value: ()) -> CompletableFuture<()> {
        crate::reaper::resolved(&self.reaper, value)
    }

    pub fn transition_to_sending_leave_group(&mut self, due_to_poll_timer: bool) {
        if due_to_poll_timer {
            self.pending_leave_epoch = Some(MemberEpoch::LEAVE_DYNAMIC);
        }
    }

    pub fn transition_to_fatal(&mut self, reason: String) {
        tracing::error!(%reason, "membership moving to FATAL");
        self.current_assignment = Assignment::new();
        self.target_assignment = None;
        self.member_epoch = MemberEpoch::NOT_JOINED;
        self.member_id = MemberId::empty();
        self.transition_to(MembershipState::Fatal);
        self.notify_listener(true, true);
        self.resolve_leave_waiters();
        for waiter in self.stable_waiters.drain(..) {
            waiter.fail(GroupError::Fatal(FatalReason::Other(reason.clone())));
        }
    }

    /// Valid only in `STALE`; waits for any on-partitions-lost callback to
    /// complete before rejoining.
    pub fn maybe_rejoin_stale_member(&mut self) {
        if self.state == MembershipState::Stale && self.awaiting_lifecycle_callback.is_none() {
            self.member_epoch = MemberEpoch::NOT_JOINED;
            self.transition_to(MembershipState::Joining);
        }
    }

    /// Starts (or restarts) the join sequence, e.g. on the application's
    /// first subscribe or on `SUBSCRIPTION_CHANGE` while unsubscribed.
    pub fn begin_joining(&mut self) {
        if matches!(self.state, MembershipState::Unsubscribed | MembershipState::Stale) {
            self.member_epoch = MemberEpoch::NOT_JOINED;
            self.transition_to(MembershipState::Joining);
        }
    }

    #[must_use]
    pub fn should_heartbeat_now(&self) -> bool {
        matches!(
            self.state,
            MembershipState::Joining
                | MembershipState::Reconciling
                | MembershipState::Acknowledging
                | MembershipState::Stable
                | MembershipState::PrepareLeaving
                | MembershipState::Leaving
        )
    }

    #[must_use]
    pub fn pending_leave_epoch(&self) -> Option<MemberEpoch> {
        self.pending_leave_epoch
    }
}

#[must_use]
pub fn partition_of(topic_id: TopicId, index: i32) -> Partition {
    Partition::new(topic_id, index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kcgroup_types::MemberId;
    use uuid::Uuid;

    fn topic(n: u128) -> TopicId {
        TopicId::from_uuid(Uuid::from_u128(n))
    }

    fn manager() -> MembershipManager {
        MembershipManager::new(None, Reaper::new())
    }

    #[test]
    fn happy_path_reaches_stable() {
        let mut m = manager();
        m.transition_to(MembershipState::Joining);
        let t1 = topic(1);
        let assignment = Assignment::from_partitions([partition_of(t1, 0), partition_of(t1, 1)]);
        m.on_heartbeat_success(
            MemberId::new("m1").unwrap(),
            MemberEpoch(1),
            Some(assignment.clone()),
        );
        assert_eq!(m.state(), MembershipState::Reconciling);
        m.transition_to_acknowledging();
        m.on_heartbeat_request_generated(SentHeartbeatKind::Regular);
        assert_eq!(m.state(), MembershipState::Stable);
        assert_eq!(m.member_id().as_str(), "m1");
    }

    #[test]
    fn liveness_ack_does_not_reconcile() {
        let mut m = manager();
        m.transition_to(MembershipState::Joining);
        m.on_heartbeat_success(MemberId::new("m1").unwrap(), MemberEpoch(1), None);
        // No assignment: stays JOINING, no reconciliation triggered.
        assert_eq!(m.state(), MembershipState::Joining);
    }

    #[test]
    fn fence_releases_assignment_and_preserves_member_id() {
        let mut m = manager();
        m.transition_to(MembershipState::Joining);
        let t1 = topic(1);
        let assignment = Assignment::from_partitions([partition_of(t1, 0)]);
        m.on_heartbeat_success(MemberId::new("m1").unwrap(), MemberEpoch(1), Some(assignment));
        m.transition_to(MembershipState::Acknowledging);
        m.on_heartbeat_request_generated(SentHeartbeatKind::Regular);
        assert_eq!(m.state(), MembershipState::Stable);

        m.set_current_assignment(Assignment::from_partitions([partition_of(t1, 0)]));
        m.on_fenced();
        assert_eq!(m.state(), MembershipState::Fenced);
        assert_eq!(m.member_epoch(), MemberEpoch::NOT_JOINED);
        assert_eq!(m.member_id().as_str(), "m1");

        let generation = m.generation();
        assert!(m.on_callback_completed(RebalanceMethod::OnPartitionsLost, generation));
        assert_eq!(m.state(), MembershipState::Joining);
    }

    #[test]
    fn illegal_transition_is_ignored_in_release_semantics() {
        // We can't flip cfg(debug_assertions) at test time, but we can
        // assert the table itself rejects an made-up illegal edge.
        assert!(!is_legal_transition(
            MembershipState::Stable,
            MembershipState::Leaving
        ));
        assert!(is_legal_transition(
            MembershipState::Stable,
            MembershipState::PrepareLeaving
        ));
    }

    #[test]
    fn leave_from_unsubscribed_is_already_resolved() {
        let mut m = manager();
        let future = m.leave_group(0);
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(async {
                assert_eq!(future.wait().await, Ok(()));
            });
    }

    #[test]
    fn double_leave_call_shares_a_single_in_flight_attempt() {
        let mut m = manager();
        m.transition_to(MembershipState::Joining);
        m.transition_to(MembershipState::Reconciling);
        m.transition_to_acknowledging();
        m.on_heartbeat_request_generated(SentHeartbeatKind::Regular);
        assert_eq!(m.state(), MembershipState::Stable);

        let t1 = topic(1);
        m.set_current_assignment(Assignment::from_partitions([partition_of(t1, 0)]));

        let f1 = m.leave_group(0);
        let f2 = m.leave_group(0);
        assert_eq!(m.state(), MembershipState::PrepareLeaving);

        let generation = m.generation();
        assert!(m.on_callback_completed(RebalanceMethod::OnPartitionsRevoked, generation));
        assert_eq!(m.state(), MembershipState::Leaving);
        m.on_heartbeat_request_generated(SentHeartbeatKind::Leave);
        assert_eq!(m.state(), MembershipState::Unsubscribed);

        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(async {
                assert_eq!(f1.wait().await, Ok(()));
                assert_eq!(f2.wait().await, Ok(()));
            });
    }
}
