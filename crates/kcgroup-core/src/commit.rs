//! The commit request manager: owns the auto-commit timer and
//! the offset-commit/offset-fetch request lifecycle. Every future it hands
//! out resolves exactly once, possibly with a commit-level broker error.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use kcgroup_types::{GroupError, Partition};

use crate::coordinator::CoordinatorManager;
use crate::membership::MembershipManager;
use crate::network::{RequestBody, RequestOutcome, ResponseBody, UnsentRequest};
use crate::reaper::{Completable, CompletableFuture, Reaper};
use crate::request_manager::{PollResult, RequestManager};
use crate::time::Timer;

enum PendingKind {
    Commit(Completable<()>),
    Fetch(Completable<HashMap<Partition, i64>>),
}

struct PendingRequest {
    future: CompletableFuture<RequestOutcome>,
    kind: PendingKind,
}

pub struct CommitManager {
    group_id: String,
    membership: Rc<RefCell<MembershipManager>>,
    coordinator: Rc<RefCell<CoordinatorManager>>,
    reaper: Rc<RefCell<Reaper>>,
    auto_commit_enabled: bool,
    auto_commit_timer: Timer,
    positions: HashMap<Partition, i64>,
    outbox: Vec<UnsentRequest>,
    pending: Vec<PendingRequest>,
}

impl CommitManager {
    #[must_use]
    pub fn new(
        group_id: String,
        auto_commit_enabled: bool,
        auto_commit_interval_ms: i64,
        now_ms: i64,
        membership: Rc<RefCell<MembershipManager>>,
        coordinator: Rc<RefCell<CoordinatorManager>>,
        reaper: Rc<RefCell<Reaper>>,
    ) -> Self {
        Self {
            group_id,
            membership,
            coordinator,
            reaper,
            auto_commit_enabled,
            auto_commit_timer: Timer::expired_now(now_ms, auto_commit_interval_ms),
            positions: HashMap::new(),
            outbox: Vec::new(),
            pending: Vec::new(),
        }
    }

    pub fn update_auto_commit_timer(&mut self, now_ms: i64) {
        self.auto_commit_timer.reset(now_ms);
    }

    /// Records the application's current fetch positions, used as the
    /// payload for the next auto-commit.
    pub fn set_positions(&mut self, offsets: HashMap<Partition, i64>) {
        self.positions = offsets;
    }

    fn target_node(&self) -> Option<String> {
        self.coordinator.borrow().known_coordinator().map(str::to_string)
    }

    fn enqueue_commit(&mut self, offsets: HashMap<Partition, i64>, deadline_ms: i64) -> CompletableFuture<()> {
        let (user_completable, user_future) = Reaper::track::<()>(&self.reaper, deadline_ms);
        let (wire_completion, wire_future) = Reaper::track::<RequestOutcome>(&self.reaper, deadline_ms);
        let membership = self.membership.borrow();
        let body = RequestBody::OffsetCommit {
            group_id: self.group_id.clone(),
            member_id: membership.member_id().clone(),
            member_epoch: membership.member_epoch(),
            offsets,
        };
        drop(membership);
        self.outbox.push(UnsentRequest {
            body,
            target_node: self.target_node(),
            deadline_ms,
            completion: wire_completion,
        });
        self.pending.push(PendingRequest {
            future: wire_future,
            kind: PendingKind::Commit(user_completable),
        });
        user_future
    }

    /// Queues an offset commit and returns a future that resolves once the
    /// broker has acknowledged it.
    pub fn add_offset_commit_request(
        &mut self,
        offsets: HashMap<Partition, i64>,
        deadline_ms: i64,
    ) -> CompletableFuture<()> {
        self.enqueue_commit(offsets, deadline_ms)
    }

    /// Queues an offset fetch and returns a future resolving to the
    /// committed offsets for the requested partitions.
    pub fn add_offset_fetch_request(
        &mut self,
        partitions: Vec<Partition>,
        deadline_ms: i64,
    ) -> CompletableFuture<HashMap<Partition, i64>> {
        let (user_completable, user_future) = Reaper::track::<HashMap<Partition, i64>>(&self.reaper, deadline_ms);
        let (wire_completion, wire_future) = Reaper::track::<RequestOutcome>(&self.reaper, deadline_ms);
        let membership = self.membership.borrow();
        let body = RequestBody::OffsetFetch {
            group_id: self.group_id.clone(),
            member_id: membership.member_id().clone(),
            partitions,
        };
        drop(membership);
        self.outbox.push(UnsentRequest {
            body,
            target_node: self.target_node(),
            deadline_ms,
            completion: wire_completion,
        });
        self.pending.push(PendingRequest {
            future: wire_future,
            kind: PendingKind::Fetch(user_completable),
        });
        user_future
    }

    /// Revocation-time commit: a no-op already-resolved future if auto
    /// commit is off or there are no tracked positions; otherwise a real
    /// commit whose outcome (success OR failure) unblocks the caller
    /// without propagating the error — a failed commit never blocks
    /// revocation.
    pub fn maybe_auto_commit_sync_before_revocation(&mut self, deadline_ms: i64) -> CompletableFuture<()> {
        if !self.auto_commit_enabled || self.positions.is_empty() {
            return crate::reaper::resolved(&self.reaper, ());
        }
        let offsets = self.positions.clone();
        self.enqueue_commit(offsets, deadline_ms)
    }

    fn fire_auto_commit(&mut self, now_ms: i64) {
        self.auto_commit_timer.reset(now_ms);
        let offsets = self.positions.clone();
        let _ = self.enqueue_commit(offsets, now_ms + 30_000);
    }

    /// Fires an auto-commit immediately instead of waiting for the timer,
    /// used when the assigned positions change mid-interval. The commit's
    /// own outcome, success or failure, is not surfaced to the caller here.
    pub fn trigger_async_auto_commit(&mut self, now_ms: i64) {
        if self.auto_commit_enabled && !self.positions.is_empty() {
            self.fire_auto_commit(now_ms);
        }
    }

    fn resolve(kind: PendingKind, result: Result<RequestOutcome, GroupError>) {
        match kind {
            PendingKind::Commit(completable) => match result {
                Ok(RequestOutcome::Response { body: ResponseBody::OffsetCommit { error: None }, .. }) => {
                    completable.resolve(());
                }
                Ok(RequestOutcome::Response { body: ResponseBody::OffsetCommit { error: Some(msg) }, .. }) => {
                    completable.fail(GroupError::Commit(msg));
                }
                Ok(_) => completable.fail(GroupError::Commit("unexpected response to offset commit".into())),
                Err(err) => completable.fail(err),
            },
            PendingKind::Fetch(completable) => match result {
                Ok(RequestOutcome::Response { body: ResponseBody::OffsetFetch { offsets }, .. }) => {
                    completable.resolve(offsets);
                }
                Ok(_) => completable.fail(GroupError::Commit("unexpected response to offset fetch".into())),
                Err(err) => completable.fail(err),
            },
        }
    }
}

impl RequestManager for CommitManager {
    fn poll(&mut self, now_ms: i64) -> PollResult {
        let mut still_pending = Vec::with_capacity(self.pending.len());
        for mut entry in self.pending.drain(..) {
            match entry.future.try_take() {
                None => still_pending.push(entry),
                Some(result) => Self::resolve(entry.kind, result),
            }
        }
        self.pending = still_pending;

        let coordinator_known = !self.coordinator.borrow().is_unknown();

        if self.auto_commit_enabled
            && self.auto_commit_timer.is_expired(now_ms)
            && !self.positions.is_empty()
            && coordinator_known
        {
            self.fire_auto_commit(now_ms);
        }

        let mut result = PollResult::wake_at(self.auto_commit_timer.remaining_ms(now_ms) + now_ms);
        // Requests keep queuing here, untouched, until the coordinator cell
        // is set; nothing is ever sent to an unresolved node.
        if coordinator_known {
            result.unsent = std::mem::take(&mut self.outbox);
        }
        result
    }

    fn max_time_to_wait(&self, now_ms: i64) -> i64 {
        self.auto_commit_timer.remaining_ms(now_ms)
    }

    fn name(&self) -> &'static str {
        "commit"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kcgroup_types::TopicId;
    use uuid::Uuid;

    fn manager() -> (CommitManager, Rc<RefCell<CoordinatorManager>>) {
        let reaper = Reaper::new();
        let membership = Rc::new(RefCell::new(MembershipManager::new(None, Rc::clone(&reaper))));
        let coordinator = Rc::new(RefCell::new(CoordinatorManager::new(
            "g1".into(),
            10_000,
            0,
            Rc::clone(&reaper),
        )));
        let commit = CommitManager::new("g1".into(), true, 5_000, 0, membership, Rc::clone(&coordinator), reaper);
        (commit, coordinator)
    }

    #[test]
    fn no_positions_auto_commit_is_already_resolved() {
        let (mut m, _coordinator) = manager();
        let future = m.maybe_auto_commit_sync_before_revocation(1_000);
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(async {
                assert_eq!(future.wait().await, Ok(()));
            });
    }

    #[test]
    fn commit_request_waits_for_a_known_coordinator_before_it_is_sent() {
        let (mut m, coordinator) = manager();
        let t1 = TopicId::from_uuid(Uuid::from_u128(1));
        let mut offsets = HashMap::new();
        offsets.insert(Partition::new(t1, 0), 42);
        let _future = m.add_offset_commit_request(offsets, 1_000);

        let result = m.poll(0);
        assert!(result.unsent.is_empty(), "must not emit while the coordinator is unresolved");

        coordinator.borrow_mut().set_coordinator("broker-1".into());
        let result = m.poll(0);
        assert_eq!(result.unsent.len(), 1);
        assert!(matches!(result.unsent[0].body, RequestBody::OffsetCommit { .. }));
    }
}
