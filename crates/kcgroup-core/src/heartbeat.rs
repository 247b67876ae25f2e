//! The heartbeat request manager: the only manager that runs
//! continuously while the member is joined, carrying membership liveness,
//! topology changes and reconciled assignments, and translating every wire
//! error code into a membership state transition.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use kcgroup_types::{Assignment, MemberEpoch, MemberId, Partition, TopicId};

use crate::coordinator::CoordinatorManager;
use crate::membership::{MembershipManager, MembershipState, SentHeartbeatKind};
use crate::network::{HeartbeatRequestData, HeartbeatResponseData, RequestBody, RequestOutcome, ResponseBody, UnsentRequest};
use crate::reaper::{CompletableFuture, Reaper};
use crate::request_manager::{PollResult, RequestManager, Retry};
use crate::subscription::SubscriptionState;
use crate::time::Timer;

/// Wire error codes a heartbeat response can carry. `Other` is the
/// catch-all for anything the coordinator sends that this member doesn't
/// specifically recognize — treated as fatal by default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatErrorCode {
    None,
    NotCoordinator,
    CoordinatorNotAvailable,
    CoordinatorLoadInProgress,
    GroupAuthorizationFailed,
    UnreleasedInstanceId,
    InvalidRequest,
    GroupMaxSizeReached,
    UnsupportedAssignor,
    UnsupportedVersion,
    FencedMemberEpoch,
    UnknownMemberId,
    Other(String),
}

/// An informational status line the coordinator attaches to a response,
/// surfaced to the application rather than acted on by the state machine.
#[derive(Debug, Clone)]
pub struct StatusEntry {
    pub status_code: i32,
    pub status_detail: String,
}

/// Caches the fields most recently sent successfully, so the next request
/// only carries what changed since.
#[derive(Default)]
struct SentFields {
    group_instance_id: Option<String>,
    subscribed_topics: Option<Vec<TopicId>>,
    rebalance_timeout_ms: Option<i32>,
    assignment: Option<Assignment>,
}

impl SentFields {
    fn invalidate(&mut self) {
        *self = Self::default();
    }
}

pub struct HeartbeatManager {
    group_id: String,
    rebalance_timeout_ms: i32,
    membership: Rc<RefCell<MembershipManager>>,
    coordinator: Rc<RefCell<CoordinatorManager>>,
    subscription: Rc<RefCell<dyn SubscriptionState>>,
    reaper: Rc<RefCell<Reaper>>,
    retry: Retry,
    heartbeat_timer: Timer,
    poll_timer: Timer,
    sent: SentFields,
    pending: Option<CompletableFuture<RequestOutcome>>,
    in_flight_kind: Option<SentHeartbeatKind>,
    request_timeout_ms: i64,
}

impl HeartbeatManager {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        group_id: String,
        rebalance_timeout_ms: i32,
        max_poll_interval_ms: i64,
        request_timeout_ms: i64,
        now_ms: i64,
        membership: Rc<RefCell<MembershipManager>>,
        coordinator: Rc<RefCell<CoordinatorManager>>,
        subscription: Rc<RefCell<dyn SubscriptionState>>,
        reaper: Rc<RefCell<Reaper>>,
    ) -> Self {
        Self {
            group_id,
            rebalance_timeout_ms,
            membership,
            coordinator,
            subscription,
            reaper,
            retry: Retry::new(now_ms, Duration::from_millis(100), Duration::from_secs(30)),
            heartbeat_timer: Timer::expired_now(now_ms, 3_000),
            poll_timer: Timer::expired_now(now_ms, max_poll_interval_ms),
            sent: SentFields::default(),
            pending: None,
            in_flight_kind: None,
            request_timeout_ms,
        }
    }

    /// Resets the poll timer; called by the application thread on every
    /// `poll()` call.
    pub fn note_application_poll(&mut self, now_ms: i64) {
        self.poll_timer.reset(now_ms);
        self.membership.borrow_mut().maybe_rejoin_stale_member();
    }

    fn build_request(&mut self, now_ms: i64, kind: SentHeartbeatKind) -> HeartbeatRequestData {
        let membership = self.membership.borrow();
        let member_epoch = match kind {
            SentHeartbeatKind::Regular => membership.member_epoch(),
            SentHeartbeatKind::Leave | SentHeartbeatKind::PollTimerLeave => membership
                .pending_leave_epoch()
                .unwrap_or(MemberEpoch::LEAVE_DYNAMIC),
        };
        let member_id = membership.member_id().clone();
        let is_first_join = member_id.is_empty();

        let subscribed_topics = self.subscription.borrow().subscribed_topics();
        let topics_changed = self.sent.subscribed_topics.as_deref() != Some(subscribed_topics.as_slice());
        let rebalance_timeout_changed = self.sent.rebalance_timeout_ms != Some(self.rebalance_timeout_ms);
        let current_assignment = membership.current_assignment().clone();
        let assignment_changed = self.sent.assignment.as_ref() != Some(&current_assignment);

        let mut data = HeartbeatRequestData {
            group_id: self.group_id.clone(),
            member_id,
            member_epoch,
            ..HeartbeatRequestData::default()
        };

        if is_first_join {
            data.group_instance_id = self.sent.group_instance_id.clone().or_else(|| membership.group_instance_id().map(str::to_string));
            data.rebalance_timeout_ms = Some(self.rebalance_timeout_ms);
            data.subscribed_topics = Some(subscribed_topics.clone());
            data.current_assignment = Some(current_assignment.iter().map(|p| (p.topic_id, vec![p.partition_index])).collect());
        } else {
            if rebalance_timeout_changed {
                data.rebalance_timeout_ms = Some(self.rebalance_timeout_ms);
            }
            if topics_changed {
                data.subscribed_topics = Some(subscribed_topics.clone());
            }
            if assignment_changed {
                data.current_assignment = Some(group_by_topic(&current_assignment));
            }
        }

        self.sent.rebalance_timeout_ms = Some(self.rebalance_timeout_ms);
        self.sent.subscribed_topics = Some(subscribed_topics);
        self.sent.assignment = Some(current_assignment);
        data
    }

    fn handle_outcome(&mut self, outcome: Result<RequestOutcome, kcgroup_types::GroupError>, now_ms: i64) {
        self.retry.clear_in_flight();
        let kind = self.in_flight_kind.take().unwrap_or(SentHeartbeatKind::Regular);
        match outcome {
            Ok(RequestOutcome::Response { body: ResponseBody::Heartbeat(data), .. }) => {
                self.handle_response(data, kind, now_ms);
            }
            Ok(RequestOutcome::Response { .. }) => {
                tracing::error!("heartbeat manager received a non-heartbeat response body");
            }
            Ok(RequestOutcome::Failure { error, .. }) => {
                tracing::debug!(%error, "heartbeat transport failure");
                self.retry.record_failure(now_ms);
                self.membership
                    .borrow_mut()
                    .on_heartbeat_failure(true, Some(error.to_string()));
            }
            Err(err) => {
                self.retry.record_failure(now_ms);
                let recoverable = err.is_recoverable();
                self.membership
                    .borrow_mut()
                    .on_heartbeat_failure(recoverable, Some(err.to_string()));
            }
        }
    }

    fn handle_response(&mut self, data: HeartbeatResponseData, kind: SentHeartbeatKind, now_ms: i64) {
        if data.heartbeat_interval_ms > 0 {
            self.heartbeat_timer.set_interval(i64::from(data.heartbeat_interval_ms));
        }
        for status in &data.status {
            tracing::info!(code = status.status_code, detail = %status.status_detail, "group status");
        }

        match data.error {
            HeartbeatErrorCode::None => {
                self.retry.record_success();
                self.heartbeat_timer.reset(now_ms);
                let assignment = data.assignment.as_ref().map(|raw| {
                    Assignment::from_partitions(raw.iter().flat_map(|(topic_id, indices)| {
                        indices.iter().map(move |&i| Partition::new(*topic_id, i))
                    }))
                });
                let mut membership = self.membership.borrow_mut();
                membership.on_heartbeat_success(data.member_id, data.member_epoch, assignment);
                membership.on_heartbeat_request_generated(kind);
            }
            HeartbeatErrorCode::NotCoordinator | HeartbeatErrorCode::CoordinatorNotAvailable => {
                self.coordinator.borrow_mut().mark_coordinator_unknown(now_ms);
                self.retry.clear_backoff(now_ms);
                self.sent.invalidate();
            }
            HeartbeatErrorCode::CoordinatorLoadInProgress => {
                self.retry.record_failure(now_ms);
            }
            HeartbeatErrorCode::GroupAuthorizationFailed
            | HeartbeatErrorCode::UnreleasedInstanceId
            | HeartbeatErrorCode::InvalidRequest
            | HeartbeatErrorCode::GroupMaxSizeReached
            | HeartbeatErrorCode::UnsupportedAssignor
            | HeartbeatErrorCode::UnsupportedVersion => {
                self.membership
                    .borrow_mut()
                    .transition_to_fatal(format!("{:?}", data.error));
            }
            HeartbeatErrorCode::FencedMemberEpoch | HeartbeatErrorCode::UnknownMemberId => {
                self.sent.invalidate();
                self.membership.borrow_mut().on_fenced();
            }
            HeartbeatErrorCode::Other(ref code) => {
                self.membership
                    .borrow_mut()
                    .transition_to_fatal(format!("unrecognized heartbeat error code: {code}"));
            }
        }
    }

    fn next_wake_ms(&self, now_ms: i64) -> i64 {
        self.heartbeat_timer
            .remaining_ms(now_ms)
            .min(self.poll_timer.remaining_ms(now_ms))
            .max(0)
            + now_ms
    }
}

fn group_by_topic(assignment: &Assignment) -> Vec<(TopicId, Vec<i32>)> {
    assignment
        .topic_ids()
        .map(|topic_id| {
            let indices = assignment
                .iter()
                .filter(|p| p.topic_id == topic_id)
                .map(|p| p.partition_index)
                .collect();
            (topic_id, indices)
        })
        .collect()
}

impl RequestManager for HeartbeatManager {
    fn poll(&mut self, now_ms: i64) -> PollResult {
        if let Some(mut pending) = self.pending.take() {
            match pending.try_take() {
                Some(result) => self.handle_outcome(result, now_ms),
                None => {
                    self.pending = Some(pending);
                    return PollResult::wake_at(self.next_wake_ms(now_ms));
                }
            }
        }

        if self.coordinator.borrow().is_unknown() {
            return PollResult::wake_at(self.next_wake_ms(now_ms));
        }

        if self.poll_timer.is_expired(now_ms)
            && !matches!(
                self.membership.borrow().state(),
                MembershipState::Stale | MembershipState::Unsubscribed | MembershipState::Fatal
            )
        {
            self.poll_timer.reset(now_ms);
            self.membership
                .borrow_mut()
                .transition_to_sending_leave_group(true);
            return self.send_heartbeat(now_ms, SentHeartbeatKind::PollTimerLeave);
        }

        let state = self.membership.borrow().state();
        let should_send = self.membership.borrow().should_heartbeat_now();

        if should_send && self.retry.ready(now_ms) && self.heartbeat_timer.is_expired(now_ms) {
            let kind = if matches!(state, MembershipState::Leaving) {
                SentHeartbeatKind::Leave
            } else {
                SentHeartbeatKind::Regular
            };
            return self.send_heartbeat(now_ms, kind);
        }

        PollResult::wake_at(self.next_wake_ms(now_ms))
    }

    fn max_time_to_wait(&self, now_ms: i64) -> i64 {
        (self.next_wake_ms(now_ms) - now_ms).max(0)
    }

    fn name(&self) -> &'static str {
        "heartbeat"
    }
}

impl HeartbeatManager {
    fn send_heartbeat(&mut self, now_ms: i64, kind: SentHeartbeatKind) -> PollResult {
        let body = RequestBody::Heartbeat(self.build_request(now_ms, kind));
        let (completion, future) = Reaper::track::<RequestOutcome>(&self.reaper, now_ms + self.request_timeout_ms);
        self.retry.mark_in_flight();
        self.pending = Some(future);
        self.in_flight_kind = Some(kind);
        let target_node = self.coordinator.borrow().known_coordinator().map(str::to_string);
        PollResult::empty().with_request(UnsentRequest {
            body,
            target_node,
            deadline_ms: now_ms + self.request_timeout_ms,
            completion,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reaper::Reaper as ReaperCtor;
    use kcgroup_types::Assignment as AssignmentType;

    struct FixedSubscription;
    impl SubscriptionState for FixedSubscription {
        fn assigned_partitions(&self) -> AssignmentType {
            AssignmentType::new()
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
        fn assign_from_subscribed(&mut self, _partitions: AssignmentType) {}
        fn assign_from_subscribed_awaiting_callback(&mut self, _all: AssignmentType, _added: AssignmentType) {}
        fn enable_partitions_awaiting_callback(&mut self, _added: &AssignmentType) {}
        fn mark_pending_revocation(&mut self, _revoked: &AssignmentType) {}
    }

    fn setup() -> (HeartbeatManager, Rc<RefCell<MembershipManager>>, Rc<RefCell<CoordinatorManager>>) {
        let reaper = ReaperCtor::new();
        let membership = Rc::new(RefCell::new(MembershipManager::new(None, Rc::clone(&reaper))));
        let coordinator = Rc::new(RefCell::new(CoordinatorManager::new("g1".into(), 10_000, 0, Rc::clone(&reaper))));
        let subscription: Rc<RefCell<dyn SubscriptionState>> = Rc::new(RefCell::new(FixedSubscription));
        let manager = HeartbeatManager::new(
            "g1".into(),
            45_000,
            300_000,
            10_000,
            0,
            Rc::clone(&membership),
            Rc::clone(&coordinator),
            subscription,
            reaper,
        );
        (manager, membership, coordinator)
    }

    #[test]
    fn first_poll_sends_full_topology_heartbeat() {
        let (mut manager, membership, coordinator) = setup();
        coordinator.borrow_mut().set_coordinator("broker-1".into());
        membership.borrow_mut().begin_joining();
        let result = manager.poll(0);
        assert_eq!(result.unsent.len(), 1);
        match &result.unsent[0].body {
            RequestBody::Heartbeat(data) => {
                assert!(data.rebalance_timeout_ms.is_some());
                assert!(data.subscribed_topics.is_some());
            }
            _ => panic!("expected heartbeat body"),
        }
    }
}
