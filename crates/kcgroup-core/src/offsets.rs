//! The offsets request manager: position reset/validation and
//! the `ListOffsets`-backed lookup used by `poll(ListOffsets)` application
//! events.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use kcgroup_types::{GroupError, OffsetAndTimestamp, Partition};

use crate::coordinator::CoordinatorManager;
use crate::network::{RequestBody, RequestOutcome, ResponseBody, UnsentRequest};
use crate::reaper::{Completable, CompletableFuture, Reaper};
use crate::request_manager::{PollResult, RequestManager};
use crate::subscription::SubscriptionState;

struct PendingFetch {
    future: CompletableFuture<RequestOutcome>,
    completable: Completable<HashMap<Partition, OffsetAndTimestamp>>,
}

pub struct OffsetsManager {
    coordinator: Rc<RefCell<CoordinatorManager>>,
    subscription: Rc<RefCell<dyn SubscriptionState>>,
    reaper: Rc<RefCell<Reaper>>,
    outbox: Vec<UnsentRequest>,
    pending: Vec<PendingFetch>,
    reset_needed: bool,
    validate_needed: bool,
}

impl OffsetsManager {
    #[must_use]
    pub fn new(
        coordinator: Rc<RefCell<CoordinatorManager>>,
        subscription: Rc<RefCell<dyn SubscriptionState>>,
        reaper: Rc<RefCell<Reaper>>,
    ) -> Self {
        Self {
            coordinator,
            subscription,
            reaper,
            outbox: Vec::new(),
            pending: Vec::new(),
            reset_needed: false,
            validate_needed: false,
        }
    }

    pub fn mark_reset_needed(&mut self) {
        self.reset_needed = true;
    }

    pub fn mark_validate_needed(&mut self) {
        self.validate_needed = true;
    }

    fn target_node(&self) -> Option<String> {
        self.coordinator.borrow().known_coordinator().map(str::to_string)
    }

    /// Idempotent: a call with nothing pending does nothing.
    pub fn reset_positions_if_needed(&mut self, now_ms: i64) {
        if !self.reset_needed {
            return;
        }
        self.reset_needed = false;
        let partitions = self.subscription.borrow().assigned_partitions();
        if partitions.is_empty() {
            return;
        }
        let timestamps = partitions.iter().map(|p| (p, -1i64)).collect();
        let _ = self.fetch_offsets_internal(timestamps, false, now_ms + 30_000);
    }

    /// Idempotent: a call with nothing pending does nothing.
    pub fn validate_positions_if_needed(&mut self, now_ms: i64) {
        if !self.validate_needed {
            return;
        }
        self.validate_needed = false;
        let partitions = self.subscription.borrow().assigned_partitions();
        if partitions.is_empty() {
            return;
        }
        let timestamps = partitions.iter().map(|p| (p, -1i64)).collect();
        let _ = self.fetch_offsets_internal(timestamps, true, now_ms + 30_000);
    }

    /// `fetch_offsets(timestamps, require_timestamps) -> future<map<Partition, OffsetAndTimestamp>>`.
    pub fn fetch_offsets(
        &mut self,
        timestamps: HashMap<Partition, i64>,
        require_timestamps: bool,
        deadline_ms: i64,
    ) -> CompletableFuture<HashMap<Partition, OffsetAndTimestamp>> {
        self.fetch_offsets_internal(timestamps, require_timestamps, deadline_ms)
    }

    fn fetch_offsets_internal(
        &mut self,
        timestamps: HashMap<Partition, i64>,
        require_timestamps: bool,
        deadline_ms: i64,
    ) -> CompletableFuture<HashMap<Partition, OffsetAndTimestamp>> {
        let (user_completable, user_future) =
            Reaper::track::<HashMap<Partition, OffsetAndTimestamp>>(&self.reaper, deadline_ms);
        let (wire_completion, wire_future) = Reaper::track::<RequestOutcome>(&self.reaper, deadline_ms);
        self.outbox.push(UnsentRequest {
            body: RequestBody::ListOffsets { timestamps, require_timestamps },
            target_node: self.target_node(),
            deadline_ms,
            completion: wire_completion,
        });
        self.pending.push(PendingFetch {
            future: wire_future,
            completable: user_completable,
        });
        user_future
    }

    fn resolve(entry: PendingFetch, result: Result<RequestOutcome, GroupError>) {
        match result {
            Ok(RequestOutcome::Response { body: ResponseBody::ListOffsets { offsets }, .. }) => {
                let mapped = offsets
                    .into_iter()
                    .map(|(p, (offset, timestamp_ms))| (p, OffsetAndTimestamp { offset, timestamp_ms }))
                    .collect();
                entry.completable.resolve(mapped);
            }
            Ok(_) => entry.completable.fail(GroupError::Retriable("unexpected response to list-offsets".into())),
            Err(err) => entry.completable.fail(err),
        }
    }
}

impl RequestManager for OffsetsManager {
    fn poll(&mut self, _now_ms: i64) -> PollResult {
        let mut still_pending = Vec::with_capacity(self.pending.len());
        for mut entry in self.pending.drain(..) {
            match entry.future.try_take() {
                None => still_pending.push(entry),
                Some(result) => Self::resolve(entry, result),
            }
        }
        self.pending = still_pending;

        let mut result = PollResult::empty();
        result.unsent = std::mem::take(&mut self.outbox);
        result
    }

    fn max_time_to_wait(&self, _now_ms: i64) -> i64 {
        i64::MAX
    }

    fn name(&self) -> &'static str {
        "offsets"
    }
}
