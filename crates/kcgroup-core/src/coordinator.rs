//! Tracks the group coordinator node the heartbeat, commit, and offset
//! managers all need to address their requests at. Heartbeat responses
//! carrying `NOT_COORDINATOR`/`COORDINATOR_NOT_AVAILABLE` clear this, which
//! both rediscovers it (this manager issues `FindCoordinator` while
//! unknown) and blocks heartbeat/commit emission until it resolves again.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use crate::network::{RequestBody, RequestOutcome, ResponseBody, UnsentRequest};
use crate::reaper::{CompletableFuture, Reaper};
use crate::request_manager::{PollResult, RequestManager, Retry};

pub struct CoordinatorManager {
    group_id: String,
    request_timeout_ms: i64,
    reaper: Rc<RefCell<Reaper>>,
    retry: Retry,
    node: Option<String>,
    unknown_since_ms: Option<i64>,
    pending: Option<CompletableFuture<RequestOutcome>>,
}

impl CoordinatorManager {
    #[must_use]
    pub fn new(group_id: String, request_timeout_ms: i64, now_ms: i64, reaper: Rc<RefCell<Reaper>>) -> Self {
        Self {
            group_id,
            request_timeout_ms,
            reaper,
            retry: Retry::new(now_ms, Duration::from_millis(100), Duration::from_secs(30)),
            node: None,
            unknown_since_ms: None,
            pending: None,
        }
    }

    #[must_use]
    pub fn known_coordinator(&self) -> Option<&str> {
        self.node.as_deref()
    }

    pub fn set_coordinator(&mut self, node: String) {
        self.node = Some(node);
        self.unknown_since_ms = None;
        self.retry.record_success();
    }

    pub fn mark_coordinator_unknown(&mut self, now_ms: i64) {
        if self.node.take().is_some() {
            tracing::debug!(now_ms, "coordinator marked unknown, rediscovery required");
        }
        self.unknown_since_ms.get_or_insert(now_ms);
        self.retry.clear_backoff(now_ms);
    }

    #[must_use]
    pub fn is_unknown(&self) -> bool {
        self.node.is_none()
    }

    fn handle_outcome(&mut self, outcome: Result<RequestOutcome, kcgroup_types::GroupError>, now_ms: i64) {
        self.retry.clear_in_flight();
        match outcome {
            Ok(RequestOutcome::Response { body: ResponseBody::FindCoordinator { node }, .. }) => {
                tracing::debug!(%node, "discovered group coordinator");
                self.set_coordinator(node);
            }
            Ok(RequestOutcome::Response { .. }) => {
                tracing::error!("coordinator manager received a non-find-coordinator response body");
                self.retry.record_failure(now_ms);
            }
            Ok(RequestOutcome::Failure { error, .. }) => {
                tracing::debug!(%error, "find-coordinator transport failure");
                self.retry.record_failure(now_ms);
            }
            Err(err) => {
                tracing::debug!(%err, "find-coordinator request failed");
                self.retry.record_failure(now_ms);
            }
        }
    }
}

impl RequestManager for CoordinatorManager {
    fn poll(&mut self, now_ms: i64) -> PollResult {
        if let Some(mut pending) = self.pending.take() {
            match pending.try_take() {
                Some(result) => self.handle_outcome(result, now_ms),
                None => {
                    self.pending = Some(pending);
                    return PollResult::wake_at(self.retry.next_attempt_ms().max(now_ms));
                }
            }
        }

        if !self.is_unknown() || !self.retry.ready(now_ms) {
            return PollResult::wake_at(self.retry.next_attempt_ms().max(now_ms));
        }

        let (completion, future) = Reaper::track::<RequestOutcome>(&self.reaper, now_ms + self.request_timeout_ms);
        self.retry.mark_in_flight();
        self.pending = Some(future);
        PollResult::empty().with_request(UnsentRequest {
            body: RequestBody::FindCoordinator { group_id: self.group_id.clone() },
            target_node: None,
            deadline_ms: now_ms + self.request_timeout_ms,
            completion,
        })
    }

    fn max_time_to_wait(&self, now_ms: i64) -> i64 {
        (self.retry.next_attempt_ms() - now_ms).max(0)
    }

    fn name(&self) -> &'static str {
        "coordinator"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> CoordinatorManager {
        CoordinatorManager::new("g1".into(), 10_000, 0, Reaper::new())
    }

    #[test]
    fn unknown_until_discovered() {
        let mut c = manager();
        assert!(c.is_unknown());
        c.set_coordinator("broker-1".into());
        assert_eq!(c.known_coordinator(), Some("broker-1"));
        c.mark_coordinator_unknown(10);
        assert!(c.is_unknown());
    }

    #[test]
    fn poll_sends_find_coordinator_while_unknown() {
        let mut c = manager();
        let result = c.poll(0);
        assert_eq!(result.unsent.len(), 1);
        assert!(matches!(result.unsent[0].body, RequestBody::FindCoordinator { .. }));
    }

    #[test]
    fn poll_is_quiet_once_coordinator_is_known() {
        let mut c = manager();
        c.set_coordinator("broker-1".into());
        let result = c.poll(0);
        assert!(result.unsent.is_empty());
    }
}
