//! The network client adapter contract and the narrow request/
//! response bodies the core requires. Wire serialization and the actual
//! socket I/O live outside the core; this module only fixes the shape of
//! the few request kinds the managers in this crate issue.

use std::collections::HashMap;

use kcgroup_types::{MemberEpoch, MemberId, Partition, TopicId, TopicName};

use crate::heartbeat::{HeartbeatErrorCode, StatusEntry};
use crate::reaper::Completable;

/// Request bodies the core can ask the network client to send. Opaque
/// beyond what the managers need to fill in and read back.
#[derive(Debug, Clone)]
pub enum RequestBody {
    Heartbeat(HeartbeatRequestData),
    FindCoordinator { group_id: String },
    OffsetCommit {
        group_id: String,
        member_id: MemberId,
        member_epoch: MemberEpoch,
        offsets: HashMap<Partition, i64>,
    },
    OffsetFetch {
        group_id: String,
        member_id: MemberId,
        partitions: Vec<Partition>,
    },
    ListOffsets {
        timestamps: HashMap<Partition, i64>,
        require_timestamps: bool,
    },
    Metadata { topics: Vec<TopicId> },
}

/// The response counterpart of [`RequestBody`].
#[derive(Debug, Clone)]
pub enum ResponseBody {
    Heartbeat(HeartbeatResponseData),
    FindCoordinator { node: String },
    OffsetCommit { error: Option<String> },
    OffsetFetch { offsets: HashMap<Partition, i64> },
    ListOffsets { offsets: HashMap<Partition, (i64, i64)> },
    Metadata { topic_names: HashMap<TopicId, TopicName> },
}

/// The heartbeat request fields, sent only when changed since the last
/// successful send.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatRequestData {
    pub group_id: String,
    pub member_id: MemberId,
    pub member_epoch: MemberEpoch,
    pub group_instance_id: Option<String>,
    pub rebalance_timeout_ms: Option<i32>,
    pub subscribed_topics: Option<Vec<TopicId>>,
    pub current_assignment: Option<Vec<(TopicId, Vec<i32>)>>,
}

/// The heartbeat response fields the core requires.
#[derive(Debug, Clone)]
pub struct HeartbeatResponseData {
    pub error: HeartbeatErrorCode,
    pub member_id: MemberId,
    pub member_epoch: MemberEpoch,
    pub heartbeat_interval_ms: i32,
    pub assignment: Option<Vec<(TopicId, Vec<i32>)>>,
    pub status: Vec<StatusEntry>,
}

/// A failed transport-level attempt, distinct from a broker-level error
/// code carried inside a successfully-decoded response.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("disconnected from broker")]
    Disconnected,
    #[error("request timed out in flight")]
    TimedOut,
    #[error("i/o error: {0}")]
    Io(String),
}

/// The terminal outcome of a single request.
#[derive(Debug, Clone)]
pub enum RequestOutcome {
    Response { body: ResponseBody, latency_ms: i64 },
    Failure { error: TransportError, latency_ms: i64 },
}

/// A request a manager wants sent, paired with its completion slot and an
/// absolute deadline the reaper will enforce if the network client never
/// calls back.
pub struct UnsentRequest {
    pub body: RequestBody,
    pub target_node: Option<String>,
    pub deadline_ms: i64,
    pub completion: Completable<RequestOutcome>,
}

/// External collaborator: batches unsent requests and drives I/O,
/// delivering each response or disconnect through the request's own
/// completion slot.
pub trait NetworkClient {
    fn send_all(&mut self, requests: Vec<UnsentRequest>);

    /// Drives I/O for up to `timeout_ms`, delivering any responses that
    /// arrived by calling `completion.resolve(..)` on the corresponding
    /// `UnsentRequest`.
    fn poll(&mut self, timeout_ms: i64, now_ms: i64);
}
