//! Application events: the tagged sum type the user-facing API thread
//! enqueues and the [`crate::processor::ApplicationEventProcessor`]
//! dispatches exhaustively.

use std::collections::HashMap;

use kcgroup_types::{OffsetAndTimestamp, Partition, TopicId, TopicName};
use tokio::sync::oneshot;

use kcgroup_types::GroupError;

use crate::subscription::RebalanceMethod;

/// The result carried by events that chain a manager future to their
/// reply.
#[derive(Debug, Clone)]
pub enum EventOutcome {
    Unit,
    CommittedOffsets(HashMap<Partition, i64>),
    Offsets(HashMap<Partition, OffsetAndTimestamp>),
    TopicMetadata(HashMap<TopicId, TopicName>),
}

pub(crate) type Reply = oneshot::Sender<Result<EventOutcome, GroupError>>;

/// One application-thread request. Every variant that produces a result
/// carries its own reply channel; fire-and-forget variants carry none.
pub enum ApplicationEvent {
    Poll { poll_time_ms: i64 },
    Commit { offsets: HashMap<Partition, i64>, reply: Reply },
    FetchCommittedOffset { partitions: Vec<Partition>, reply: Reply },
    MetadataUpdate { new_topics: Vec<TopicId> },
    AssignmentChange { offsets: HashMap<Partition, i64>, now_ms: i64 },
    TopicMetadata { topic: TopicId, reply: Reply },
    ListOffsets { timestamps: HashMap<Partition, i64>, require_timestamps: bool, reply: Reply },
    ResetPositions,
    ValidatePositions,
    SubscriptionChange,
    Unsubscribe { reply: Reply },
    RebalanceListenerCallbackCompleted {
        method: RebalanceMethod,
        generation: u64,
        error: Option<String>,
    },
    WaitForJoinGroup { reply: Reply },
}

impl ApplicationEvent {
    /// A short name for logging, since the full event may embed large
    /// payloads.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ApplicationEvent::Poll { .. } => "poll",
            ApplicationEvent::Commit { .. } => "commit",
            ApplicationEvent::FetchCommittedOffset { .. } => "fetch_committed_offset",
            ApplicationEvent::MetadataUpdate { .. } => "metadata_update",
            ApplicationEvent::AssignmentChange { .. } => "assignment_change",
            ApplicationEvent::TopicMetadata { .. } => "topic_metadata",
            ApplicationEvent::ListOffsets { .. } => "list_offsets",
            ApplicationEvent::ResetPositions => "reset_positions",
            ApplicationEvent::ValidatePositions => "validate_positions",
            ApplicationEvent::SubscriptionChange => "subscription_change",
            ApplicationEvent::Unsubscribe { .. } => "unsubscribe",
            ApplicationEvent::RebalanceListenerCallbackCompleted { .. } => {
                "rebalance_listener_callback_completed"
            }
            ApplicationEvent::WaitForJoinGroup { .. } => "wait_for_join_group",
        }
    }
}
