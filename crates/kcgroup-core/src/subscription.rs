//! Subscription state contract: the mutable object holding
//! assigned partitions and the user's rebalance listener. Owned externally;
//! the reconciliation engine is the only part of the core allowed to mutate
//! it, and only while holding the single in-flight reconciliation.

use kcgroup_types::{Assignment, Partition, TopicId};

/// Identifies which rebalance-listener callback a [`CallbackRequest`] is
/// for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RebalanceMethod {
    OnPartitionsRevoked,
    OnPartitionsAssigned,
    OnPartitionsLost,
}

pub trait SubscriptionState {
    fn assigned_partitions(&self) -> Assignment;

    /// Topics the application has subscribed to, independent of whatever
    /// has actually been assigned — carried on the heartbeat whenever it
    /// changes since the last send.
    fn subscribed_topics(&self) -> Vec<TopicId>;

    fn has_auto_assigned_partitions(&self) -> bool;

    /// Whether a rebalance listener is registered at all; reconciliation
    /// skips the callback round-trip entirely when this is `false`.
    fn has_rebalance_listener(&self) -> bool;

    /// Synchronous assignment replacement with no callback wait — used for
    /// the same-assignment fast path and for releasing everything on fence.
    fn assign_from_subscribed(&mut self, partitions: Assignment);

    /// Replaces the assignment but marks newly-added partitions as awaiting
    /// the `on_partitions_assigned` callback: they are assigned but record
    /// fetching stays disabled for them until `enable_partitions_awaiting_callback`.
    fn assign_from_subscribed_awaiting_callback(&mut self, all: Assignment, added: Assignment);

    fn enable_partitions_awaiting_callback(&mut self, added: &Assignment);

    /// Marks partitions as pending revocation: records for them must no
    /// longer be delivered to the user even before the callback runs.
    fn mark_pending_revocation(&mut self, revoked: &Assignment);
}

/// True when `partition` sits in neither a pending-add nor pending-revoke
/// set relative to `current` — a convenience used by tests asserting the
/// "at most one state per partition" invariant.
#[must_use]
pub fn partition_state_is_exclusive(
    current: &Assignment,
    pending_add: &Assignment,
    pending_revoke: &Assignment,
    partition: Partition,
) -> bool {
    let in_current = current.contains(partition);
    let in_add = pending_add.contains(partition);
    let in_revoke = pending_revoke.contains(partition);
    matches!(
        (in_current, in_add, in_revoke),
        (true, false, false) | (false, true, false) | (false, false, true) | (false, false, false)
    )
}
