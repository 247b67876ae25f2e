//! Error taxonomy for the group membership core.
//!
//! The reactor never throws: every fallible operation either resolves a
//! [`crate::GroupError`] onto a completable future/event, or — for fatal
//! broker errors — delivers one once to the background queue. This enum is
//! the shape callers match on; it is distinct from the heartbeat wire error
//! codes in `kcgroup-core::heartbeat`, which get folded into it.

use thiserror::Error;

/// Top-level error surfaced to callers of the group membership core.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum GroupError {
    /// Retriable network/transport failure; backoff already applied before
    /// this is ever surfaced (it is not user-visible unless a deadline
    /// elapses first).
    #[error("transient request failure: {0}")]
    Retriable(String),

    /// The coordinator is unknown or has moved; rediscovery has already been
    /// scheduled.
    #[error("group coordinator unavailable")]
    CoordinatorUnavailable,

    /// The coordinator reported it is still loading group metadata.
    #[error("group coordinator is loading")]
    CoordinatorLoading,

    /// Epoch or member id was rejected by the coordinator; the member must
    /// rejoin. Not user-visible as an error — it drives a state transition.
    #[error("member fenced from group")]
    Fenced,

    /// Unrecoverable broker-reported condition. The member moves to
    /// `FATAL` and stays there.
    #[error("fatal group membership error: {0}")]
    Fatal(#[from] FatalReason),

    /// A commit request failed at the broker. Does not block revocation.
    #[error("offset commit failed: {0}")]
    Commit(String),

    /// A user-supplied rebalance-listener callback raised. Recorded, does
    /// not desync the state machine; surfaced on the next user-visible call.
    #[error("rebalance listener callback failed: {0}")]
    Callback(String),

    /// The underlying transport reported a disconnect while a request was
    /// in flight.
    #[error("disconnected from coordinator")]
    Disconnected,

    /// A completable event's deadline elapsed before it resolved.
    #[error("operation timed out")]
    Timeout,

    /// The event was cancelled, typically during reactor shutdown.
    #[error("operation cancelled")]
    Cancelled,

    /// An internal invariant was violated. Only raised in debug builds; in
    /// release the reactor logs a warning and ignores the offending
    /// transition instead.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

/// Broker conditions that move the member to `FATAL` with no recovery path.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum FatalReason {
    #[error("group authorization failed")]
    GroupAuthorizationFailed,
    #[error("static member instance id is still owned by another member")]
    UnreleasedInstanceId,
    #[error("invalid request sent to coordinator")]
    InvalidRequest,
    #[error("group has reached its maximum size")]
    GroupMaxSizeReached,
    #[error("assignor is not supported by the coordinator")]
    UnsupportedAssignor,
    #[error("coordinator does not support the request version in use")]
    UnsupportedVersion,
    #[error("unrecoverable error: {0}")]
    Other(String),
}

impl GroupError {
    /// `true` for errors that never put the member in `FATAL`.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, GroupError::Fatal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_wraps_reason() {
        let err: GroupError = FatalReason::UnreleasedInstanceId.into();
        assert!(!err.is_recoverable());
        assert_eq!(
            err.to_string(),
            "fatal group membership error: static member instance id is still owned by another member"
        );
    }

    #[test]
    fn non_fatal_is_recoverable() {
        assert!(GroupError::CoordinatorLoading.is_recoverable());
        assert!(GroupError::Fenced.is_recoverable());
    }
}
