//! Group membership configuration and its builder, assembled once up front
//! the same way any long-lived host config is: field by field, validated
//! only when `build()` is finally called.

use std::time::Duration;

/// Immutable configuration for one `Reactor` instance. Constructed once at
/// startup via [`GroupConfigBuilder`]; nothing in the reactor mutates it.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupConfig {
    pub group_id: String,
    pub group_instance_id: Option<String>,
    pub session_timeout_ms: i64,
    pub rebalance_timeout_ms: i32,
    pub heartbeat_interval_ms: i64,
    pub max_poll_interval_ms: i64,
    pub request_timeout_ms: i64,
    pub auto_commit_enabled: bool,
    pub auto_commit_interval_ms: i64,
}

impl GroupConfig {
    #[must_use]
    pub fn builder(group_id: impl Into<String>) -> GroupConfigBuilder {
        GroupConfigBuilder::new(group_id)
    }
}

/// Builder for [`GroupConfig`], validated on [`GroupConfigBuilder::build`]
/// rather than on each setter, so callers can assemble it field by field in
/// any order.
pub struct GroupConfigBuilder {
    group_id: String,
    group_instance_id: Option<String>,
    session_timeout_ms: i64,
    rebalance_timeout_ms: i32,
    heartbeat_interval_ms: i64,
    max_poll_interval_ms: i64,
    request_timeout_ms: i64,
    auto_commit_enabled: bool,
    auto_commit_interval_ms: i64,
}

/// Raised by [`GroupConfigBuilder::build`] when the assembled configuration
/// would violate a documented constraint.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum GroupConfigError {
    #[error("group_id must not be empty")]
    EmptyGroupId,
    #[error("heartbeat_interval_ms ({heartbeat}) must be less than session_timeout_ms ({session})")]
    HeartbeatExceedsSessionTimeout { heartbeat: i64, session: i64 },
    #[error("max_poll_interval_ms must be positive, got {0}")]
    NonPositivePollInterval(i64),
}

impl GroupConfigBuilder {
    #[must_use]
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            group_instance_id: None,
            session_timeout_ms: 45_000,
            rebalance_timeout_ms: 60_000,
            heartbeat_interval_ms: 3_000,
            max_poll_interval_ms: 300_000,
            request_timeout_ms: 30_000,
            auto_commit_enabled: true,
            auto_commit_interval_ms: 5_000,
        }
    }

    #[must_use]
    pub fn group_instance_id(mut self, id: impl Into<String>) -> Self {
        self.group_instance_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout_ms = timeout.as_millis() as i64;
        self
    }

    #[must_use]
    pub fn rebalance_timeout(mut self, timeout: Duration) -> Self {
        self.rebalance_timeout_ms = timeout.as_millis() as i32;
        self
    }

    #[must_use]
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = interval.as_millis() as i64;
        self
    }

    #[must_use]
    pub fn max_poll_interval(mut self, interval: Duration) -> Self {
        self.max_poll_interval_ms = interval.as_millis() as i64;
        self
    }

    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as i64;
        self
    }

    #[must_use]
    pub fn auto_commit(mut self, enabled: bool, interval: Duration) -> Self {
        self.auto_commit_enabled = enabled;
        self.auto_commit_interval_ms = interval.as_millis() as i64;
        self
    }

    pub fn build(self) -> Result<GroupConfig, GroupConfigError> {
        if self.group_id.is_empty() {
            return Err(GroupConfigError::EmptyGroupId);
        }
        if self.heartbeat_interval_ms >= self.session_timeout_ms {
            return Err(GroupConfigError::HeartbeatExceedsSessionTimeout {
                heartbeat: self.heartbeat_interval_ms,
                session: self.session_timeout_ms,
            });
        }
        if self.max_poll_interval_ms <= 0 {
            return Err(GroupConfigError::NonPositivePollInterval(self.max_poll_interval_ms));
        }
        Ok(GroupConfig {
            group_id: self.group_id,
            group_instance_id: self.group_instance_id,
            session_timeout_ms: self.session_timeout_ms,
            rebalance_timeout_ms: self.rebalance_timeout_ms,
            heartbeat_interval_ms: self.heartbeat_interval_ms,
            max_poll_interval_ms: self.max_poll_interval_ms,
            request_timeout_ms: self.request_timeout_ms,
            auto_commit_enabled: self.auto_commit_enabled,
            auto_commit_interval_ms: self.auto_commit_interval_ms,
        })
    }
}
