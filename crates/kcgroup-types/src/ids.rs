//! Identifiers used throughout the membership and reconciliation core.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque 128-bit topic identifier assigned by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TopicId(Uuid);

impl TopicId {
    #[must_use]
    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for TopicId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Non-empty, human-readable topic name. Resolved from a [`TopicId`] through
/// the metadata cache and may lag the id by one refresh.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TopicName(String);

impl TopicName {
    /// Returns `None` if `name` is empty.
    pub fn new(name: impl Into<String>) -> Option<Self> {
        let name = name.into();
        if name.is_empty() {
            None
        } else {
            Some(Self(name))
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// `(TopicId, partition_index)` with stable equality on both fields. The
/// human-readable form is derived separately through the metadata cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Partition {
    pub topic_id: TopicId,
    pub partition_index: i32,
}

impl Partition {
    #[must_use]
    pub const fn new(topic_id: TopicId, partition_index: i32) -> Self {
        Self {
            topic_id,
            partition_index,
        }
    }
}

/// Non-empty member id assigned by the coordinator on first successful join.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct MemberId(String);

impl MemberId {
    #[must_use]
    pub fn empty() -> Self {
        Self(String::new())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        if id.is_empty() {
            None
        } else {
            Some(Self(id))
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Coordinator-assigned incarnation number. `0` means "not yet joined",
/// `-1` is a dynamic leave, `-2` is a static leave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemberEpoch(pub i32);

impl MemberEpoch {
    pub const NOT_JOINED: Self = Self(0);
    pub const LEAVE_DYNAMIC: Self = Self(-1);
    pub const LEAVE_STATIC: Self = Self(-2);

    #[must_use]
    pub const fn is_leaving(self) -> bool {
        self.0 == Self::LEAVE_DYNAMIC.0 || self.0 == Self::LEAVE_STATIC.0
    }
}

impl fmt::Display for MemberEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl Default for MemberEpoch {
    fn default() -> Self {
        Self::NOT_JOINED
    }
}
