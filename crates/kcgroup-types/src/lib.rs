//! Shared data model for the consumer group membership core.
//!
//! Everything in this crate is wire-agnostic: identifiers, the canonicalised
//! assignment representation, and the error taxonomy that callers of
//! `kcgroup-core` match on. Serialization, the network client, and the
//! broker wire format itself live outside this crate's scope.

pub mod assignment;
pub mod error;
pub mod ids;
pub mod offset;

pub use assignment::Assignment;
pub use error::{FatalReason, GroupError};
pub use ids::{MemberEpoch, MemberId, Partition, TopicId, TopicName};
pub use offset::OffsetAndTimestamp;
