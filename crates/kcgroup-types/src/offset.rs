//! Committed-offset and timestamp lookup results.

use serde::{Deserialize, Serialize};

/// A fetched committed offset paired with the broker-side timestamp used to
/// resolve it. `offset < 0` indicates "no commit" for the partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetAndTimestamp {
    pub offset: i64,
    pub timestamp_ms: i64,
}

impl OffsetAndTimestamp {
    #[must_use]
    pub const fn new(offset: i64, timestamp_ms: i64) -> Self {
        Self {
            offset,
            timestamp_ms,
        }
    }

    /// `true` when `offset < 0`, the sentinel for "no commit".
    #[must_use]
    pub const fn is_no_commit(&self) -> bool {
        self.offset < 0
    }
}
