//! Metadata cache contract. A read-through, read-mostly cache the
//! core consults to resolve `TopicId -> TopicName`; mutation happens
//! out-of-band and is observed only through `topic_names()` returning more
//! entries on a later call.

use std::collections::HashMap;

use kcgroup_types::{TopicId, TopicName};

pub trait MetadataCache {
    /// Currently known `TopicId -> TopicName` mappings. Stale reads are
    /// tolerated; an unresolved id simply stays in the reconciliation
    /// engine's awaiting-metadata set until a later call resolves it.
    fn topic_names(&self) -> HashMap<TopicId, TopicName>;

    /// Requests a refresh. `force` bypasses the cache's own backoff.
    fn request_update(&mut self, force: bool);
}
