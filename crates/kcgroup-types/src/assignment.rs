//! Canonicalised partition assignment: `TopicId -> sorted set of partition indices`.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::ids::{Partition, TopicId};

/// A set of [`Partition`]s, canonicalised so that equality is by value:
/// two assignments compare equal iff their `TopicId -> sorted set<int>` maps
/// are equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment(BTreeMap<TopicId, BTreeSet<i32>>);

impl Assignment {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.values().all(BTreeSet::is_empty)
    }

    pub fn insert(&mut self, partition: Partition) {
        self.0
            .entry(partition.topic_id)
            .or_default()
            .insert(partition.partition_index);
    }

    pub fn remove(&mut self, partition: Partition) {
        if let Some(indices) = self.0.get_mut(&partition.topic_id) {
            indices.remove(&partition.partition_index);
            if indices.is_empty() {
                self.0.remove(&partition.topic_id);
            }
        }
    }

    pub fn contains(&self, partition: Partition) -> bool {
        self.0
            .get(&partition.topic_id)
            .is_some_and(|indices| indices.contains(&partition.partition_index))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.values().map(BTreeSet::len).sum()
    }

    pub fn topic_ids(&self) -> impl Iterator<Item = TopicId> + '_ {
        self.0.keys().copied()
    }

    /// Iterates every `(TopicId, partition_index)` pair in the assignment.
    pub fn iter(&self) -> impl Iterator<Item = Partition> + '_ {
        self.0.iter().flat_map(|(&topic_id, indices)| {
            indices
                .iter()
                .map(move |&index| Partition::new(topic_id, index))
        })
    }

    pub fn from_partitions(partitions: impl IntoIterator<Item = Partition>) -> Self {
        let mut assignment = Self::new();
        for partition in partitions {
            assignment.insert(partition);
        }
        assignment
    }

    /// Set difference: partitions in `self` but not in `other`.
    #[must_use]
    pub fn difference(&self, other: &Self) -> Self {
        Self::from_partitions(self.iter().filter(|p| !other.contains(*p)))
    }

    /// Set union.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        let mut result = self.clone();
        for partition in other.iter() {
            result.insert(partition);
        }
        result
    }

    /// Whether `self` is a subset of `other`, used to check the
    /// `current ⊆ last_acknowledged_target` invariant.
    #[must_use]
    pub fn is_subset_of(&self, other: &Self) -> bool {
        self.iter().all(|p| other.contains(p))
    }
}

impl FromIterator<Partition> for Assignment {
    fn from_iter<T: IntoIterator<Item = Partition>>(iter: T) -> Self {
        Self::from_partitions(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn topic(n: u128) -> TopicId {
        TopicId::from_uuid(Uuid::from_u128(n))
    }

    #[test]
    fn equality_is_by_value() {
        let t1 = topic(1);
        let a = Assignment::from_partitions([Partition::new(t1, 1), Partition::new(t1, 0)]);
        let b = Assignment::from_partitions([Partition::new(t1, 0), Partition::new(t1, 1)]);
        assert_eq!(a, b);
    }

    #[test]
    fn difference_and_union() {
        let t1 = topic(1);
        let current =
            Assignment::from_partitions([Partition::new(t1, 0), Partition::new(t1, 1)]);
        let target =
            Assignment::from_partitions([Partition::new(t1, 1), Partition::new(t1, 2)]);

        let revoked = current.difference(&target);
        let added = target.difference(&current);
        assert_eq!(revoked, Assignment::from_partitions([Partition::new(t1, 0)]));
        assert_eq!(added, Assignment::from_partitions([Partition::new(t1, 2)]));

        let merged = revoked.union(&added);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn empty_topic_entries_do_not_linger() {
        let t1 = topic(1);
        let mut a = Assignment::from_partitions([Partition::new(t1, 0)]);
        a.remove(Partition::new(t1, 0));
        assert!(a.is_empty());
        assert_eq!(a.topic_ids().count(), 0);
    }

    #[test]
    fn subset_check() {
        let t1 = topic(1);
        let small = Assignment::from_partitions([Partition::new(t1, 0)]);
        let big = Assignment::from_partitions([Partition::new(t1, 0), Partition::new(t1, 1)]);
        assert!(small.is_subset_of(&big));
        assert!(!big.is_subset_of(&small));
    }
}
