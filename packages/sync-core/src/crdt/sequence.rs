//! `OrSequence<V>`: an add-wins ordered list built on top of [`ORMap`].
//!
//! A sequence is a multimap (see [`or_map`](crate::crdt::or_map)) where every
//! item lives under a single shared key (`"$items"`) so that position can be
//! derived purely from each record's HLC tag: sorting live records by tag
//! yields a total, replica-agnostic order without a separate position field
//! that two replicas could disagree about. Concurrent inserts interleave by
//! timestamp; concurrent insert-vs-remove resolves add-wins, exactly like the
//! underlying `ORMap`.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::hlc::{MergeKeyResult, ORMapRecord, Timestamp, HLC};

use super::or_map::ORMap;

const ITEMS_KEY: &str = "$items";

/// An ordered sequence with add-wins concurrent-insert and observed-remove
/// concurrent-delete semantics.
pub struct OrSequence<V> {
    inner: ORMap<V>,
}

impl<V> OrSequence<V>
where
    V: Clone + Serialize + DeserializeOwned + PartialEq,
{
    /// Creates an empty sequence with the given HLC instance.
    #[must_use]
    pub fn new(hlc: HLC) -> Self {
        Self { inner: ORMap::new(hlc) }
    }

    /// Appends a value, returning the record that now anchors its position.
    ///
    /// Position is implicit: the record's tag sorts after every tag already
    /// present, since tags are generated from a monotonically increasing HLC.
    pub fn push(&mut self, value: V, ttl_ms: Option<u64>) -> ORMapRecord<V> {
        self.inner.add(ITEMS_KEY, value, ttl_ms)
    }

    /// Removes the first live item equal to `value`. Returns the removed tags.
    pub fn remove(&mut self, value: &V) -> Vec<String> {
        self.inner.remove(ITEMS_KEY, value)
    }

    /// Returns the live items in their converged order (oldest tag first).
    #[must_use]
    pub fn to_vec(&self) -> Vec<&V> {
        let mut records = self.inner.get_records(ITEMS_KEY);
        records.sort_by(|a, b| a.tag.cmp(&b.tag));
        records.into_iter().map(|r| &r.value).collect()
    }

    /// Number of live items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.get(ITEMS_KEY).len()
    }

    /// Whether the sequence has no live items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Applies a remote record produced by another replica's [`push`](OrSequence::push).
    pub fn apply(&mut self, record: ORMapRecord<V>) -> bool {
        self.inner.apply(ITEMS_KEY, record)
    }

    /// Applies a remote tombstone for a previously observed tag.
    pub fn apply_tombstone(&mut self, tag: &str) {
        self.inner.apply_tombstone(tag);
    }

    /// Merges a batch of remote records and tombstones in one call, as used
    /// by update-blob application during sync.
    pub fn merge_batch(
        &mut self,
        remote_records: Vec<ORMapRecord<V>>,
        remote_tombstones: &[String],
    ) -> MergeKeyResult {
        self.inner.merge_key(ITEMS_KEY, remote_records, remote_tombstones)
    }

    /// All live records with their tags, for encoding an update blob.
    #[must_use]
    pub fn records(&self) -> Vec<&ORMapRecord<V>> {
        self.inner.get_records(ITEMS_KEY)
    }

    /// All tombstoned tags, for encoding an update blob.
    #[must_use]
    pub fn tombstones(&self) -> Vec<&String> {
        self.inner.get_tombstones()
    }

    /// Removes tombstones older than the given threshold.
    pub fn prune(&mut self, older_than: &Timestamp) -> Vec<String> {
        self.inner.prune(older_than)
    }

    /// Root hash of the underlying `ORMap`'s Merkle tree, for divergence checks.
    #[must_use]
    pub fn root_hash(&self) -> u32 {
        self.inner.merkle_tree().get_root_hash()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    use crate::hlc::{ClockSource, SystemClock};
    use crate::value::Value;

    use super::*;

    struct FixedClock {
        time: Arc<AtomicU64>,
    }

    impl ClockSource for FixedClock {
        fn now(&self) -> u64 {
            self.time.load(std::sync::atomic::Ordering::Relaxed)
        }
    }

    fn make_seq(node_id: &str) -> OrSequence<Value> {
        let hlc = HLC::new(node_id.to_string(), Box::new(SystemClock));
        OrSequence::new(hlc)
    }

    #[test]
    fn push_preserves_insertion_order() {
        let mut seq = make_seq("node-1");
        seq.push(Value::Int(1), None);
        seq.push(Value::Int(2), None);
        seq.push(Value::Int(3), None);
        assert_eq!(seq.to_vec(), vec![&Value::Int(1), &Value::Int(2), &Value::Int(3)]);
    }

    #[test]
    fn remove_drops_matching_value() {
        let mut seq = make_seq("node-1");
        seq.push(Value::Int(1), None);
        seq.push(Value::Int(2), None);
        seq.remove(&Value::Int(1));
        assert_eq!(seq.to_vec(), vec![&Value::Int(2)]);
    }

    #[test]
    fn concurrent_insert_and_remove_add_wins() {
        let _ = FixedClock { time: Arc::new(AtomicU64::new(0)) };
        let mut a = make_seq("node-A");
        let mut b = make_seq("node-B");

        a.push(Value::String("shared".to_string()), None);
        let b_record = b.push(Value::String("shared".to_string()), None);

        a.remove(&Value::String("shared".to_string()));
        a.apply(b_record);

        assert_eq!(a.len(), 1, "concurrently added item survives a concurrent remove");
    }

    #[test]
    fn empty_sequence_has_zero_root_hash() {
        let seq = make_seq("node-1");
        assert_eq!(seq.root_hash(), 0);
        assert!(seq.is_empty());
    }
}
