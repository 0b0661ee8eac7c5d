//! Last-Write-Wins Map: the single-value-per-key CRDT backing document
//! metadata fields and scalar properties that don't need multi-value
//! semantics.
//!
//! Two concurrent writes to the same key resolve by total order over
//! [`Timestamp`]: compare `millis`, then `counter`, then `node_id`
//! lexicographically. Because every node produces a distinct HLC stream, no
//! two writes ever tie, so every replica picks the same winner regardless of
//! the order writes arrive in.
//!
//! # Deletes
//!
//! A delete is a write of `value: None` -- a tombstone, not a removal from
//! the backing map. Tombstones compete for the timestamp-ordering slot like
//! any other write, which is what makes "set wins" or "delete wins" resolve
//! consistently across replicas instead of depending on arrival order.
//! [`LwwMap::prune`] is the only thing that actually drops a tombstone.
//!
//! # Expiry
//!
//! A record may carry a TTL in milliseconds. [`LwwMap::get`] and
//! [`LwwMap::entries`] hide expired records; the record itself is untouched
//! until overwritten or pruned.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::hash::fnv1a_hash;
use crate::hlc::{LWWRecord, Timestamp, HLC};
use crate::merkle::MerkleTree;

/// A last-write-wins map CRDT, keyed by [`String`] with values generic over
/// `V: Clone + Serialize + DeserializeOwned + PartialEq`.
///
/// ```
/// use sync_core::hlc::{HLC, SystemClock};
/// use sync_core::crdt::LwwMap;
/// use sync_core::Value;
///
/// let hlc = HLC::new("node-1".to_string(), Box::new(SystemClock));
/// let mut map: LwwMap<Value> = LwwMap::new(hlc);
///
/// map.set("user:1", Value::String("Alice".to_string()), None);
/// assert_eq!(map.get("user:1"), Some(&Value::String("Alice".to_string())));
/// ```
pub struct LwwMap<V> {
    slots: HashMap<String, LWWRecord<V>>,
    hlc: HLC,
    digest: MerkleTree,
}

impl<V> LwwMap<V>
where
    V: Clone + Serialize + DeserializeOwned + PartialEq,
{
    /// An empty map driven by `hlc` for write timestamps, causality tracking
    /// on merge, and TTL checks against the HLC's clock source.
    #[must_use]
    pub fn new(hlc: HLC) -> Self {
        Self { slots: HashMap::new(), hlc, digest: MerkleTree::default_depth() }
    }

    // ---- mutation ----

    /// Writes `value` under `key` with a freshly minted HLC timestamp,
    /// unconditionally overwriting whatever was there. Returns the stored
    /// record.
    pub fn set(&mut self, key: impl Into<String>, value: V, ttl_ms: Option<u64>) -> LWWRecord<V> {
        let key = key.into();
        let record = LWWRecord { value: Some(value), timestamp: self.hlc.now(), ttl_ms };
        self.slots.insert(key.clone(), record.clone());
        self.refresh_digest(&key, &record.timestamp);
        record
    }

    /// Writes a tombstone under `key` with a fresh timestamp, even if `key`
    /// was never set -- other replicas need a record to merge against, not
    /// just a local absence. Returns the tombstone record.
    pub fn remove(&mut self, key: &str) -> LWWRecord<V> {
        let record = LWWRecord { value: None, timestamp: self.hlc.now(), ttl_ms: None };
        self.slots.insert(key.to_string(), record.clone());
        self.refresh_digest(key, &record.timestamp);
        record
    }

    /// Folds in one remote record under `key`. Always advances the local HLC
    /// past the remote timestamp regardless of outcome. Accepts the remote
    /// record (and returns `true`) when the key is unset locally or the
    /// remote timestamp strictly exceeds the local one; otherwise leaves the
    /// local record untouched and returns `false`.
    pub fn merge(&mut self, key: impl Into<String>, remote: LWWRecord<V>) -> bool {
        let _ = self.hlc.update(&remote.timestamp);
        let key = key.into();

        let wins = match self.slots.get(&key) {
            None => true,
            Some(current) => remote.timestamp > current.timestamp,
        };
        if !wins {
            return false;
        }

        let timestamp = remote.timestamp.clone();
        self.slots.insert(key.clone(), remote);
        self.refresh_digest(&key, &timestamp);
        true
    }

    /// Drops tombstones (not live records) whose timestamp is strictly older
    /// than `older_than`. Returns the keys pruned.
    pub fn prune(&mut self, older_than: &Timestamp) -> Vec<String> {
        let stale: Vec<String> = self.slots.iter().filter(|(_, record)| record.value.is_none() && record.timestamp < *older_than).map(|(key, _)| key.clone()).collect();

        for key in &stale {
            self.slots.remove(key);
            self.digest.remove(key);
        }
        stale
    }

    /// Drops every key and resets the digest.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.digest = MerkleTree::default_depth();
    }

    // ---- queries ----

    /// The value under `key`, or `None` if unset, tombstoned, or expired.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&V> {
        let record = self.slots.get(key)?;
        let value = record.value.as_ref()?;
        if self.has_expired(record) {
            return None;
        }
        Some(value)
    }

    /// The raw record under `key` regardless of tombstone or TTL state --
    /// what a sync round needs to compare against a peer's copy.
    #[must_use]
    pub fn get_record(&self, key: &str) -> Option<&LWWRecord<V>> {
        self.slots.get(key)
    }

    /// Keys with a live, non-expired value.
    pub fn entries(&self) -> impl Iterator<Item = (&String, &V)> {
        self.slots.iter().filter_map(move |(key, record)| {
            let value = record.value.as_ref()?;
            if self.has_expired(record) {
                return None;
            }
            Some((key, value))
        })
    }

    /// Every key, live or tombstoned.
    pub fn all_keys(&self) -> impl Iterator<Item = &String> {
        self.slots.keys()
    }

    /// Count of keys, live or tombstoned.
    #[must_use]
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// The Merkle digest backing delta sync.
    #[must_use]
    pub fn merkle_tree(&self) -> &MerkleTree {
        &self.digest
    }

    fn has_expired(&self, record: &LWWRecord<V>) -> bool {
        record.ttl_ms.is_some_and(|ttl| record.timestamp.millis + ttl < self.hlc.clock_source().now())
    }

    fn refresh_digest(&mut self, key: &str, timestamp: &Timestamp) {
        let hash = fnv1a_hash(&format!("{key}:{}:{}:{}", timestamp.millis, timestamp.counter, timestamp.node_id));
        self.digest.update(key, hash);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
    use std::sync::Arc;

    use super::*;
    use crate::hlc::ClockSource;
    use crate::Value;

    struct FixedClock {
        time: Arc<AtomicU64>,
    }

    impl FixedClock {
        fn new(initial: u64) -> (Self, Arc<AtomicU64>) {
            let time = Arc::new(AtomicU64::new(initial));
            (Self { time: time.clone() }, time)
        }
    }

    impl ClockSource for FixedClock {
        fn now(&self) -> u64 {
            self.time.load(AtomicOrdering::Relaxed)
        }
    }

    fn make_map(initial_time: u64) -> (LwwMap<Value>, Arc<AtomicU64>) {
        let (clock, time) = FixedClock::new(initial_time);
        (LwwMap::new(HLC::new("test-node".to_string(), Box::new(clock))), time)
    }

    #[test]
    fn set_then_get_returns_the_value() {
        let (mut map, _) = make_map(1_000_000);
        map.set("key1", Value::String("value1".to_string()), None);
        assert_eq!(map.get("key1"), Some(&Value::String("value1".to_string())));
    }

    #[test]
    fn get_on_an_unset_key_returns_none() {
        let (map, _) = make_map(1_000_000);
        assert_eq!(map.get("missing"), None);
    }

    #[test]
    fn a_second_set_overwrites_the_first() {
        let (mut map, _) = make_map(1_000_000);
        map.set("key1", Value::String("old".to_string()), None);
        map.set("key1", Value::String("new".to_string()), None);
        assert_eq!(map.get("key1"), Some(&Value::String("new".to_string())));
    }

    #[test]
    fn get_record_exposes_timestamp_and_node() {
        let (mut map, _) = make_map(1_000_000);
        map.set("key1", Value::Int(42), None);
        let record = map.get_record("key1").expect("record exists");
        assert_eq!(record.value, Some(Value::Int(42)));
        assert_eq!(record.timestamp.millis, 1_000_000);
        assert_eq!(record.timestamp.node_id, "test-node");
    }

    #[test]
    fn get_record_on_an_unset_key_returns_none() {
        let (map, _) = make_map(1_000_000);
        assert!(map.get_record("missing").is_none());
    }

    #[test]
    fn size_counts_tombstones_too() {
        let (mut map, _) = make_map(1_000_000);
        assert_eq!(map.size(), 0);
        map.set("a", Value::Int(1), None);
        assert_eq!(map.size(), 1);
        map.set("b", Value::Int(2), None);
        assert_eq!(map.size(), 2);
    }

    #[test]
    fn remove_leaves_a_tombstone_behind() {
        let (mut map, _) = make_map(1_000_000);
        map.set("key1", Value::String("value1".to_string()), None);
        map.remove("key1");
        assert_eq!(map.get("key1"), None);
        assert_eq!(map.get_record("key1").expect("tombstone exists").value, None);
    }

    #[test]
    fn remove_on_a_never_set_key_still_produces_a_record() {
        let (mut map, _) = make_map(1_000_000);
        let tombstone = map.remove("phantom");
        assert_eq!(tombstone.value, None);
        assert_eq!(map.get_record("phantom").expect("tombstone exists").value, None);
        assert_eq!(map.size(), 1);
    }

    #[test]
    fn size_does_not_shrink_when_a_key_is_removed() {
        let (mut map, _) = make_map(1_000_000);
        map.set("key1", Value::Int(1), None);
        map.set("key2", Value::Int(2), None);
        map.remove("key1");
        assert_eq!(map.size(), 2);
    }

    #[test]
    fn a_ttl_not_yet_elapsed_still_reads_back() {
        let (mut map, _time) = make_map(1_000_000);
        map.set("temp", Value::String("data".to_string()), Some(500));
        assert_eq!(map.get("temp"), Some(&Value::String("data".to_string())));
    }

    #[test]
    fn a_ttl_past_its_deadline_hides_the_value() {
        let (mut map, time) = make_map(1_000_000);
        map.set("temp", Value::String("data".to_string()), Some(500));
        time.store(1_000_600, AtomicOrdering::Relaxed);
        assert_eq!(map.get("temp"), None);
    }

    #[test]
    fn the_ttl_boundary_itself_is_not_expired() {
        let (mut map, time) = make_map(1_000_000);
        map.set("temp", Value::String("data".to_string()), Some(500));
        time.store(1_000_500, AtomicOrdering::Relaxed);
        assert_eq!(map.get("temp"), Some(&Value::String("data".to_string())));
    }

    #[test]
    fn no_ttl_means_no_expiry_ever() {
        let (mut map, time) = make_map(1_000_000);
        map.set("perm", Value::String("forever".to_string()), None);
        time.store(u64::MAX, AtomicOrdering::Relaxed);
        assert_eq!(map.get("perm"), Some(&Value::String("forever".to_string())));
    }

    #[test]
    fn merge_prefers_the_later_millis() {
        let (mut map, _) = make_map(1_000_000);
        let older = LWWRecord { value: Some(Value::String("old".to_string())), timestamp: Timestamp { millis: 100, counter: 0, node_id: "A".to_string() }, ttl_ms: None };
        let newer = LWWRecord { value: Some(Value::String("new".to_string())), timestamp: Timestamp { millis: 200, counter: 0, node_id: "B".to_string() }, ttl_ms: None };

        map.merge("key", older.clone());
        assert_eq!(map.get("key"), Some(&Value::String("old".to_string())));
        map.merge("key", newer);
        assert_eq!(map.get("key"), Some(&Value::String("new".to_string())));

        let changed = map.merge("key", older);
        assert!(!changed, "an older record must not unseat the current winner");
        assert_eq!(map.get("key"), Some(&Value::String("new".to_string())));
    }

    #[test]
    fn merge_breaks_millis_ties_on_counter() {
        let (mut map, _) = make_map(1_000_000);
        let low = LWWRecord { value: Some(Value::String("low".to_string())), timestamp: Timestamp { millis: 100, counter: 1, node_id: "A".to_string() }, ttl_ms: None };
        let high = LWWRecord { value: Some(Value::String("high".to_string())), timestamp: Timestamp { millis: 100, counter: 5, node_id: "A".to_string() }, ttl_ms: None };

        map.merge("key", low);
        map.merge("key", high);
        assert_eq!(map.get("key"), Some(&Value::String("high".to_string())));
    }

    #[test]
    fn merge_breaks_millis_and_counter_ties_on_node_id() {
        let record_a = LWWRecord { value: Some(Value::String("valA".to_string())), timestamp: Timestamp { millis: 100, counter: 0, node_id: "A".to_string() }, ttl_ms: None };
        let record_b = LWWRecord { value: Some(Value::String("valB".to_string())), timestamp: Timestamp { millis: 100, counter: 0, node_id: "B".to_string() }, ttl_ms: None };

        let (mut forward, _) = make_map(1_000_000);
        forward.merge("key", record_a.clone());
        forward.merge("key", record_b.clone());
        assert_eq!(forward.get("key"), Some(&Value::String("valB".to_string())));

        let (mut backward, _) = make_map(1_000_000);
        backward.merge("key", record_b);
        backward.merge("key", record_a);
        assert_eq!(backward.get("key"), Some(&Value::String("valB".to_string())), "node-id tiebreak must not depend on arrival order");
    }

    #[test]
    fn merge_reports_whether_the_winner_changed() {
        let (mut map, _) = make_map(1_000_000);
        let record = LWWRecord { value: Some(Value::Int(42)), timestamp: Timestamp { millis: 100, counter: 0, node_id: "A".to_string() }, ttl_ms: None };
        assert!(map.merge("key", record));

        let older = LWWRecord { value: Some(Value::Int(1)), timestamp: Timestamp { millis: 50, counter: 0, node_id: "A".to_string() }, ttl_ms: None };
        assert!(!map.merge("key", older));
    }

    #[test]
    fn prune_drops_tombstones_older_than_the_threshold() {
        let (mut map, _) = make_map(1_000_000);
        map.set("key1", Value::String("val1".to_string()), None);
        let tombstone = map.remove("key1");

        let threshold = Timestamp { millis: tombstone.timestamp.millis + 1000, counter: 0, node_id: "test-node".to_string() };
        let pruned = map.prune(&threshold);
        assert_eq!(pruned, vec!["key1".to_string()]);
        assert!(map.get_record("key1").is_none());
    }

    #[test]
    fn prune_keeps_tombstones_newer_than_the_threshold() {
        let (mut map, _) = make_map(1_000_000);
        map.set("key1", Value::String("val1".to_string()), None);
        let tombstone = map.remove("key1");

        let threshold = Timestamp { millis: tombstone.timestamp.millis - 1000, counter: 0, node_id: "test-node".to_string() };
        assert!(map.prune(&threshold).is_empty());
        assert!(map.get_record("key1").is_some());
    }

    #[test]
    fn prune_never_touches_a_live_record() {
        let (mut map, _) = make_map(1_000_000);
        map.set("key1", Value::String("val1".to_string()), None);
        let threshold = Timestamp { millis: u64::MAX, counter: u32::MAX, node_id: "z".to_string() };
        assert!(map.prune(&threshold).is_empty());
        assert!(map.get_record("key1").is_some());
    }

    #[test]
    fn prune_on_an_empty_map_prunes_nothing() {
        let (mut map, _) = make_map(1_000_000);
        let threshold = Timestamp { millis: u64::MAX, counter: 0, node_id: "x".to_string() };
        assert!(map.prune(&threshold).is_empty());
    }

    #[test]
    fn entries_skips_tombstones() {
        let (mut map, _) = make_map(1_000_000);
        map.set("a", Value::Int(1), None);
        map.set("b", Value::Int(2), None);
        map.remove("b");

        let entries: Vec<_> = map.entries().collect();
        assert_eq!(entries, vec![(&"a".to_string(), &Value::Int(1))]);
    }

    #[test]
    fn entries_skips_expired_records() {
        let (mut map, time) = make_map(1_000_000);
        map.set("live", Value::Int(1), None);
        map.set("expired", Value::Int(2), Some(100));
        time.store(1_000_200, AtomicOrdering::Relaxed);

        let entries: Vec<_> = map.entries().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "live");
    }

    #[test]
    fn all_keys_includes_tombstoned_keys() {
        let (mut map, _) = make_map(1_000_000);
        map.set("a", Value::Int(1), None);
        map.set("b", Value::Int(2), None);
        map.remove("b");

        let mut keys: Vec<&String> = map.all_keys().collect();
        keys.sort();
        assert_eq!(keys, vec![&"a".to_string(), &"b".to_string()]);
    }

    #[test]
    fn clear_drops_everything() {
        let (mut map, _) = make_map(1_000_000);
        map.set("a", Value::Int(1), None);
        map.set("b", Value::Int(2), None);
        map.clear();
        assert_eq!(map.size(), 0);
        assert_eq!(map.get("a"), None);
    }

    #[test]
    fn clear_resets_the_digest_to_zero() {
        let (mut map, _) = make_map(1_000_000);
        map.set("key1", Value::Int(1), None);
        assert_ne!(map.merkle_tree().get_root_hash(), 0);
        map.clear();
        assert_eq!(map.merkle_tree().get_root_hash(), 0);
    }

    #[test]
    fn digest_changes_on_set() {
        let (mut map, _) = make_map(1_000_000);
        let before = map.merkle_tree().get_root_hash();
        map.set("key1", Value::Int(1), None);
        assert_ne!(before, map.merkle_tree().get_root_hash());
    }

    #[test]
    fn digest_changes_on_remove() {
        let (mut map, _) = make_map(1_000_000);
        map.set("key1", Value::Int(1), None);
        let after_set = map.merkle_tree().get_root_hash();
        map.remove("key1");
        assert_ne!(after_set, map.merkle_tree().get_root_hash(), "the tombstone carries a new timestamp, so the digest must move");
    }

    #[test]
    fn digest_changes_on_merge() {
        let (mut map, _) = make_map(1_000_000);
        let before = map.merkle_tree().get_root_hash();
        let record = LWWRecord { value: Some(Value::Int(42)), timestamp: Timestamp { millis: 500, counter: 0, node_id: "remote".to_string() }, ttl_ms: None };
        map.merge("key1", record);
        assert_ne!(before, map.merkle_tree().get_root_hash());
    }

    #[test]
    fn pruning_the_last_entry_resets_the_digest() {
        let (mut map, _) = make_map(1_000_000);
        map.set("key1", Value::Int(1), None);
        let tombstone = map.remove("key1");
        assert_ne!(map.merkle_tree().get_root_hash(), 0);

        let threshold = Timestamp { millis: tombstone.timestamp.millis + 1000, counter: 0, node_id: "z".to_string() };
        map.prune(&threshold);
        assert_eq!(map.merkle_tree().get_root_hash(), 0);
    }

    #[test]
    fn digest_is_identical_across_replicas_after_an_equivalent_merge() {
        let (mut map1, _) = make_map(1_000_000);
        let (mut map2, _) = make_map(1_000_000);
        let record = LWWRecord { value: Some(Value::String("hello".to_string())), timestamp: Timestamp { millis: 500, counter: 0, node_id: "node".to_string() }, ttl_ms: None };
        map1.merge("key1", record.clone());
        map2.merge("key1", record);
        assert_eq!(map1.merkle_tree().get_root_hash(), map2.merkle_tree().get_root_hash());
    }

    #[test]
    fn set_returns_the_record_it_stored() {
        let (mut map, _) = make_map(1_000_000);
        let record = map.set("key1", Value::Int(99), Some(5000));
        assert_eq!(record.value, Some(Value::Int(99)));
        assert_eq!(record.timestamp.millis, 1_000_000);
        assert_eq!(record.ttl_ms, Some(5000));
    }

    #[test]
    fn remove_returns_the_tombstone_it_stored() {
        let (mut map, _) = make_map(1_000_000);
        map.set("key1", Value::Int(1), None);
        let tombstone = map.remove("key1");
        assert_eq!(tombstone.value, None);
        assert_eq!(tombstone.ttl_ms, None);
        assert_eq!(tombstone.timestamp.node_id, "test-node");
    }

    #[test]
    fn merge_order_does_not_affect_the_winner() {
        let record_a = LWWRecord { value: Some(Value::String("A".to_string())), timestamp: Timestamp { millis: 100, counter: 0, node_id: "nodeA".to_string() }, ttl_ms: None };
        let record_b = LWWRecord { value: Some(Value::String("B".to_string())), timestamp: Timestamp { millis: 200, counter: 0, node_id: "nodeB".to_string() }, ttl_ms: None };

        let (mut forward, _) = make_map(1_000_000);
        forward.merge("key", record_a.clone());
        forward.merge("key", record_b.clone());

        let (mut backward, _) = make_map(1_000_000);
        backward.merge("key", record_b);
        backward.merge("key", record_a);

        assert_eq!(forward.get("key"), backward.get("key"));
        assert_eq!(forward.get("key"), Some(&Value::String("B".to_string())));
    }

    #[test]
    fn merging_the_same_record_twice_is_a_no_op_the_second_time() {
        let (mut map, _) = make_map(1_000_000);
        let record = LWWRecord { value: Some(Value::Int(42)), timestamp: Timestamp { millis: 500, counter: 0, node_id: "node".to_string() }, ttl_ms: None };

        assert!(map.merge("key", record.clone()));
        let digest_after_first = map.merkle_tree().get_root_hash();

        assert!(!map.merge("key", record));
        assert_eq!(map.merkle_tree().get_root_hash(), digest_after_first);
        assert_eq!(map.get("key"), Some(&Value::Int(42)));
    }

    #[test]
    fn record_msgpack_roundtrip_with_a_value() {
        let record = LWWRecord {
            value: Some(Value::String("hello".to_string())),
            timestamp: Timestamp { millis: 1_700_000_000_000, counter: 42, node_id: "node-abc-123".to_string() },
            ttl_ms: Some(5000),
        };
        let bytes = rmp_serde::to_vec(&record).expect("serialize LWWRecord<Value>");
        let decoded: LWWRecord<Value> = rmp_serde::from_slice(&bytes).expect("deserialize LWWRecord<Value>");
        assert_eq!(record, decoded);
    }

    #[test]
    fn record_msgpack_roundtrip_as_a_tombstone() {
        let record: LWWRecord<Value> = LWWRecord { value: None, timestamp: Timestamp { millis: 999, counter: 0, node_id: "tomb".to_string() }, ttl_ms: None };
        let bytes = rmp_serde::to_vec(&record).expect("serialize");
        let decoded: LWWRecord<Value> = rmp_serde::from_slice(&bytes).expect("deserialize");
        assert_eq!(record, decoded);
    }

    #[test]
    fn record_msgpack_roundtrip_covers_every_value_variant() {
        let variants: Vec<LWWRecord<Value>> = vec![
            LWWRecord { value: Some(Value::Null), timestamp: Timestamp { millis: 1, counter: 0, node_id: "n".to_string() }, ttl_ms: None },
            LWWRecord { value: Some(Value::Bool(true)), timestamp: Timestamp { millis: 2, counter: 0, node_id: "n".to_string() }, ttl_ms: None },
            LWWRecord { value: Some(Value::Int(-42)), timestamp: Timestamp { millis: 3, counter: 0, node_id: "n".to_string() }, ttl_ms: Some(1000) },
            LWWRecord { value: Some(Value::Float(3.14)), timestamp: Timestamp { millis: 4, counter: 0, node_id: "n".to_string() }, ttl_ms: None },
            LWWRecord { value: Some(Value::Bytes(vec![0xDE, 0xAD])), timestamp: Timestamp { millis: 5, counter: 0, node_id: "n".to_string() }, ttl_ms: None },
        ];

        for record in variants {
            let bytes = rmp_serde::to_vec(&record).expect("serialize");
            let decoded: LWWRecord<Value> = rmp_serde::from_slice(&bytes).expect("deserialize");
            assert_eq!(record, decoded);
        }
    }
}
