//! Observed-Remove Map: the add-wins multimap CRDT backing the engine's `Map`
//! and (via [`OrSequence`](crate::crdt::OrSequence)) `List` document kinds.
//!
//! Each key holds a set of values, where every value instance carries its own
//! unique tag (an HLC timestamp string). Removing a value tombstones the tags
//! observed at the time of the call; an add racing a concurrent remove keeps
//! its own tag untouched, so it survives the merge even though some other
//! value under the same key was deleted. This is what "add-wins" means here:
//! the only way to make a value disappear is to have observed its specific
//! tag and tombstoned it.
//!
//! # Layout
//!
//! `live` nests `key -> tag -> record`. `removed` is the flat set of
//! tombstoned tags. A converged view of a key is: everything in `live` whose
//! tag is not in `removed`.
//!
//! # Sync digest
//!
//! Every mutation that touches a key recomputes that key's entry in an
//! [`ORMapMerkleTree`], so two replicas can diff their digests down to the
//! handful of keys that actually disagree instead of exchanging everything.
//!
//! # Expiry
//!
//! A record may carry a TTL in milliseconds. [`ORMap::get`] and
//! [`ORMap::get_records`] hide expired records, but expiry never deletes
//! anything on its own -- the record stays in `live` until a remove or prune
//! touches it.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::hash::fnv1a_hash;
use crate::hlc::{MergeKeyResult, ORMapRecord, Timestamp, HLC};
use crate::merkle::ORMapMerkleTree;

/// An add-wins multimap CRDT. Keys are [`String`]s; values are generic over
/// `V` with `Clone + Serialize + DeserializeOwned + PartialEq`.
///
/// ```
/// use sync_core::hlc::{HLC, SystemClock};
/// use sync_core::crdt::or_map::ORMap;
/// use sync_core::Value;
///
/// let hlc = HLC::new("node-1".to_string(), Box::new(SystemClock));
/// let mut map: ORMap<Value> = ORMap::new(hlc);
///
/// map.add("user:1", Value::String("Alice".to_string()), None);
/// assert_eq!(map.get("user:1").len(), 1);
/// ```
pub struct ORMap<V> {
    live: HashMap<String, HashMap<String, ORMapRecord<V>>>,
    removed: HashSet<String>,
    hlc: HLC,
    digest: ORMapMerkleTree,
}

impl<V> ORMap<V>
where
    V: Clone + Serialize + DeserializeOwned + PartialEq,
{
    /// An empty map driven by `hlc` for tag generation, causality tracking on
    /// merge, and TTL expiry checks (via the HLC's own clock source).
    #[must_use]
    pub fn new(hlc: HLC) -> Self {
        Self { live: HashMap::new(), removed: HashSet::new(), hlc, digest: ORMapMerkleTree::default_depth() }
    }

    // ---- mutation ----

    /// Adds `value` under `key`, tagged with a fresh HLC timestamp. Returns
    /// the stored record.
    pub fn add(&mut self, key: impl Into<String>, value: V, ttl_ms: Option<u64>) -> ORMapRecord<V> {
        let key = key.into();
        let timestamp = self.hlc.now();
        let tag = HLC::to_string(&timestamp);
        let record = ORMapRecord { value, timestamp, tag, ttl_ms };

        self.live.entry(key.clone()).or_default().insert(record.tag.clone(), record.clone());
        self.refresh_digest(&key);
        record
    }

    /// Tombstones every tag currently holding a value equal to `value` under
    /// `key`. Returns the tags removed; a key with no matching value removes
    /// nothing.
    pub fn remove(&mut self, key: &str, value: &V) -> Vec<String> {
        let Some(tags) = self.live.get_mut(key) else {
            return Vec::new();
        };

        let matching: Vec<String> = tags.iter().filter(|(_, record)| &record.value == value).map(|(tag, _)| tag.clone()).collect();
        for tag in &matching {
            self.removed.insert(tag.clone());
            tags.remove(tag);
        }
        if tags.is_empty() {
            self.live.remove(key);
        }

        self.refresh_digest(key);
        matching
    }

    /// Applies one remote record. Rejects (returns `false`) a tag that's
    /// already tombstoned locally -- the remove happened-before or
    /// happened-concurrently and either way the value is gone for good.
    /// Always folds the record's timestamp into the local HLC so causality
    /// tracking stays correct regardless of acceptance.
    pub fn apply(&mut self, key: impl Into<String>, record: ORMapRecord<V>) -> bool {
        if self.removed.contains(&record.tag) {
            return false;
        }
        let key = key.into();
        let _ = self.hlc.update(&record.timestamp);
        self.live.entry(key.clone()).or_default().insert(record.tag.clone(), record);
        self.refresh_digest(&key);
        true
    }

    /// Applies a remote tombstone: records the tag as removed and drops any
    /// local copy of it (a tag is globally unique, so at most one key is
    /// touched).
    pub fn apply_tombstone(&mut self, tag: &str) {
        self.removed.insert(tag.to_string());

        let owning_key = self.live.iter_mut().find_map(|(key, tags)| tags.remove(tag).is_some().then(|| key.clone()));
        if let Some(key) = owning_key {
            if self.live.get(&key).is_some_and(HashMap::is_empty) {
                self.live.remove(&key);
            }
            self.refresh_digest(&key);
        }
    }

    /// Folds another replica's full state into this one: union of live
    /// records minus union of tombstones, with the local HLC advanced past
    /// every remote timestamp seen.
    pub fn merge(&mut self, other: &ORMap<V>) {
        let mut touched: HashSet<String> = HashSet::new();

        for tag in &other.removed {
            self.removed.insert(tag.clone());
        }

        for (key, remote_tags) in &other.live {
            let local_tags = self.live.entry(key.clone()).or_default();
            for (tag, record) in remote_tags {
                if !self.removed.contains(tag) && !local_tags.contains_key(tag) {
                    local_tags.insert(tag.clone(), record.clone());
                    touched.insert(key.clone());
                }
                let _ = self.hlc.update(&record.timestamp);
            }
        }

        // A tag that arrived as live data from one side and as a tombstone
        // from the other must end up removed; sweep anything now
        // contradicting the merged tombstone set.
        let keys: Vec<String> = self.live.keys().cloned().collect();
        for key in keys {
            if let Some(tags) = self.live.get_mut(&key) {
                let stale: Vec<String> = tags.keys().filter(|tag| self.removed.contains(*tag)).cloned().collect();
                for tag in stale {
                    tags.remove(&tag);
                    touched.insert(key.clone());
                }
                if tags.is_empty() {
                    self.live.remove(&key);
                }
            }
        }

        for key in &touched {
            self.refresh_digest(key);
        }
    }

    /// Per-key counterpart to [`Self::merge`], used when a sync round only
    /// needs to reconcile the keys the Merkle digest flagged as diverged.
    /// Tombstones apply first, then each remote record is either inserted
    /// (new tag) or replaces the local copy (same tag, newer timestamp).
    /// Returns how many records were added vs. updated.
    pub fn merge_key(&mut self, key: impl Into<String>, remote_records: Vec<ORMapRecord<V>>, remote_tombstones: &[String]) -> MergeKeyResult {
        let key = key.into();
        let mut result = MergeKeyResult { added: 0, updated: 0 };

        for tag in remote_tombstones {
            self.removed.insert(tag.clone());
        }

        let local_tags = self.live.entry(key.clone()).or_default();
        let now_tombstoned: Vec<String> = local_tags.keys().filter(|tag| self.removed.contains(*tag)).cloned().collect();
        for tag in now_tombstoned {
            local_tags.remove(&tag);
        }

        for remote in remote_records {
            let _ = self.hlc.update(&remote.timestamp);
            if self.removed.contains(&remote.tag) {
                continue;
            }
            match local_tags.get(&remote.tag) {
                Some(local) if remote.timestamp > local.timestamp => {
                    local_tags.insert(remote.tag.clone(), remote);
                    result.updated += 1;
                }
                Some(_) => {}
                None => {
                    local_tags.insert(remote.tag.clone(), remote);
                    result.added += 1;
                }
            }
        }

        if local_tags.is_empty() {
            self.live.remove(&key);
        }
        self.refresh_digest(&key);
        result
    }

    /// Drops tombstones older than `older_than` (parsing each tag back into
    /// its timestamp). Returns the pruned tags.
    pub fn prune(&mut self, older_than: &Timestamp) -> Vec<String> {
        let stale: Vec<String> = self
            .removed
            .iter()
            .filter(|tag| HLC::parse(tag).is_ok_and(|ts| ts < *older_than))
            .cloned()
            .collect();
        for tag in &stale {
            self.removed.remove(tag);
        }
        stale
    }

    /// Drops everything: live records, tombstones, and the digest.
    pub fn clear(&mut self) {
        self.live.clear();
        self.removed.clear();
        self.digest = ORMapMerkleTree::default_depth();
    }

    // ---- queries ----

    /// Live, non-expired values under `key`, in no particular order.
    #[must_use]
    pub fn get(&self, key: &str) -> Vec<&V> {
        self.get_records(key).into_iter().map(|record| &record.value).collect()
    }

    /// Live, non-expired records under `key`. Unlike [`Self::get`], exposes
    /// the tag/timestamp/TTL a caller needs to re-serialize or sync a value.
    #[must_use]
    pub fn get_records(&self, key: &str) -> Vec<&ORMapRecord<V>> {
        let Some(tags) = self.live.get(key) else {
            return Vec::new();
        };
        let now = self.hlc.clock_source().now();
        tags.values()
            .filter(|record| !self.removed.contains(&record.tag))
            .filter(|record| !Self::is_expired(record, now))
            .collect()
    }

    /// Every key currently holding at least one live record.
    #[must_use]
    pub fn all_keys(&self) -> Vec<&String> {
        self.live.keys().collect()
    }

    /// Every tombstoned tag.
    #[must_use]
    pub fn get_tombstones(&self) -> Vec<&String> {
        self.removed.iter().collect()
    }

    #[must_use]
    pub fn is_tombstoned(&self, tag: &str) -> bool {
        self.removed.contains(tag)
    }

    /// The Merkle digest backing delta sync.
    #[must_use]
    pub fn merkle_tree(&self) -> &ORMapMerkleTree {
        &self.digest
    }

    fn is_expired(record: &ORMapRecord<V>, now: u64) -> bool {
        record.ttl_ms.is_some_and(|ttl| record.timestamp.millis + ttl < now)
    }

    // ---- digest maintenance ----

    fn refresh_digest(&mut self, key: &str) {
        match self.live.get(key) {
            Some(tags) if !tags.is_empty() => {
                let hash = Self::digest_entry(key, tags);
                self.digest.update(key, hash);
            }
            _ => self.digest.remove(key),
        }
    }

    /// Deterministic hash of every record under `key`, independent of the
    /// backing `HashMap`'s iteration order: tags are sorted first, and each
    /// value is rendered through [`canonical_json`] so struct field order
    /// can't perturb the hash either.
    fn digest_entry(key: &str, records: &HashMap<String, ORMapRecord<V>>) -> u32 {
        let mut tags: Vec<&String> = records.keys().collect();
        tags.sort();

        let mut parts = Vec::with_capacity(tags.len() + 1);
        parts.push(format!("key:{key}"));
        for tag in tags {
            let record = &records[tag];
            let ts = &record.timestamp;
            let mut segment = format!("{tag}:{}:{}:{}:{}", canonical_json(&record.value), ts.millis, ts.counter, ts.node_id);
            if let Some(ttl) = record.ttl_ms {
                use std::fmt::Write;
                let _ = write!(segment, ":ttl={ttl}");
            }
            parts.push(segment);
        }

        fnv1a_hash(&parts.join("|"))
    }
}

/// Renders `value` as JSON with every object's keys sorted, so two structs
/// with the same fields in different declaration order (or a `HashMap`-backed
/// type with nondeterministic iteration) hash identically.
fn canonical_json<V: Serialize>(value: &V) -> String {
    let raw = serde_json::to_value(value).expect("V: Serialize must convert to serde_json::Value");
    serde_json::to_string(&sort_keys(raw)).expect("a serde_json::Value with sorted keys must serialize")
}

fn sort_keys(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: BTreeMap<String, serde_json::Value> = map.into_iter().map(|(k, v)| (k, sort_keys(v))).collect();
            serde_json::Value::Object(sorted.into_iter().collect())
        }
        serde_json::Value::Array(items) => serde_json::Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
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

    fn make_map(node_id: &str, time: u64) -> (ORMap<Value>, Arc<AtomicU64>) {
        let (clock, handle) = FixedClock::new(time);
        (ORMap::new(HLC::new(node_id.to_string(), Box::new(clock))), handle)
    }

    #[test]
    fn add_and_get_single_value() {
        let (mut map, _) = make_map("node-1", 1_000_000);
        map.add("key1", Value::String("hello".to_string()), None);
        assert_eq!(map.get("key1"), vec![&Value::String("hello".to_string())]);
    }

    #[test]
    fn add_multiple_values_same_key() {
        let (mut map, _) = make_map("node-1", 1_000_000);
        map.add("key1", Value::String("work".to_string()), None);
        map.add("key1", Value::String("play".to_string()), None);

        let values = map.get("key1");
        assert_eq!(values.len(), 2);
        assert!(values.contains(&&Value::String("work".to_string())));
        assert!(values.contains(&&Value::String("play".to_string())));
    }

    #[test]
    fn get_nonexistent_key_returns_empty() {
        let (map, _) = make_map("node-1", 1_000_000);
        assert!(map.get("nonexistent").is_empty());
    }

    #[test]
    fn add_returns_record_tagged_with_node_id() {
        let (mut map, _) = make_map("node-1", 1_000_000);
        let record = map.add("key1", Value::Int(42), None);
        assert_eq!(record.value, Value::Int(42));
        assert!(record.tag.contains("node-1"));
    }

    #[test]
    fn remove_tombstones_only_the_matching_value() {
        let (mut map, _) = make_map("node-1", 1_000_000);
        map.add("key1", Value::String("hello".to_string()), None);
        map.add("key1", Value::String("world".to_string()), None);

        let removed = map.remove("key1", &Value::String("hello".to_string()));
        assert_eq!(removed.len(), 1);
        assert_eq!(map.get("key1"), vec![&Value::String("world".to_string())]);
    }

    #[test]
    fn removing_every_value_drops_the_key() {
        let (mut map, _) = make_map("node-1", 1_000_000);
        map.add("key1", Value::String("hello".to_string()), None);
        map.remove("key1", &Value::String("hello".to_string()));
        assert!(map.get("key1").is_empty());
        assert!(!map.all_keys().contains(&&"key1".to_string()));
    }

    #[test]
    fn remove_on_missing_key_or_value_is_a_no_op() {
        let (mut map, _) = make_map("node-1", 1_000_000);
        assert!(map.remove("nonexistent", &Value::String("x".to_string())).is_empty());
        map.add("key1", Value::String("hello".to_string()), None);
        assert!(map.remove("key1", &Value::String("nope".to_string())).is_empty());
    }

    #[test]
    fn concurrent_add_survives_a_remove_of_a_different_tag() {
        let (mut map_a, _) = make_map("node-A", 1_000_000);
        let (mut map_b, _) = make_map("node-B", 1_000_000);

        map_a.add("status", Value::String("work".to_string()), None);
        map_b.add("status", Value::String("work".to_string()), None);
        map_a.remove("status", &Value::String("work".to_string()));

        map_a.merge(&map_b);

        assert_eq!(map_a.get("status"), vec![&Value::String("work".to_string())], "B's add survives the merge despite A's remove");
    }

    #[test]
    fn apply_rejects_an_already_tombstoned_tag() {
        let (mut map, _) = make_map("node-1", 1_000_000);
        let record = map.add("key1", Value::String("hello".to_string()), None);
        let tag = record.tag.clone();
        map.remove("key1", &Value::String("hello".to_string()));

        let remote = ORMapRecord {
            value: Value::String("hello".to_string()),
            timestamp: Timestamp { millis: 2_000_000, counter: 0, node_id: "remote".to_string() },
            tag,
            ttl_ms: None,
        };
        assert!(!map.apply("key1", remote));
        assert!(map.get("key1").is_empty());
    }

    #[test]
    fn apply_accepts_a_new_tag() {
        let (mut map, _) = make_map("node-1", 1_000_000);
        let remote = ORMapRecord {
            value: Value::String("from-remote".to_string()),
            timestamp: Timestamp { millis: 2_000_000, counter: 0, node_id: "remote".to_string() },
            tag: "2000000:0:remote".to_string(),
            ttl_ms: None,
        };
        assert!(map.apply("key1", remote));
        assert_eq!(map.get("key1").len(), 1);
    }

    #[test]
    fn apply_tombstone_removes_the_matching_record() {
        let (mut map, _) = make_map("node-1", 1_000_000);
        let record = map.add("key1", Value::String("hello".to_string()), None);
        map.apply_tombstone(&record.tag);
        assert!(map.is_tombstoned(&record.tag));
        assert!(map.get("key1").is_empty());
    }

    #[test]
    fn apply_tombstone_for_an_unknown_tag_does_not_panic() {
        let (mut map, _) = make_map("node-1", 1_000_000);
        map.apply_tombstone("nonexistent-tag");
        assert!(map.is_tombstoned("nonexistent-tag"));
    }

    #[test]
    fn merge_unions_items_across_replicas() {
        let (mut map_a, _) = make_map("node-A", 1_000_000);
        let (mut map_b, _) = make_map("node-B", 1_000_000);
        map_a.add("key1", Value::String("a-val".to_string()), None);
        map_b.add("key1", Value::String("b-val".to_string()), None);

        map_a.merge(&map_b);
        assert_eq!(map_a.get("key1").len(), 2);
    }

    #[test]
    fn merge_is_idempotent() {
        let (mut map_a, _) = make_map("node-A", 1_000_000);
        let (mut map_b, _) = make_map("node-B", 1_000_000);
        map_a.add("key1", Value::String("val".to_string()), None);
        map_b.add("key1", Value::String("val2".to_string()), None);

        map_a.merge(&map_b);
        let first = map_a.get("key1").len();
        map_a.merge(&map_b);
        assert_eq!(first, map_a.get("key1").len());
    }

    fn replica_state(map: &ORMap<Value>) -> (Vec<(String, ORMapRecord<Value>)>, Vec<String>) {
        let mut records = Vec::new();
        for key in map.all_keys() {
            for (_, record) in &map.live[key] {
                records.push((key.clone(), record.clone()));
            }
        }
        (records, map.removed.iter().cloned().collect())
    }

    #[test]
    fn full_merge_is_commutative() {
        let (mut map_a, _) = make_map("node-A", 1_000_000);
        let (mut map_b, _) = make_map("node-B", 1_000_000);
        map_a.add("k1", Value::Int(1), None);
        map_b.add("k1", Value::Int(2), None);

        let (mut replay_a, _) = make_map("replay-A", 1_000_000);
        let (mut replay_b, _) = make_map("replay-B", 1_000_000);
        let (a_records, a_tombs) = replica_state(&map_a);
        let (b_records, b_tombs) = replica_state(&map_b);

        for (key, record) in &a_records {
            replay_a.apply(key.clone(), record.clone());
            replay_b.apply(key.clone(), record.clone());
        }
        for tag in &a_tombs {
            replay_a.apply_tombstone(tag);
            replay_b.apply_tombstone(tag);
        }
        for (key, record) in &b_records {
            replay_a.apply(key.clone(), record.clone());
            replay_b.apply(key.clone(), record.clone());
        }
        for tag in &b_tombs {
            replay_a.apply_tombstone(tag);
            replay_b.apply_tombstone(tag);
        }

        let mut vals_a: Vec<String> = replay_a.get("k1").iter().map(|v| format!("{v:?}")).collect();
        let mut vals_b: Vec<String> = replay_b.get("k1").iter().map(|v| format!("{v:?}")).collect();
        vals_a.sort();
        vals_b.sort();
        assert_eq!(vals_a, vals_b);
    }

    #[test]
    fn merge_key_adds_a_new_record() {
        let (mut map, _) = make_map("node-1", 1_000_000);
        let remote = vec![ORMapRecord {
            value: Value::String("remote".to_string()),
            timestamp: Timestamp { millis: 2_000_000, counter: 0, node_id: "remote-node".to_string() },
            tag: "2000000:0:remote-node".to_string(),
            ttl_ms: None,
        }];
        let result = map.merge_key("key1", remote, &[]);
        assert_eq!((result.added, result.updated), (1, 0));
        assert_eq!(map.get("key1").len(), 1);
    }

    #[test]
    fn merge_key_applies_tombstones_before_records() {
        let (mut map, _) = make_map("node-1", 1_000_000);
        let record = map.add("key1", Value::String("local".to_string()), None);
        let tag = record.tag.clone();

        let result = map.merge_key("key1", vec![], &[tag.clone()]);
        assert_eq!((result.added, result.updated), (0, 0));
        assert!(map.get("key1").is_empty());
        assert!(map.is_tombstoned(&tag));
    }

    #[test]
    fn merge_key_skips_a_record_tombstoned_in_the_same_batch() {
        let (mut map, _) = make_map("node-1", 1_000_000);
        let tag = "2000000:0:remote-node".to_string();
        let remote = vec![ORMapRecord {
            value: Value::String("remote".to_string()),
            timestamp: Timestamp { millis: 2_000_000, counter: 0, node_id: "remote-node".to_string() },
            tag: tag.clone(),
            ttl_ms: None,
        }];
        let result = map.merge_key("key1", remote, &[tag]);
        assert_eq!(result.added, 0);
        assert!(map.get("key1").is_empty());
    }

    #[test]
    fn merge_key_replaces_a_tag_with_a_newer_remote_copy() {
        let (mut map, _) = make_map("node-1", 1_000_000);
        let tag = "2000000:0:remote-node".to_string();
        map.apply(
            "key1",
            ORMapRecord {
                value: Value::String("old".to_string()),
                timestamp: Timestamp { millis: 2_000_000, counter: 0, node_id: "remote-node".to_string() },
                tag: tag.clone(),
                ttl_ms: None,
            },
        );

        let remote = vec![ORMapRecord {
            value: Value::String("new".to_string()),
            timestamp: Timestamp { millis: 3_000_000, counter: 0, node_id: "remote-node".to_string() },
            tag,
            ttl_ms: None,
        }];
        let result = map.merge_key("key1", remote, &[]);
        assert_eq!(result.updated, 1);
        assert_eq!(map.get("key1")[0], &Value::String("new".to_string()));
    }

    #[test]
    fn prune_drops_tombstones_older_than_the_threshold() {
        let (mut map, _) = make_map("node-1", 1_000_000);
        let record = map.add("key1", Value::String("hello".to_string()), None);
        map.remove("key1", &Value::String("hello".to_string()));

        let threshold = Timestamp { millis: 2_000_000, counter: 0, node_id: String::new() };
        let pruned = map.prune(&threshold);
        assert_eq!(pruned, vec![record.tag.clone()]);
        assert!(!map.is_tombstoned(&record.tag));
    }

    #[test]
    fn prune_keeps_tombstones_newer_than_the_threshold() {
        let (mut map, _) = make_map("node-1", 1_000_000);
        map.add("key1", Value::String("hello".to_string()), None);
        map.remove("key1", &Value::String("hello".to_string()));

        let threshold = Timestamp { millis: 500_000, counter: 0, node_id: String::new() };
        assert!(map.prune(&threshold).is_empty());
    }

    #[test]
    fn ttl_expired_record_is_hidden_from_get() {
        let (mut map, time) = make_map("node-1", 1_000_000);
        map.add("key1", Value::String("ephemeral".to_string()), Some(5_000));
        assert_eq!(map.get("key1").len(), 1);

        time.store(1_010_000, AtomicOrdering::Relaxed);
        assert!(map.get("key1").is_empty());
    }

    #[test]
    fn ttl_not_yet_expired_is_still_visible() {
        let (mut map, time) = make_map("node-1", 1_000_000);
        map.add("key1", Value::String("ephemeral".to_string()), Some(10_000));
        time.store(1_005_000, AtomicOrdering::Relaxed);
        assert_eq!(map.get("key1").len(), 1);
    }

    #[test]
    fn get_records_also_filters_expired() {
        let (mut map, time) = make_map("node-1", 1_000_000);
        map.add("key1", Value::String("short".to_string()), Some(1_000));
        map.add("key1", Value::String("long".to_string()), Some(100_000));
        time.store(1_005_000, AtomicOrdering::Relaxed);

        let records = map.get_records("key1");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value, Value::String("long".to_string()));
    }

    #[test]
    fn digest_root_changes_on_add_and_remove() {
        let (mut map, _) = make_map("node-1", 1_000_000);
        assert_eq!(map.merkle_tree().get_root_hash(), 0);

        map.add("key1", Value::String("hello".to_string()), None);
        let after_add = map.merkle_tree().get_root_hash();
        assert_ne!(after_add, 0);

        map.remove("key1", &Value::String("hello".to_string()));
        assert_ne!(map.merkle_tree().get_root_hash(), after_add);
    }

    #[test]
    fn clear_resets_the_digest_to_zero() {
        let (mut map, _) = make_map("node-1", 1_000_000);
        map.add("key1", Value::String("hello".to_string()), None);
        map.add("key2", Value::String("world".to_string()), None);
        assert_ne!(map.merkle_tree().get_root_hash(), 0);

        map.clear();
        assert_eq!(map.merkle_tree().get_root_hash(), 0);
    }

    #[test]
    fn each_add_produces_a_unique_tag() {
        let (mut map, _) = make_map("node-1", 1_000_000);
        let r1 = map.add("key1", Value::String("work".to_string()), None);
        let r2 = map.add("key1", Value::String("play".to_string()), None);
        assert_ne!(r1.tag, r2.tag);
    }

    #[test]
    fn digest_entry_is_independent_of_hashmap_iteration_order() {
        let ts_a = Timestamp { millis: 1_000_000, counter: 0, node_id: "node-1".to_string() };
        let record_a = ORMapRecord { value: Value::String("alice".to_string()), timestamp: ts_a, tag: "1000000:0:node-1".to_string(), ttl_ms: None };
        let ts_b = Timestamp { millis: 1_000_001, counter: 0, node_id: "node-1".to_string() };
        let record_b = ORMapRecord { value: Value::String("bob".to_string()), timestamp: ts_b, tag: "1000001:0:node-1".to_string(), ttl_ms: None };

        let mut forward: HashMap<String, ORMapRecord<Value>> = HashMap::new();
        forward.insert(record_a.tag.clone(), record_a.clone());
        forward.insert(record_b.tag.clone(), record_b.clone());

        let mut backward: HashMap<String, ORMapRecord<Value>> = HashMap::new();
        backward.insert(record_b.tag.clone(), record_b);
        backward.insert(record_a.tag.clone(), record_a);

        assert_eq!(ORMap::<Value>::digest_entry("user:1", &forward), ORMap::<Value>::digest_entry("user:1", &backward));
    }

    #[test]
    fn canonical_json_sorts_keys_at_every_nesting_level() {
        let mut inner = std::collections::BTreeMap::new();
        inner.insert("c".to_string(), Value::Int(3));
        inner.insert("b".to_string(), Value::Int(2));
        let mut outer = std::collections::BTreeMap::new();
        outer.insert("z".to_string(), Value::Int(1));
        outer.insert("a".to_string(), Value::Map(inner));

        let json = canonical_json(&Value::Map(outer));
        assert!(json.find("\"a\"").unwrap() < json.find("\"z\"").unwrap());
        assert!(json.find("\"b\"").unwrap() < json.find("\"c\"").unwrap());

        let parsed: serde_json::Value = serde_json::from_str(&json).expect("valid JSON");
        assert_eq!(json, serde_json::to_string(&parsed).unwrap());
    }

    #[test]
    fn canonical_json_round_trips_every_value_variant() {
        let cases = [
            Value::Null,
            Value::Bool(true),
            Value::Int(42),
            Value::Float(3.14),
            Value::String("hello".to_string()),
            Value::Array(vec![Value::Int(1), Value::String("two".to_string())]),
        ];
        for value in &cases {
            let rendered = canonical_json(value);
            assert_eq!(rendered, canonical_json(value), "must be deterministic");
            let parsed: serde_json::Value = serde_json::from_str(&rendered).expect("valid JSON");
            assert_eq!(rendered, serde_json::to_string(&parsed).unwrap());
        }
    }
}
