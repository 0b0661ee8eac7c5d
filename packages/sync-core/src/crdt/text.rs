//! `LwwRegister<V>`: a single timestamped value with last-write-wins merge.
//!
//! Backs the `Text` document kind (§3.1). There is no character-level merge —
//! concurrent edits to the same text document replace the whole value, with
//! the higher [`Timestamp`] winning, exactly like one entry of [`LwwMap`](super::LwwMap).
//! A document that needs collaborative character-level text editing is out of
//! scope; this register only prevents lost updates from clobbering each other
//! silently.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::hlc::{LWWRecord, Timestamp, HLC};

pub struct LwwRegister<V> {
    record: Option<LWWRecord<V>>,
    hlc: HLC,
}

impl<V> LwwRegister<V>
where
    V: Clone + Serialize + DeserializeOwned + PartialEq,
{
    #[must_use]
    pub fn new(hlc: HLC) -> Self {
        Self { record: None, hlc }
    }

    /// Sets the register's value with a freshly generated timestamp.
    pub fn set(&mut self, value: V) -> LWWRecord<V> {
        let timestamp = self.hlc.now();
        let record = LWWRecord { value: Some(value), timestamp, ttl_ms: None };
        self.record = Some(record.clone());
        record
    }

    /// Returns the current value, or `None` if never set or tombstoned.
    #[must_use]
    pub fn get(&self) -> Option<&V> {
        self.record.as_ref()?.value.as_ref()
    }

    /// Returns the full record, including tombstone state.
    #[must_use]
    pub fn record(&self) -> Option<&LWWRecord<V>> {
        self.record.as_ref()
    }

    /// Merges a remote record, accepting it only if its timestamp is strictly
    /// greater than the current one. Returns `true` if local state changed.
    pub fn merge(&mut self, remote: LWWRecord<V>) -> bool {
        let _ = self.hlc.update(&remote.timestamp);

        let should_accept = match &self.record {
            None => true,
            Some(local) => remote.timestamp > local.timestamp,
        };

        if should_accept {
            self.record = Some(remote);
            true
        } else {
            false
        }
    }

    /// Tombstones the register (e.g. document field cleared).
    pub fn clear(&mut self) -> LWWRecord<V> {
        let timestamp = self.hlc.now();
        let tombstone = LWWRecord { value: None, timestamp, ttl_ms: None };
        self.record = Some(tombstone.clone());
        tombstone
    }

    /// The register's timestamp, used as its state-vector entry.
    #[must_use]
    pub fn last_timestamp(&self) -> Option<&Timestamp> {
        self.record.as_ref().map(|r| &r.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use crate::hlc::SystemClock;
    use crate::value::Value;

    use super::*;

    fn make_register(node_id: &str) -> LwwRegister<Value> {
        LwwRegister::new(HLC::new(node_id.to_string(), Box::new(SystemClock)))
    }

    #[test]
    fn unset_register_returns_none() {
        let reg = make_register("n1");
        assert_eq!(reg.get(), None);
    }

    #[test]
    fn set_then_get_round_trips() {
        let mut reg = make_register("n1");
        reg.set(Value::String("hello".to_string()));
        assert_eq!(reg.get(), Some(&Value::String("hello".to_string())));
    }

    #[test]
    fn merge_keeps_newer_timestamp() {
        let mut reg = make_register("n1");
        reg.set(Value::String("local".to_string()));
        let local_ts = reg.last_timestamp().unwrap().clone();

        let older = LWWRecord {
            value: Some(Value::String("stale".to_string())),
            timestamp: Timestamp { millis: 0, counter: 0, node_id: "remote".to_string() },
            ttl_ms: None,
        };
        let changed = reg.merge(older);
        assert!(!changed);
        assert_eq!(reg.last_timestamp().unwrap(), &local_ts);
    }

    #[test]
    fn clear_produces_tombstone() {
        let mut reg = make_register("n1");
        reg.set(Value::String("value".to_string()));
        reg.clear();
        assert_eq!(reg.get(), None);
        assert!(reg.record().is_some());
    }
}
