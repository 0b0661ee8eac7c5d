//! `CrdtDocument`: the collaborator that backs every synced document.
//!
//! A closed enum over the three document kinds (§3.1): `Map` fields are
//! independently last-write-wins, `List` items are an add-wins ordered
//! sequence, and `Text` is a single last-write-wins string. Callers never
//! touch [`LwwMap`], [`OrSequence`], or [`LwwRegister`] directly once a
//! document exists — they go through this enum so the document store and
//! conflict manager have one type to hold, serialize, and diff.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, SyncError};
use crate::hlc::{LWWRecord, ORMapRecord, Timestamp, HLC};
use crate::value::Value;

use super::sequence::OrSequence;
use super::text::LwwRegister;
use super::LwwMap;

/// Which CRDT shape a document uses. Fixed at creation; never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentKind {
    Map,
    List,
    Text,
}

pub enum CrdtDocument {
    Map(LwwMap<Value>),
    List(OrSequence<Value>),
    Text(LwwRegister<String>),
}

/// The wire/storage representation of "everything the caller hasn't seen yet".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum UpdateBlob {
    Map(Vec<(String, LWWRecord<Value>)>),
    List {
        records: Vec<ORMapRecord<Value>>,
        tombstones: Vec<String>,
    },
    Text(LWWRecord<String>),
}

/// The wire/storage representation of "what the caller has already seen".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum StateVector {
    #[default]
    Empty,
    Map(HashMap<String, Timestamp>),
    List {
        known_tags: HashSet<String>,
        known_tombstones: HashSet<String>,
    },
    Text(Timestamp),
}

impl CrdtDocument {
    /// Creates a new, empty document of the given kind.
    #[must_use]
    pub fn new(kind: DocumentKind, hlc: HLC) -> Self {
        match kind {
            DocumentKind::Map => CrdtDocument::Map(LwwMap::new(hlc)),
            DocumentKind::List => CrdtDocument::List(OrSequence::new(hlc)),
            DocumentKind::Text => CrdtDocument::Text(LwwRegister::new(hlc)),
        }
    }

    #[must_use]
    pub fn kind(&self) -> DocumentKind {
        match self {
            CrdtDocument::Map(_) => DocumentKind::Map,
            CrdtDocument::List(_) => DocumentKind::List,
            CrdtDocument::Text(_) => DocumentKind::Text,
        }
    }

    /// Reads a dotted field path. Only `Map` documents support nested paths;
    /// `Text`/`List` only support the empty path (their whole value).
    pub fn get_path(&self, path: &str) -> Result<Option<Value>, SyncError> {
        match self {
            CrdtDocument::Map(map) => {
                let Some((head, rest)) = split_path(path) else {
                    return Err(SyncError::invalid_argument("empty path"));
                };
                let Some(value) = map.get(head) else {
                    return Ok(None);
                };
                if rest.is_empty() {
                    return Ok(Some(value.clone()));
                }
                Ok(value.get_path(rest).cloned())
            }
            CrdtDocument::Text(reg) => {
                if !path.is_empty() {
                    return Err(SyncError::invalid_argument(
                        "text documents do not support nested field paths",
                    ));
                }
                Ok(reg.get().cloned().map(Value::String))
            }
            CrdtDocument::List(seq) => {
                if !path.is_empty() {
                    return Err(SyncError::invalid_argument(
                        "list documents do not support field paths",
                    ));
                }
                Ok(Some(Value::Array(seq.to_vec().into_iter().cloned().collect())))
            }
        }
    }

    /// Writes a dotted field path. See [`get_path`](CrdtDocument::get_path)
    /// for which paths are supported per kind.
    pub fn set_at_path(&mut self, path: &str, new_value: Value) -> Result<(), SyncError> {
        match self {
            CrdtDocument::Map(map) => {
                let Some((head, rest)) = split_path(path) else {
                    return Err(SyncError::invalid_argument("empty path"));
                };
                if rest.is_empty() {
                    map.set(head, new_value, None);
                    return Ok(());
                }
                let mut current = map.get(head).cloned().unwrap_or(Value::Map(Default::default()));
                current
                    .set_path(rest, new_value)
                    .map_err(SyncError::invalid_argument)?;
                map.set(head, current, None);
                Ok(())
            }
            CrdtDocument::Text(reg) => {
                if !path.is_empty() {
                    return Err(SyncError::invalid_argument(
                        "text documents only support whole-value replacement",
                    ));
                }
                let Value::String(s) = new_value else {
                    return Err(SyncError::invalid_argument("text documents require a string value"));
                };
                reg.set(s);
                Ok(())
            }
            CrdtDocument::List(_) => Err(SyncError::invalid_argument(
                "list documents are mutated with push/remove, not set_at_path",
            )),
        }
    }

    /// Runs `mutator` against this document, producing exactly one update
    /// blob describing everything it changed relative to the state before
    /// the call.
    pub fn transact<F>(&mut self, mutator: F) -> Result<UpdateBlob, SyncError>
    where
        F: FnOnce(&mut CrdtDocument) -> Result<(), SyncError>,
    {
        let before = self.state_vector();
        mutator(self)?;
        Ok(self.encode_update(Some(&before)))
    }

    /// Encodes everything not yet reflected in `since`, or the full document
    /// if `since` is `None`.
    #[must_use]
    pub fn encode_update(&self, since: Option<&StateVector>) -> UpdateBlob {
        match self {
            CrdtDocument::Map(map) => {
                let known: Option<&HashMap<String, Timestamp>> = match since {
                    Some(StateVector::Map(m)) => Some(m),
                    _ => None,
                };
                let mut entries = Vec::new();
                for key in map.all_keys() {
                    let Some(record) = map.get_record(key) else { continue };
                    let already_seen = known
                        .and_then(|m| m.get(key))
                        .is_some_and(|seen| *seen >= record.timestamp);
                    if !already_seen {
                        entries.push((key.clone(), record.clone()));
                    }
                }
                UpdateBlob::Map(entries)
            }
            CrdtDocument::List(seq) => {
                let (known_tags, known_tombstones): (HashSet<String>, HashSet<String>) = match since {
                    Some(StateVector::List { known_tags, known_tombstones }) => {
                        (known_tags.clone(), known_tombstones.clone())
                    }
                    _ => (HashSet::new(), HashSet::new()),
                };
                let records: Vec<ORMapRecord<Value>> = seq
                    .records()
                    .into_iter()
                    .filter(|r| !known_tags.contains(&r.tag))
                    .cloned()
                    .collect();
                let tombstones: Vec<String> = seq
                    .tombstones()
                    .into_iter()
                    .filter(|t| !known_tombstones.contains(*t))
                    .cloned()
                    .collect();
                UpdateBlob::List { records, tombstones }
            }
            CrdtDocument::Text(reg) => {
                let record = reg.record().cloned().unwrap_or(LWWRecord {
                    value: None,
                    timestamp: Timestamp { millis: 0, counter: 0, node_id: String::new() },
                    ttl_ms: None,
                });
                UpdateBlob::Text(record)
            }
        }
    }

    /// Applies an update blob received from a remote replica. Returns an
    /// error if the blob's shape doesn't match this document's kind.
    pub fn apply_update(&mut self, blob: UpdateBlob) -> Result<(), SyncError> {
        match (self, blob) {
            (CrdtDocument::Map(map), UpdateBlob::Map(entries)) => {
                for (key, record) in entries {
                    map.merge(key, record);
                }
                Ok(())
            }
            (CrdtDocument::List(seq), UpdateBlob::List { records, tombstones }) => {
                seq.merge_batch(records, &tombstones);
                Ok(())
            }
            (CrdtDocument::Text(reg), UpdateBlob::Text(record)) => {
                reg.merge(record);
                Ok(())
            }
            _ => Err(SyncError::new(
                ErrorKind::Protocol,
                "update blob kind does not match document kind",
            )),
        }
    }

    /// Snapshots the whole document as a single [`Value`], for structural
    /// diffing against another replica's snapshot (the conflict manager's
    /// only use for this; callers needing live access should use
    /// [`get_path`](CrdtDocument::get_path) instead).
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            CrdtDocument::Map(map) => {
                Value::Map(map.entries().map(|(k, v)| (k.clone(), v.clone())).collect())
            }
            CrdtDocument::List(seq) => Value::Array(seq.to_vec().into_iter().cloned().collect()),
            CrdtDocument::Text(reg) => reg.get().cloned().map(Value::String).unwrap_or(Value::Null),
        }
    }

    /// The state vector a future [`encode_update`](CrdtDocument::encode_update)
    /// call can be compared against to find what changed since now.
    #[must_use]
    pub fn state_vector(&self) -> StateVector {
        match self {
            CrdtDocument::Map(map) => {
                let mut out = HashMap::new();
                for key in map.all_keys() {
                    if let Some(record) = map.get_record(key) {
                        out.insert(key.clone(), record.timestamp.clone());
                    }
                }
                StateVector::Map(out)
            }
            CrdtDocument::List(seq) => StateVector::List {
                known_tags: seq.records().into_iter().map(|r| r.tag.clone()).collect(),
                known_tombstones: seq.tombstones().into_iter().cloned().collect(),
            },
            CrdtDocument::Text(reg) => StateVector::Text(
                reg.last_timestamp()
                    .cloned()
                    .unwrap_or(Timestamp { millis: 0, counter: 0, node_id: String::new() }),
            ),
        }
    }
}

fn split_path(path: &str) -> Option<(&str, &str)> {
    if path.is_empty() {
        return None;
    }
    match path.split_once('.') {
        Some((head, rest)) => Some((head, rest)),
        None => Some((path, "")),
    }
}
