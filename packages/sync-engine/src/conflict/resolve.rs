//! Resolution strategies (§4.3): turns a conflict's local/remote pair into
//! one resolved [`Value`], per the closed `ResolutionStrategy` set.
//!
//! `auto_merge`'s per-kind behavior is a [`MergeRegistry`] of
//! [`KindHandler`]s keyed by [`ValueTag`] rather than one `match` — tagged-
//! variant dispatch through a registry a caller can override one entry of
//! (swap the array merge policy) without forking [`super::ConflictManager`].

use std::collections::{BTreeMap, HashMap};

use sync_core::model::ResolutionStrategy;
use sync_core::{ErrorKind, Result, SyncError, Timestamp, Value};

/// Per-field choice used by the `field_level` strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldChoice {
    Local,
    Remote,
    Merged,
}

/// The dispatch key a [`MergeRegistry`] looks handlers up by — one entry per
/// structural shape `auto_merge` treats differently, not one per [`Value`]
/// variant (`Null`/`Bool`/`Int`/`Float`/`String`/`Bytes` all merge the same
/// way: newer-wins).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueTag {
    Array,
    Map,
    Primitive,
}

impl ValueTag {
    fn of(value: &Value) -> Self {
        match value {
            Value::Array(_) => ValueTag::Array,
            Value::Map(_) => ValueTag::Map,
            _ => ValueTag::Primitive,
        }
    }
}

/// One kind's `auto_merge` policy.
pub trait KindHandler: Send + Sync {
    fn merge(&self, registry: &MergeRegistry, local: &Value, remote: &Value, local_ts: Option<&Timestamp>, remote_ts: Option<&Timestamp>) -> Value;
}

/// Newer-timestamp-wins, falling back to remote when neither side carries
/// timestamp metadata (§9 Open Question 2's adopted resolution).
struct PrimitiveHandler;

impl KindHandler for PrimitiveHandler {
    fn merge(&self, _registry: &MergeRegistry, local: &Value, remote: &Value, local_ts: Option<&Timestamp>, remote_ts: Option<&Timestamp>) -> Value {
        match (local_ts, remote_ts) {
            (Some(l), Some(r)) if l > r => local.clone(),
            _ => remote.clone(),
        }
    }
}

/// Concatenates `local` then `remote`, deduping by deep equality while
/// preserving local order (§4.3 `auto_merge` array rule).
struct ArrayHandler;

impl KindHandler for ArrayHandler {
    fn merge(&self, _registry: &MergeRegistry, local: &Value, remote: &Value, _local_ts: Option<&Timestamp>, _remote_ts: Option<&Timestamp>) -> Value {
        let (Value::Array(local), Value::Array(remote)) = (local, remote) else {
            return remote.clone();
        };
        let mut merged: Vec<Value> = Vec::with_capacity(local.len() + remote.len());
        for item in local.iter().chain(remote.iter()) {
            if !merged.iter().any(|existing: &Value| existing.structurally_equal(item)) {
                merged.push(item.clone());
            }
        }
        Value::Array(merged)
    }
}

/// Deep merge: shared keys recurse through the registry (so a nested array
/// inside a conflicting map field still gets array-deduped, not
/// newer-wins'd); keys present on one side only pass through unchanged.
struct MapHandler;

impl KindHandler for MapHandler {
    fn merge(&self, registry: &MergeRegistry, local: &Value, remote: &Value, local_ts: Option<&Timestamp>, remote_ts: Option<&Timestamp>) -> Value {
        let (Value::Map(local), Value::Map(remote)) = (local, remote) else {
            return remote.clone();
        };
        let mut merged: BTreeMap<String, Value> = local.clone();
        for (key, remote_value) in remote {
            match local.get(key) {
                None => {
                    merged.insert(key.clone(), remote_value.clone());
                }
                Some(local_value) if !local_value.structurally_equal(remote_value) => {
                    merged.insert(key.clone(), registry.merge(local_value, remote_value, local_ts, remote_ts));
                }
                Some(_) => {}
            }
        }
        Value::Map(merged)
    }
}

/// `HashMap<ValueTag, Box<dyn KindHandler>>` built once per
/// [`super::ConflictManager`]; `auto_merge` dispatch is a lookup here rather
/// than a `match` buried in one function (§4.3.1).
pub struct MergeRegistry {
    handlers: HashMap<ValueTag, Box<dyn KindHandler>>,
}

impl MergeRegistry {
    #[must_use]
    pub fn new() -> Self {
        let mut handlers: HashMap<ValueTag, Box<dyn KindHandler>> = HashMap::new();
        handlers.insert(ValueTag::Primitive, Box::new(PrimitiveHandler));
        handlers.insert(ValueTag::Array, Box::new(ArrayHandler));
        handlers.insert(ValueTag::Map, Box::new(MapHandler));
        Self { handlers }
    }

    /// Overrides the handler for one kind, e.g. to swap in a different array
    /// merge policy without forking the rest of the registry.
    pub fn set_handler(&mut self, tag: ValueTag, handler: Box<dyn KindHandler>) {
        self.handlers.insert(tag, handler);
    }

    /// Merges `local` and `remote` per the handler registered for `local`'s
    /// kind, falling back to accept-remote if a kind has no handler
    /// registered (can only happen after [`MergeRegistry::set_handler`]
    /// removes... it never does, `set_handler` only replaces; kept for
    /// defense against a future caller building a `MergeRegistry` by hand).
    #[must_use]
    pub fn merge(&self, local: &Value, remote: &Value, local_ts: Option<&Timestamp>, remote_ts: Option<&Timestamp>) -> Value {
        match self.handlers.get(&ValueTag::of(local)) {
            Some(handler) => handler.merge(self, local, remote, local_ts, remote_ts),
            None => remote.clone(),
        }
    }
}

impl Default for MergeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Applies a resolution strategy to one conflict's local/remote values,
/// returning the resolved value to write back.
pub fn resolve_value(
    strategy: ResolutionStrategy,
    local: Option<&Value>,
    remote: Option<&Value>,
    local_ts: Option<&Timestamp>,
    remote_ts: Option<&Timestamp>,
    custom: Option<Value>,
    merge_registry: &MergeRegistry,
) -> Result<Value> {
    match strategy {
        ResolutionStrategy::KeepLocal => {
            local.cloned().ok_or_else(|| SyncError::invalid_argument("no local value to keep"))
        }
        ResolutionStrategy::AcceptRemote => {
            remote.cloned().ok_or_else(|| SyncError::invalid_argument("no remote value to accept"))
        }
        ResolutionStrategy::TakeNewer => match (local, remote) {
            (Some(l), Some(r)) => Ok(PrimitiveHandler.merge(merge_registry, l, r, local_ts, remote_ts)),
            (Some(l), None) => Ok(l.clone()),
            (None, Some(r)) => Ok(r.clone()),
            (None, None) => Err(SyncError::invalid_argument("no value to resolve")),
        },
        ResolutionStrategy::TakeOlder => match (local_ts, remote_ts, local, remote) {
            (Some(l_ts), Some(r_ts), Some(l), Some(r)) => {
                Ok(if l_ts < r_ts { l.clone() } else { r.clone() })
            }
            (_, _, Some(l), _) => Ok(l.clone()),
            (_, _, None, Some(r)) => Ok(r.clone()),
            _ => Err(SyncError::invalid_argument("no value to resolve")),
        },
        ResolutionStrategy::AutoMerge => match (local, remote) {
            (Some(l), Some(r)) => Ok(merge_registry.merge(l, r, local_ts, remote_ts)),
            (Some(l), None) => Ok(l.clone()),
            (None, Some(r)) => Ok(r.clone()),
            (None, None) => Err(SyncError::invalid_argument("no value to resolve")),
        },
        ResolutionStrategy::FieldLevel => Err(SyncError::invalid_argument(
            "field_level resolution requires per-field choices; use resolve_field_level",
        )),
        ResolutionStrategy::Custom => {
            custom.ok_or_else(|| SyncError::invalid_argument("custom strategy requires a caller-supplied value"))
        }
        ResolutionStrategy::Manual => Err(SyncError::new(ErrorKind::InvalidArgument, "manual is not a terminal strategy")),
    }
}
