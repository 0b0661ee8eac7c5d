//! Shared data-model types that flow between the document store, conflict
//! manager, and sync scheduler. Kept in `sync-core` (not `sync-engine`) so
//! that `sync-engine`'s persistence layer and its conflict/scheduler modules
//! agree on the same record shapes without a dependency cycle.

use serde::{Deserialize, Serialize};

use crate::hlc::Timestamp;
use crate::value::Value;

/// Where a change originated. Used to suppress echo loops: a change applied
/// because it arrived from the network must not be re-queued for sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    Local,
    Remote,
}

/// Per-document sync status, surfaced to the embedding application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncStatus {
    Unsynced,
    Syncing,
    Synced,
    Failed,
    Conflict,
    Offline,
}

/// Bookkeeping record stored alongside a document's CRDT state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMetadata {
    pub doc_id: String,
    pub kind: crate::crdt::DocumentKind,
    pub created_at: Timestamp,
    pub last_modified: Timestamp,
    pub last_synced: Option<Timestamp>,
    /// Monotonically increasing; incremented on every observed local mutation.
    pub version: u64,
    pub sync_status: SyncStatus,
    /// Byte size of the last serialized state, informational only.
    pub size: Option<u64>,
    pub created_by: Option<String>,
    pub updated_by: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncQueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// One pending unit of work for the background sync scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueEntry {
    pub id: u64,
    pub doc_id: String,
    pub operation: SyncOperation,
    pub status: SyncQueueStatus,
    pub attempts: u32,
    pub next_attempt_at: Option<Timestamp>,
    pub last_error: Option<String>,
    pub enqueued_at: Timestamp,
    /// Dequeued ahead of lower-priority entries within a drained batch.
    /// Higher sorts first.
    pub priority: i32,
    /// Serialized update blob (or tombstone marker, for a [`SyncOperation::Delete`])
    /// captured at enqueue time, so a durable `delete` entry survives a
    /// process restart without depending on the document still existing in
    /// the store when the entry is finally popped.
    pub payload: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictType {
    Value,
    Structure,
    Deletion,
    Existence,
    Dependency,
    Version,
    Schema,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictStatus {
    Detected,
    Pending,
    Resolved,
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResolutionStrategy {
    KeepLocal,
    AcceptRemote,
    TakeNewer,
    TakeOlder,
    AutoMerge,
    FieldLevel,
    Custom,
    Manual,
}

/// A detected conflict between local and remote state for a single field path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub id: String,
    pub doc_id: String,
    pub field_path: String,
    pub conflict_type: ConflictType,
    pub status: ConflictStatus,
    pub local_value: Option<Value>,
    pub remote_value: Option<Value>,
    pub local_timestamp: Timestamp,
    pub remote_timestamp: Timestamp,
    pub resolution: Option<ResolutionStrategy>,
    pub detected_at: Timestamp,
    pub resolved_at: Option<Timestamp>,
    /// Principal that resolved or ignored the conflict. `None` while pending.
    pub resolved_by: Option<String>,
    /// Value actually written back for a whole-conflict resolution. `None`
    /// while pending, and for a [`ResolutionStrategy::FieldLevel`] record
    /// (see `field_resolutions` instead).
    pub resolved_value: Option<Value>,
    /// Per-field choice for a conflict resolved via `resolve_field_level`,
    /// keyed by field path. `None` for conflicts resolved as a whole.
    pub field_resolutions: Option<std::collections::BTreeMap<String, ResolutionStrategy>>,
}

/// What transition an [`AuditLogEntry`] records (§3.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuditAction {
    Detected,
    Resolved,
    Ignored,
}

/// Append-only record of a conflict lifecycle transition, for audit/debugging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    pub id: u64,
    pub doc_id: String,
    pub conflict_id: String,
    pub action: AuditAction,
    pub strategy: Option<ResolutionStrategy>,
    pub applied_value: Option<Value>,
    pub applied_at: Timestamp,
    pub applied_by: String,
    /// Free-form context: the conflicting field path on `detected`, the
    /// ignore reason if the caller gave one, etc.
    pub details: Option<String>,
}

/// A bounding box in `(min_lon, min_lat, max_lon, max_lat)` order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    #[must_use]
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_lon <= other.max_lon
            && self.max_lon >= other.min_lon
            && self.min_lat <= other.max_lat
            && self.max_lat >= other.min_lat
    }
}

/// A cached raster/vector map tile, addressed by slippy-map coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tile {
    pub z: u8,
    pub x: u32,
    pub y: u32,
    pub layer: String,
    pub data: Vec<u8>,
    pub fetched_at: Timestamp,
    pub size_bytes: u64,
    pub mime_type: Option<String>,
    /// When the tile must be evicted and treated as absent, regardless of
    /// [`TileCacheConfig::max_age_ms`](crate) bounds. `None` if the source
    /// gave no expiry and age-based eviction is the only bound that applies.
    pub expires_at: Option<Timestamp>,
    /// Cache-validation token from the tile source, opaque to this crate.
    pub etag: Option<String>,
}

impl Tile {
    #[must_use]
    pub fn cache_key(&self) -> String {
        format!("{}/{}/{}/{}", self.layer, self.z, self.x, self.y)
    }
}

/// Geometry for a cached vector feature. Only enough shape to support
/// bounding-box filtering; full geometric operations are an embedder concern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Geometry {
    Point { coordinates: (f64, f64) },
    LineString { coordinates: Vec<(f64, f64)> },
    Polygon { coordinates: Vec<Vec<(f64, f64)>> },
}

impl Geometry {
    #[must_use]
    pub fn bbox(&self) -> BoundingBox {
        let points: Vec<(f64, f64)> = match self {
            Geometry::Point { coordinates } => vec![*coordinates],
            Geometry::LineString { coordinates } => coordinates.clone(),
            Geometry::Polygon { coordinates } => coordinates.iter().flatten().copied().collect(),
        };
        let (mut min_lon, mut min_lat) = (f64::INFINITY, f64::INFINITY);
        let (mut max_lon, mut max_lat) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
        for (lon, lat) in points {
            min_lon = min_lon.min(lon);
            min_lat = min_lat.min(lat);
            max_lon = max_lon.max(lon);
            max_lat = max_lat.max(lat);
        }
        BoundingBox { min_lon, min_lat, max_lon, max_lat }
    }
}

/// A vector feature cached for offline map rendering.
///
/// `synced == true` is an invariant: it only holds while this record is
/// byte-identical to the last version the server acknowledged. Any local
/// write (`FeatureStore::put`) must flip it back to `false`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorFeature {
    pub id: String,
    pub layer: String,
    pub geometry: Geometry,
    pub properties: Value,
    pub last_modified: Timestamp,
    pub synced: bool,
}
