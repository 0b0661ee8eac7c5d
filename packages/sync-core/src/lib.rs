//! Sync core -- CRDT document kinds, Hybrid Logical Clock, and the closed
//! error taxonomy shared by every layer of the offline sync engine.
//!
//! - **HLC** ([`hlc`]): Hybrid Logical Clock for distributed causality tracking
//! - **Hash** ([`hash`]): FNV-1a hash utilities for `MerkleTree` bucket routing
//! - **Merkle** ([`merkle`]): Prefix trie for cheap divergence checks
//! - **Value** ([`value`]): the JSON-like payload type stored in every document
//! - **CRDT** ([`crdt`]): `LwwMap`, `OrSequence`, `LwwRegister`, and the
//!   `CrdtDocument` enum that wraps them
//! - **Error** ([`error`]): `SyncError` / `ErrorKind`, the closed error taxonomy

pub mod crdt;
pub mod error;
pub mod hash;
pub mod hlc;
pub mod merkle;
pub mod model;
pub mod value;

pub use crdt::{CrdtDocument, DocumentKind, LwwMap, LwwRegister, OrSequence, StateVector, UpdateBlob};
pub use error::{ErrorKind, Result, SyncError};
pub use hash::{combine_hashes, fnv1a_hash};
pub use hlc::{ClockSource, LWWRecord, MergeKeyResult, ORMapRecord, SystemClock, Timestamp, HLC};
pub use merkle::{MerkleNode, MerkleTree, ORMapMerkleTree};
pub use model::{
    AuditAction, AuditLogEntry, BoundingBox, ConflictRecord, ConflictStatus, ConflictType,
    DocumentMetadata, Geometry, Origin, ResolutionStrategy, SyncOperation, SyncQueueEntry,
    SyncQueueStatus, SyncStatus, Tile, VectorFeature,
};
pub use value::Value;
