//! CRDT collaborators backing synced documents.
//!
//! [`LwwMap`] and [`or_map::ORMap`] are the two convergent data structures;
//! [`OrSequence`] and [`LwwRegister`] adapt `ORMap` and a single LWW record
//! into the `List`/`Text` document kinds. [`CrdtDocument`] is the enum
//! callers actually hold.

pub mod document;
pub mod lww_map;
pub mod or_map;
pub mod sequence;
pub mod text;

pub use document::{CrdtDocument, DocumentKind, StateVector, UpdateBlob};
pub use lww_map::LwwMap;
pub use or_map::ORMap;
pub use sequence::OrSequence;
pub use text::LwwRegister;
