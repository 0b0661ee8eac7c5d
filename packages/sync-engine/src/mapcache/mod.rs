//! Offline Map Cache (component E, §4.5): bounded tile storage plus a
//! per-layer vector feature cache, both built on the same [`Persistence`]
//! trait the document store uses.

pub mod features;
pub mod tiles;

pub use features::FeatureStore;
pub use tiles::{TileCache, TileCacheConfig};
