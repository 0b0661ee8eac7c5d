//! Bounded offline tile cache (§4.5 "tile cache"): stores raster/vector
//! tiles keyed by `layer/z/x/y`, evicting by count, total size, and age so
//! offline storage never grows unbounded.

use std::collections::HashMap;
use std::sync::Arc;

use sync_core::model::Tile;
use sync_core::{ClockSource, ErrorKind, Result, SyncError, SystemClock, Timestamp};

use crate::persistence::Persistence;

const TILE_KEY_PREFIX: &str = "tile:";

/// Eviction limits for the tile cache.
#[derive(Debug, Clone, Copy)]
pub struct TileCacheConfig {
    pub max_tiles: usize,
    pub max_total_bytes: u64,
    pub max_age_ms: u64,
}

impl Default for TileCacheConfig {
    fn default() -> Self {
        Self { max_tiles: 2_000, max_total_bytes: 200 * 1024 * 1024, max_age_ms: 30 * 24 * 60 * 60 * 1000 }
    }
}

struct TileIndexEntry {
    fetched_at: Timestamp,
    size_bytes: u64,
}

/// Tracks stored tiles and enforces [`TileCacheConfig`]'s bounds.
pub struct TileCache {
    persistence: Arc<dyn Persistence>,
    config: TileCacheConfig,
    index: parking_lot::Mutex<HashMap<String, TileIndexEntry>>,
}

impl TileCache {
    /// Rebuilds the in-memory index from durable storage at startup.
    pub async fn load(persistence: Arc<dyn Persistence>, config: TileCacheConfig) -> Result<Self> {
        let keys = persistence.list_asset_keys(TILE_KEY_PREFIX).await?;
        let mut index = HashMap::new();
        for key in keys {
            if let Some(bytes) = persistence.get_asset(&key).await? {
                if let Ok(tile) = rmp_serde::from_slice::<Tile>(&bytes) {
                    index.insert(key, TileIndexEntry { fetched_at: tile.fetched_at, size_bytes: tile.size_bytes });
                }
            }
        }
        Ok(Self { persistence, config, index: parking_lot::Mutex::new(index) })
    }

    pub async fn put(&self, tile: Tile) -> Result<()> {
        let key = format!("{TILE_KEY_PREFIX}{}", tile.cache_key());
        let bytes = rmp_serde::to_vec_named(&tile)
            .map_err(|e| SyncError::with_source(ErrorKind::Storage, "failed to encode tile", e))?;
        self.persistence.put_asset(&key, bytes).await?;
        self.index.lock().insert(key, TileIndexEntry { fetched_at: tile.fetched_at, size_bytes: tile.size_bytes });
        self.evict_if_needed().await
    }

    /// Looks up one tile, evicting and returning `None` if its per-tile
    /// `expiresAt` has passed (§4.5 step 3) -- independent of the batch
    /// `maxAgeMs` bound enforced by [`Self::evict_expired`].
    pub async fn get(&self, layer: &str, z: u8, x: u32, y: u32) -> Result<Option<Tile>> {
        let key = format!("{TILE_KEY_PREFIX}{layer}/{z}/{x}/{y}");
        let Some(bytes) = self.persistence.get_asset(&key).await? else { return Ok(None) };
        let tile: Tile = rmp_serde::from_slice(&bytes)
            .map_err(|e| SyncError::with_source(ErrorKind::Storage, "failed to decode tile", e))?;

        if let Some(expires_at) = &tile.expires_at {
            if expires_at.millis < SystemClock.now() {
                self.persistence.delete_asset(&key).await?;
                self.index.lock().remove(&key);
                return Ok(None);
            }
        }
        Ok(Some(tile))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.index.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.index.lock().values().map(|e| e.size_bytes).sum()
    }

    /// Evicts tiles oldest-first until the cache satisfies its count, size,
    /// and age bounds. Age is evaluated against `now_millis`.
    pub async fn evict_expired(&self, now_millis: u64) -> Result<usize> {
        let stale: Vec<String> = self
            .index
            .lock()
            .iter()
            .filter(|(_, e)| now_millis.saturating_sub(e.fetched_at.millis) > self.config.max_age_ms)
            .map(|(k, _)| k.clone())
            .collect();

        for key in &stale {
            self.persistence.delete_asset(key).await?;
            self.index.lock().remove(key);
        }
        Ok(stale.len())
    }

    async fn evict_if_needed(&self) -> Result<()> {
        loop {
            let over_count = self.index.lock().len() > self.config.max_tiles;
            let over_bytes = self.total_bytes() > self.config.max_total_bytes;
            if !over_count && !over_bytes {
                return Ok(());
            }

            let oldest_key = {
                let index = self.index.lock();
                index.iter().min_by_key(|(_, e)| e.fetched_at.clone()).map(|(k, _)| k.clone())
            };
            let Some(key) = oldest_key else { return Ok(()) };
            self.persistence.delete_asset(&key).await?;
            self.index.lock().remove(&key);
        }
    }
}
