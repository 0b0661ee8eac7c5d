//! Engine-wide configuration (§2.2). Deserializable from the embedding
//! application's own config file/environment so a typo in a key surfaces as
//! a deserialize error instead of a silently-ignored field.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sync_core::{ErrorKind, Result, SyncError};

use crate::mapcache::TileCacheConfig as MapTileCacheConfig;
use crate::sync::RetryPolicy;

/// When the scheduler drives sync rounds (§4.4 `mode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncMode {
    /// Every local mutation triggers a sync round as soon as it commits.
    Immediate,
    /// Sync rounds run only via the configured triggers and explicit calls.
    Background,
    /// Nothing is queued or synced automatically; the embedder drives everything.
    Manual,
    /// A timer fires a full sync round every `sync_interval_ms`.
    Scheduled,
}

/// Which way document changes flow in a sync round (§4.4 `direction`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncDirection {
    Upload,
    Download,
    Bidirectional,
}

impl Default for SyncDirection {
    fn default() -> Self {
        SyncDirection::Bidirectional
    }
}

/// Sync scheduler tunables (§4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct SyncConfig {
    #[serde(default = "default_mode")]
    pub mode: SyncMode,
    #[serde(default = "default_direction")]
    pub direction: SyncDirection,
    pub max_concurrent_syncs: usize,
    pub network_timeout_ms: u64,
    pub retry_delay_ms: u64,
    pub retry_backoff_factor: f64,
    pub max_retry_delay_ms: u64,
    pub retry_limit: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Interval between scheduled rounds when `mode` is [`SyncMode::Scheduled`].
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
    #[serde(default = "default_true")]
    pub sync_on_startup: bool,
    #[serde(default = "default_true")]
    pub sync_on_network_change: bool,
    #[serde(default)]
    pub sync_on_focus: bool,
    #[serde(default = "default_true")]
    pub sync_on_document_change: bool,
    /// Documents dequeued ahead of the rest of the batch.
    #[serde(default)]
    pub priority_docs: BTreeSet<String>,
    /// Documents never enqueued, regardless of trigger.
    #[serde(default)]
    pub excluded_docs: BTreeSet<String>,
}

fn default_mode() -> SyncMode {
    SyncMode::Background
}

fn default_direction() -> SyncDirection {
    SyncDirection::Bidirectional
}

fn default_batch_size() -> usize {
    10
}

fn default_sync_interval_ms() -> u64 {
    300_000
}

fn default_true() -> bool {
    true
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            direction: default_direction(),
            max_concurrent_syncs: 3,
            network_timeout_ms: 30_000,
            retry_delay_ms: 5_000,
            retry_backoff_factor: 1.5,
            max_retry_delay_ms: 60_000,
            retry_limit: 5,
            batch_size: default_batch_size(),
            sync_interval_ms: default_sync_interval_ms(),
            sync_on_startup: true,
            sync_on_network_change: true,
            sync_on_focus: false,
            sync_on_document_change: true,
            priority_docs: BTreeSet::new(),
            excluded_docs: BTreeSet::new(),
        }
    }
}

impl From<SyncConfig> for RetryPolicy {
    fn from(config: SyncConfig) -> Self {
        RetryPolicy {
            retry_delay_ms: config.retry_delay_ms,
            backoff_multiplier: config.retry_backoff_factor,
            max_delay_ms: config.max_retry_delay_ms,
            max_attempts: config.retry_limit,
        }
    }
}

/// Offline map cache tunables (§4.5), mirroring [`MapTileCacheConfig`] in a
/// serde-friendly shape.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct TileCacheSettings {
    pub max_tiles: usize,
    pub max_total_bytes: u64,
    pub max_age_ms: u64,
}

impl Default for TileCacheSettings {
    fn default() -> Self {
        let defaults = MapTileCacheConfig::default();
        Self { max_tiles: defaults.max_tiles, max_total_bytes: defaults.max_total_bytes, max_age_ms: defaults.max_age_ms }
    }
}

impl From<TileCacheSettings> for MapTileCacheConfig {
    fn from(settings: TileCacheSettings) -> Self {
        MapTileCacheConfig {
            max_tiles: settings.max_tiles,
            max_total_bytes: settings.max_total_bytes,
            max_age_ms: settings.max_age_ms,
        }
    }
}

/// Top-level configuration for a [`crate::SyncEngine`] instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Identifies this replica in HLC timestamps and sync requests.
    pub node_id: String,
    /// Path to the `redb` database file. Ignored when the `redb` feature is disabled.
    pub db_path: String,
    /// Endpoint the default [`crate::sync::HttpTransport`] posts to.
    pub sync_endpoint: String,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub tile_cache: TileCacheSettings,
}

impl EngineConfig {
    #[must_use]
    pub fn new(node_id: impl Into<String>, db_path: impl Into<String>, sync_endpoint: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            db_path: db_path.into(),
            sync_endpoint: sync_endpoint.into(),
            sync: SyncConfig::default(),
            tile_cache: TileCacheSettings::default(),
        }
    }

    /// Reads a TOML config file and applies `SYNC_`-prefixed environment
    /// overrides on top of it (`SYNC_NODE_ID`, `SYNC_DB_PATH`,
    /// `SYNC_SYNC_ENDPOINT`, `SYNC_MAX_CONCURRENT_SYNCS`), so a deployment
    /// can ship one file and vary the replica id / endpoint per instance
    /// without templating the file itself.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            SyncError::with_source(ErrorKind::Storage, format!("failed to read config file '{}'", path.display()), e)
        })?;
        let mut config: Self = toml::from_str(&contents)
            .map_err(|e| SyncError::with_source(ErrorKind::InvalidArgument, "failed to parse config file as TOML", e))?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SYNC_NODE_ID") {
            self.node_id = v;
        }
        if let Ok(v) = std::env::var("SYNC_DB_PATH") {
            self.db_path = v;
        }
        if let Ok(v) = std::env::var("SYNC_SYNC_ENDPOINT") {
            self.sync_endpoint = v;
        }
        if let Ok(v) = std::env::var("SYNC_MAX_CONCURRENT_SYNCS") {
            if let Ok(n) = v.parse() {
                self.sync.max_concurrent_syncs = n;
            }
        }
    }
}
