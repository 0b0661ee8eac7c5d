//! Persistence Layer (component A): durable, transactional, key-indexed
//! storage for the five logical collections named in the data model —
//! documents, metadata, the outbound sync queue, assets, and configs.
//!
//! Every implementation is reached through one object-safe [`Persistence`]
//! trait so the rest of the engine never knows whether it's talking to a
//! `redb` file on disk or an in-memory stand-in used by tests. All calls are
//! atomic per invocation; [`Persistence::put_document_and_metadata`] is the
//! one operation that must be atomic across two tables at once, preserving
//! "metadata exists iff the document exists."

pub mod memory_store;
#[cfg(feature = "redb")]
pub mod redb_store;

use async_trait::async_trait;
use sync_core::model::{SyncQueueEntry, SyncQueueStatus};
use sync_core::{ErrorKind, Result, SyncError};

pub use memory_store::MemoryPersistence;
#[cfg(feature = "redb")]
pub use redb_store::RedbPersistence;

fn storage_err(context: &str, source: impl std::error::Error + Send + Sync + 'static) -> SyncError {
    tracing::error!(context, error = %source, "persistence operation failed");
    SyncError::with_source(ErrorKind::Storage, context.to_string(), source)
}

/// Durable key-indexed storage for documents, metadata, the sync queue,
/// assets, and configs. Implementors must survive process restart and
/// require no network to operate.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn put_document(&self, doc_id: &str, blob: Vec<u8>) -> Result<()>;
    async fn get_document(&self, doc_id: &str) -> Result<Option<Vec<u8>>>;
    async fn delete_document(&self, doc_id: &str) -> Result<()>;

    async fn put_metadata(&self, doc_id: &str, blob: Vec<u8>) -> Result<()>;
    async fn get_metadata(&self, doc_id: &str) -> Result<Option<Vec<u8>>>;
    async fn delete_metadata(&self, doc_id: &str) -> Result<()>;

    /// Writes a document blob and its metadata blob in one transaction.
    async fn put_document_and_metadata(
        &self,
        doc_id: &str,
        document_blob: Vec<u8>,
        metadata_blob: Vec<u8>,
    ) -> Result<()>;

    /// Deletes a document blob and its metadata blob in one transaction.
    async fn delete_document_and_metadata(&self, doc_id: &str) -> Result<()>;

    /// Enqueues a durable sync-queue entry, returning its assigned id. The
    /// entry's own `id` field is ignored and overwritten with the assigned one.
    async fn enqueue_sync_entry(&self, entry: SyncQueueEntry) -> Result<u64>;
    async fn list_sync_entries(&self, status: Option<SyncQueueStatus>) -> Result<Vec<SyncQueueEntry>>;
    async fn get_sync_entry(&self, id: u64) -> Result<Option<SyncQueueEntry>>;
    async fn update_sync_entry(&self, entry: SyncQueueEntry) -> Result<()>;
    async fn remove_sync_entry(&self, id: u64) -> Result<()>;
    async fn clear_sync_entries(&self, status: Option<SyncQueueStatus>) -> Result<()>;

    async fn put_asset(&self, key: &str, blob: Vec<u8>) -> Result<()>;
    async fn get_asset(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn delete_asset(&self, key: &str) -> Result<()>;
    /// Lists every asset key with the given prefix. Used to rebuild the tile
    /// cache's in-memory index on startup.
    async fn list_asset_keys(&self, prefix: &str) -> Result<Vec<String>>;

    async fn put_config(&self, key: &str, blob: Vec<u8>) -> Result<()>;
    async fn get_config(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn delete_config(&self, key: &str) -> Result<()>;

    /// Lists every document id with a stored document blob. Used on startup
    /// to seed the sync queue when `syncOnStartup` is enabled (§4.4).
    async fn list_document_ids(&self) -> Result<Vec<String>>;
}
