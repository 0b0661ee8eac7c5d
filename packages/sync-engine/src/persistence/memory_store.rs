//! In-memory [`Persistence`] implementation backed by [`DashMap`], styled on
//! the teacher's `HashMapStorage`. Used by tests and by embedders with no
//! writable filesystem; data does not survive process restart.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use sync_core::model::{SyncQueueEntry, SyncQueueStatus};
use sync_core::Result;

use super::Persistence;

/// In-memory stand-in for [`RedbPersistence`](super::redb_store::RedbPersistence).
pub struct MemoryPersistence {
    documents: DashMap<String, Vec<u8>>,
    metadata: DashMap<String, Vec<u8>>,
    sync_queue: DashMap<u64, SyncQueueEntry>,
    assets: DashMap<String, Vec<u8>>,
    configs: DashMap<String, Vec<u8>>,
    next_id: AtomicU64,
}

impl MemoryPersistence {
    #[must_use]
    pub fn new() -> Self {
        Self {
            documents: DashMap::new(),
            metadata: DashMap::new(),
            sync_queue: DashMap::new(),
            assets: DashMap::new(),
            configs: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }
}

impl Default for MemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn put_document(&self, doc_id: &str, blob: Vec<u8>) -> Result<()> {
        self.documents.insert(doc_id.to_string(), blob);
        Ok(())
    }

    async fn get_document(&self, doc_id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.documents.get(doc_id).map(|r| r.clone()))
    }

    async fn delete_document(&self, doc_id: &str) -> Result<()> {
        self.documents.remove(doc_id);
        Ok(())
    }

    async fn put_metadata(&self, doc_id: &str, blob: Vec<u8>) -> Result<()> {
        self.metadata.insert(doc_id.to_string(), blob);
        Ok(())
    }

    async fn get_metadata(&self, doc_id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.metadata.get(doc_id).map(|r| r.clone()))
    }

    async fn delete_metadata(&self, doc_id: &str) -> Result<()> {
        self.metadata.remove(doc_id);
        Ok(())
    }

    async fn put_document_and_metadata(
        &self,
        doc_id: &str,
        document_blob: Vec<u8>,
        metadata_blob: Vec<u8>,
    ) -> Result<()> {
        self.documents.insert(doc_id.to_string(), document_blob);
        self.metadata.insert(doc_id.to_string(), metadata_blob);
        Ok(())
    }

    async fn delete_document_and_metadata(&self, doc_id: &str) -> Result<()> {
        self.documents.remove(doc_id);
        self.metadata.remove(doc_id);
        Ok(())
    }

    async fn enqueue_sync_entry(&self, mut entry: SyncQueueEntry) -> Result<u64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        entry.id = id;
        self.sync_queue.insert(id, entry);
        Ok(id)
    }

    async fn list_sync_entries(&self, status: Option<SyncQueueStatus>) -> Result<Vec<SyncQueueEntry>> {
        let mut entries: Vec<SyncQueueEntry> = self
            .sync_queue
            .iter()
            .map(|r| r.value().clone())
            .filter(|e| status.is_none_or(|s| e.status == s))
            .collect();
        entries.sort_by_key(|e| e.id);
        Ok(entries)
    }

    async fn get_sync_entry(&self, id: u64) -> Result<Option<SyncQueueEntry>> {
        Ok(self.sync_queue.get(&id).map(|r| r.clone()))
    }

    async fn update_sync_entry(&self, entry: SyncQueueEntry) -> Result<()> {
        self.sync_queue.insert(entry.id, entry);
        Ok(())
    }

    async fn remove_sync_entry(&self, id: u64) -> Result<()> {
        self.sync_queue.remove(&id);
        Ok(())
    }

    async fn clear_sync_entries(&self, status: Option<SyncQueueStatus>) -> Result<()> {
        match status {
            None => self.sync_queue.clear(),
            Some(s) => self.sync_queue.retain(|_, e| e.status != s),
        }
        Ok(())
    }

    async fn put_asset(&self, key: &str, blob: Vec<u8>) -> Result<()> {
        self.assets.insert(key.to_string(), blob);
        Ok(())
    }

    async fn get_asset(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.assets.get(key).map(|r| r.clone()))
    }

    async fn delete_asset(&self, key: &str) -> Result<()> {
        self.assets.remove(key);
        Ok(())
    }

    async fn list_asset_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .assets
            .iter()
            .map(|r| r.key().clone())
            .filter(|k| k.starts_with(prefix))
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn put_config(&self, key: &str, blob: Vec<u8>) -> Result<()> {
        self.configs.insert(key.to_string(), blob);
        Ok(())
    }

    async fn get_config(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.configs.get(key).map(|r| r.clone()))
    }

    async fn delete_config(&self, key: &str) -> Result<()> {
        self.configs.remove(key);
        Ok(())
    }

    async fn list_document_ids(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.documents.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        Ok(ids)
    }
}
