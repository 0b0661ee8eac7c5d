//! `redb`-backed [`Persistence`]: an embedded, single-file, ACID key-value
//! store. Chosen over a client-server database (the teacher's optional
//! `postgres`/`sqlx` backend) because this engine targets offline-first,
//! no-network operation — every other backend option assumes a reachable
//! server, which defeats the purpose.
//!
//! `redb`'s transactions are synchronous; every call here is wrapped in
//! `tokio::task::spawn_blocking`, mirroring the teacher's `RecordStore`
//! async trait wrapping a synchronous `StorageEngine`.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use sync_core::model::{SyncQueueEntry, SyncQueueStatus};
use sync_core::{ErrorKind, Result, SyncError};

use super::{storage_err, Persistence};

const DOCUMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("documents");
const METADATA: TableDefinition<&str, &[u8]> = TableDefinition::new("metadata");
const SYNC_QUEUE: TableDefinition<u64, &[u8]> = TableDefinition::new("sync_queue");
const ASSETS: TableDefinition<&str, &[u8]> = TableDefinition::new("assets");
const CONFIGS: TableDefinition<&str, &[u8]> = TableDefinition::new("configs");

/// `redb`-backed implementation of [`Persistence`], rooted at one database file.
pub struct RedbPersistence {
    db: Arc<Database>,
    next_sync_id: AtomicU64,
}

impl RedbPersistence {
    /// Opens (creating if absent) a `redb` database at `path`. Ensures every
    /// table exists and seeds the sync-queue id counter from the highest id
    /// already present, so ids never collide after a restart.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path.as_ref())
            .map_err(|e| storage_err("failed to open redb database", e))?;

        let max_id = {
            let txn = db
                .begin_write()
                .map_err(|e| storage_err("failed to begin init transaction", e))?;
            let max_id = {
                txn.open_table(DOCUMENTS)
                    .map_err(|e| storage_err("failed to open documents table", e))?;
                txn.open_table(METADATA)
                    .map_err(|e| storage_err("failed to open metadata table", e))?;
                let sync_queue = txn
                    .open_table(SYNC_QUEUE)
                    .map_err(|e| storage_err("failed to open sync_queue table", e))?;
                txn.open_table(ASSETS)
                    .map_err(|e| storage_err("failed to open assets table", e))?;
                txn.open_table(CONFIGS)
                    .map_err(|e| storage_err("failed to open configs table", e))?;
                sync_queue
                    .iter()
                    .map_err(|e| storage_err("failed to iterate sync_queue table", e))?
                    .filter_map(std::result::Result::ok)
                    .map(|(k, _)| k.value())
                    .max()
                    .unwrap_or(0)
            };
            txn.commit()
                .map_err(|e| storage_err("failed to commit init transaction", e))?;
            max_id
        };

        Ok(Self { db: Arc::new(db), next_sync_id: AtomicU64::new(max_id + 1) })
    }

    async fn blocking<T, F>(&self, context: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| SyncError::new(ErrorKind::Storage, format!("{context}: task panicked: {e}")))?
    }
}

fn put_blob(db: &Database, table: TableDefinition<&str, &[u8]>, key: &str, blob: &[u8]) -> Result<()> {
    let txn = db.begin_write().map_err(|e| storage_err("begin_write", e))?;
    {
        let mut t = txn.open_table(table).map_err(|e| storage_err("open_table", e))?;
        t.insert(key, blob).map_err(|e| storage_err("insert", e))?;
    }
    txn.commit().map_err(|e| storage_err("commit", e))
}

fn get_blob(db: &Database, table: TableDefinition<&str, &[u8]>, key: &str) -> Result<Option<Vec<u8>>> {
    let txn = db.begin_read().map_err(|e| storage_err("begin_read", e))?;
    let t = txn.open_table(table).map_err(|e| storage_err("open_table", e))?;
    Ok(t.get(key).map_err(|e| storage_err("get", e))?.map(|g| g.value().to_vec()))
}

fn delete_blob(db: &Database, table: TableDefinition<&str, &[u8]>, key: &str) -> Result<()> {
    let txn = db.begin_write().map_err(|e| storage_err("begin_write", e))?;
    {
        let mut t = txn.open_table(table).map_err(|e| storage_err("open_table", e))?;
        t.remove(key).map_err(|e| storage_err("remove", e))?;
    }
    txn.commit().map_err(|e| storage_err("commit", e))
}

fn encode_entry(entry: &SyncQueueEntry) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(entry)
        .map_err(|e| SyncError::with_source(ErrorKind::Storage, "failed to encode sync queue entry", e))
}

fn decode_entry(bytes: &[u8]) -> Result<SyncQueueEntry> {
    rmp_serde::from_slice(bytes)
        .map_err(|e| SyncError::with_source(ErrorKind::Storage, "failed to decode sync queue entry", e))
}

#[async_trait]
impl Persistence for RedbPersistence {
    async fn put_document(&self, doc_id: &str, blob: Vec<u8>) -> Result<()> {
        let doc_id = doc_id.to_string();
        self.blocking("put_document", move |db| put_blob(db, DOCUMENTS, &doc_id, &blob)).await
    }

    async fn get_document(&self, doc_id: &str) -> Result<Option<Vec<u8>>> {
        let doc_id = doc_id.to_string();
        self.blocking("get_document", move |db| get_blob(db, DOCUMENTS, &doc_id)).await
    }

    async fn delete_document(&self, doc_id: &str) -> Result<()> {
        let doc_id = doc_id.to_string();
        self.blocking("delete_document", move |db| delete_blob(db, DOCUMENTS, &doc_id)).await
    }

    async fn put_metadata(&self, doc_id: &str, blob: Vec<u8>) -> Result<()> {
        let doc_id = doc_id.to_string();
        self.blocking("put_metadata", move |db| put_blob(db, METADATA, &doc_id, &blob)).await
    }

    async fn get_metadata(&self, doc_id: &str) -> Result<Option<Vec<u8>>> {
        let doc_id = doc_id.to_string();
        self.blocking("get_metadata", move |db| get_blob(db, METADATA, &doc_id)).await
    }

    async fn delete_metadata(&self, doc_id: &str) -> Result<()> {
        let doc_id = doc_id.to_string();
        self.blocking("delete_metadata", move |db| delete_blob(db, METADATA, &doc_id)).await
    }

    async fn put_document_and_metadata(
        &self,
        doc_id: &str,
        document_blob: Vec<u8>,
        metadata_blob: Vec<u8>,
    ) -> Result<()> {
        let doc_id = doc_id.to_string();
        self.blocking("put_document_and_metadata", move |db| {
            let txn = db.begin_write().map_err(|e| storage_err("begin_write", e))?;
            {
                let mut documents = txn.open_table(DOCUMENTS).map_err(|e| storage_err("open_table", e))?;
                documents.insert(doc_id.as_str(), document_blob.as_slice())
                    .map_err(|e| storage_err("insert document", e))?;
                let mut metadata = txn.open_table(METADATA).map_err(|e| storage_err("open_table", e))?;
                metadata.insert(doc_id.as_str(), metadata_blob.as_slice())
                    .map_err(|e| storage_err("insert metadata", e))?;
            }
            txn.commit().map_err(|e| storage_err("commit", e))
        })
        .await
    }

    async fn delete_document_and_metadata(&self, doc_id: &str) -> Result<()> {
        let doc_id = doc_id.to_string();
        self.blocking("delete_document_and_metadata", move |db| {
            let txn = db.begin_write().map_err(|e| storage_err("begin_write", e))?;
            {
                let mut documents = txn.open_table(DOCUMENTS).map_err(|e| storage_err("open_table", e))?;
                documents.remove(doc_id.as_str()).map_err(|e| storage_err("remove document", e))?;
                let mut metadata = txn.open_table(METADATA).map_err(|e| storage_err("open_table", e))?;
                metadata.remove(doc_id.as_str()).map_err(|e| storage_err("remove metadata", e))?;
            }
            txn.commit().map_err(|e| storage_err("commit", e))
        })
        .await
    }

    async fn enqueue_sync_entry(&self, mut entry: SyncQueueEntry) -> Result<u64> {
        let id = self.next_sync_id.fetch_add(1, Ordering::SeqCst);
        entry.id = id;
        let bytes = encode_entry(&entry)?;
        self.blocking("enqueue_sync_entry", move |db| {
            let txn = db.begin_write().map_err(|e| storage_err("begin_write", e))?;
            {
                let mut t = txn.open_table(SYNC_QUEUE).map_err(|e| storage_err("open_table", e))?;
                t.insert(id, bytes.as_slice()).map_err(|e| storage_err("insert", e))?;
            }
            txn.commit().map_err(|e| storage_err("commit", e))?;
            Ok(id)
        })
        .await
    }

    async fn list_sync_entries(&self, status: Option<SyncQueueStatus>) -> Result<Vec<SyncQueueEntry>> {
        self.blocking("list_sync_entries", move |db| {
            let txn = db.begin_read().map_err(|e| storage_err("begin_read", e))?;
            let t = txn.open_table(SYNC_QUEUE).map_err(|e| storage_err("open_table", e))?;
            let mut out = Vec::new();
            for row in t.iter().map_err(|e| storage_err("iter", e))? {
                let (_, v) = row.map_err(|e| storage_err("iter row", e))?;
                let entry = decode_entry(v.value())?;
                if status.is_none_or(|s| entry.status == s) {
                    out.push(entry);
                }
            }
            out.sort_by_key(|e| e.id);
            Ok(out)
        })
        .await
    }

    async fn get_sync_entry(&self, id: u64) -> Result<Option<SyncQueueEntry>> {
        self.blocking("get_sync_entry", move |db| {
            let txn = db.begin_read().map_err(|e| storage_err("begin_read", e))?;
            let t = txn.open_table(SYNC_QUEUE).map_err(|e| storage_err("open_table", e))?;
            match t.get(id).map_err(|e| storage_err("get", e))? {
                Some(guard) => Ok(Some(decode_entry(guard.value())?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn update_sync_entry(&self, entry: SyncQueueEntry) -> Result<()> {
        let bytes = encode_entry(&entry)?;
        self.blocking("update_sync_entry", move |db| {
            put_u64_blob(db, SYNC_QUEUE, entry.id, &bytes)
        })
        .await
    }

    async fn remove_sync_entry(&self, id: u64) -> Result<()> {
        self.blocking("remove_sync_entry", move |db| {
            let txn = db.begin_write().map_err(|e| storage_err("begin_write", e))?;
            {
                let mut t = txn.open_table(SYNC_QUEUE).map_err(|e| storage_err("open_table", e))?;
                t.remove(id).map_err(|e| storage_err("remove", e))?;
            }
            txn.commit().map_err(|e| storage_err("commit", e))
        })
        .await
    }

    async fn clear_sync_entries(&self, status: Option<SyncQueueStatus>) -> Result<()> {
        self.blocking("clear_sync_entries", move |db| {
            let txn = db.begin_write().map_err(|e| storage_err("begin_write", e))?;
            let ids_to_remove: Vec<u64> = {
                let t = txn.open_table(SYNC_QUEUE).map_err(|e| storage_err("open_table", e))?;
                let mut ids = Vec::new();
                for row in t.iter().map_err(|e| storage_err("iter", e))? {
                    let (k, v) = row.map_err(|e| storage_err("iter row", e))?;
                    let keep = match status {
                        None => true,
                        Some(s) => decode_entry(v.value())?.status == s,
                    };
                    if keep {
                        ids.push(k.value());
                    }
                }
                ids
            };
            {
                let mut t = txn.open_table(SYNC_QUEUE).map_err(|e| storage_err("open_table", e))?;
                for id in ids_to_remove {
                    t.remove(id).map_err(|e| storage_err("remove", e))?;
                }
            }
            txn.commit().map_err(|e| storage_err("commit", e))
        })
        .await
    }

    async fn put_asset(&self, key: &str, blob: Vec<u8>) -> Result<()> {
        let key = key.to_string();
        self.blocking("put_asset", move |db| put_blob(db, ASSETS, &key, &blob)).await
    }

    async fn get_asset(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let key = key.to_string();
        self.blocking("get_asset", move |db| get_blob(db, ASSETS, &key)).await
    }

    async fn delete_asset(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.blocking("delete_asset", move |db| delete_blob(db, ASSETS, &key)).await
    }

    async fn list_asset_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = prefix.to_string();
        self.blocking("list_asset_keys", move |db| {
            let txn = db.begin_read().map_err(|e| storage_err("begin_read", e))?;
            let t = txn.open_table(ASSETS).map_err(|e| storage_err("open_table", e))?;
            let mut keys = Vec::new();
            for row in t.iter().map_err(|e| storage_err("iter", e))? {
                let (k, _) = row.map_err(|e| storage_err("iter row", e))?;
                if k.value().starts_with(&prefix) {
                    keys.push(k.value().to_string());
                }
            }
            keys.sort();
            Ok(keys)
        })
        .await
    }

    async fn put_config(&self, key: &str, blob: Vec<u8>) -> Result<()> {
        let key = key.to_string();
        self.blocking("put_config", move |db| put_blob(db, CONFIGS, &key, &blob)).await
    }

    async fn get_config(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let key = key.to_string();
        self.blocking("get_config", move |db| get_blob(db, CONFIGS, &key)).await
    }

    async fn delete_config(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.blocking("delete_config", move |db| delete_blob(db, CONFIGS, &key)).await
    }

    async fn list_document_ids(&self) -> Result<Vec<String>> {
        self.blocking("list_document_ids", move |db| {
            let txn = db.begin_read().map_err(|e| storage_err("begin_read", e))?;
            let t = txn.open_table(DOCUMENTS).map_err(|e| storage_err("open_table", e))?;
            let mut ids = Vec::new();
            for row in t.iter().map_err(|e| storage_err("iter", e))? {
                let (k, _) = row.map_err(|e| storage_err("iter row", e))?;
                ids.push(k.value().to_string());
            }
            ids.sort();
            Ok(ids)
        })
        .await
    }
}

fn put_u64_blob(db: &Database, table: TableDefinition<u64, &[u8]>, key: u64, blob: &[u8]) -> Result<()> {
    let txn = db.begin_write().map_err(|e| storage_err("begin_write", e))?;
    {
        let mut t = txn.open_table(table).map_err(|e| storage_err("open_table", e))?;
        t.insert(key, blob).map_err(|e| storage_err("insert", e))?;
    }
    txn.commit().map_err(|e| storage_err("commit", e))
}
