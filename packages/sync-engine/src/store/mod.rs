//! Document Store (component B): owns the in-memory map of replicated
//! documents, brokers every read/write, emits change events, and keeps
//! metadata in step with edits.

pub mod observer;
pub mod save_coalescer;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use sync_core::model::{DocumentMetadata, Origin, SyncStatus};
use sync_core::{CrdtDocument, DocumentKind, ErrorKind, Result, StateVector, SyncError, SystemClock, UpdateBlob, Value, HLC};
use tokio::sync::Mutex as AsyncMutex;

pub use observer::{ChangeObserver, CompositeChangeObserver};
use save_coalescer::SaveCoalescer;

use crate::persistence::Persistence;

/// One committed change to a document, delivered to observers alongside its [`Origin`].
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub doc_id: String,
    pub version: u64,
    pub update: UpdateBlob,
}

/// On-disk shape of a document: its fixed kind plus a full-state update blob,
/// sufficient to rehydrate a fresh [`CrdtDocument`] of the same kind.
#[derive(Debug, Serialize, Deserialize)]
struct StoredDocument {
    kind: DocumentKind,
    update: UpdateBlob,
}

struct DocEntry {
    document: CrdtDocument,
    metadata: DocumentMetadata,
}

type ObserverHandle = u64;

/// Lifecycle owner for replicated documents and their metadata (§4.2).
pub struct DocumentStore {
    node_id: String,
    persistence: Arc<dyn Persistence>,
    documents: DashMap<String, Arc<AsyncMutex<DocEntry>>>,
    per_doc_observers: DashMap<String, Vec<(ObserverHandle, Arc<dyn ChangeObserver>)>>,
    global_observers: SyncMutex<Vec<Arc<dyn ChangeObserver>>>,
    next_handle: AtomicU64,
    coalescer: SaveCoalescer,
    metadata_clock: SyncMutex<HLC>,
}

impl DocumentStore {
    #[must_use]
    pub fn new(node_id: impl Into<String>, persistence: Arc<dyn Persistence>) -> Self {
        let node_id = node_id.into();
        Self {
            metadata_clock: SyncMutex::new(HLC::new(node_id.clone(), Box::new(SystemClock))),
            node_id,
            persistence,
            documents: DashMap::new(),
            per_doc_observers: DashMap::new(),
            global_observers: SyncMutex::new(Vec::new()),
            next_handle: AtomicU64::new(1),
            coalescer: SaveCoalescer::new(),
        }
    }

    /// Registers an observer that receives every document's changes.
    /// Used by the sync scheduler and conflict manager, which operate across
    /// the whole store rather than one document at a time.
    pub fn subscribe_all(&self, observer: Arc<dyn ChangeObserver>) {
        self.global_observers.lock().push(observer);
    }

    /// Registers an observer scoped to one document, returning a handle for [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe(&self, doc_id: &str, observer: Arc<dyn ChangeObserver>) -> ObserverHandle {
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.per_doc_observers.entry(doc_id.to_string()).or_default().push((handle, observer));
        handle
    }

    pub fn unsubscribe(&self, doc_id: &str, handle: ObserverHandle) {
        if let Some(mut observers) = self.per_doc_observers.get_mut(doc_id) {
            observers.retain(|(h, _)| *h != handle);
        }
    }

    fn notify(&self, doc_id: &str, event: &ChangeEvent, origin: Origin) {
        if let Some(observers) = self.per_doc_observers.get(doc_id) {
            for (_, observer) in observers.iter() {
                observer.on_change(event, origin);
            }
        }
        for observer in self.global_observers.lock().iter() {
            observer.on_change(event, origin);
        }
    }

    #[must_use]
    pub fn has_document_in_memory(&self, doc_id: &str) -> bool {
        self.documents.contains_key(doc_id)
    }

    pub async fn has_document(&self, doc_id: &str) -> Result<bool> {
        if self.documents.contains_key(doc_id) {
            return Ok(true);
        }
        Ok(self.persistence.get_metadata(doc_id).await?.is_some())
    }

    /// Creates a new document. Fails with [`ErrorKind::AlreadyExists`] if
    /// `doc_id` is already present, in memory or in durable storage.
    pub async fn create_document(
        &self,
        doc_id: &str,
        kind: DocumentKind,
        initial_fields: Option<Vec<(String, Value)>>,
    ) -> Result<()> {
        if self.has_document(doc_id).await? {
            return Err(SyncError::already_exists(format!("document '{doc_id}' already exists")));
        }

        let hlc = HLC::new(format!("{}:{doc_id}", self.node_id), Box::new(SystemClock));
        let mut document = CrdtDocument::new(kind, hlc);

        if let Some(fields) = initial_fields {
            if kind != DocumentKind::Map {
                return Err(SyncError::invalid_argument("initial_fields is only valid for Map documents"));
            }
            for (path, value) in fields {
                document.set_at_path(&path, value)?;
            }
        }

        let now = self.metadata_clock.lock().now();
        let metadata = DocumentMetadata {
            doc_id: doc_id.to_string(),
            kind,
            created_at: now.clone(),
            last_modified: now,
            last_synced: None,
            version: 1,
            sync_status: SyncStatus::Unsynced,
            size: None,
            created_by: None,
            updated_by: None,
        };

        self.persist(doc_id, &document, &metadata).await?;

        let update = document.encode_update(None);
        self.documents.insert(doc_id.to_string(), Arc::new(AsyncMutex::new(DocEntry { document, metadata })));

        self.notify(doc_id, &ChangeEvent { doc_id: doc_id.to_string(), version: 1, update }, Origin::Local);
        Ok(())
    }

    async fn ensure_loaded(&self, doc_id: &str) -> Result<()> {
        if self.documents.contains_key(doc_id) {
            return Ok(());
        }
        let Some(doc_bytes) = self.persistence.get_document(doc_id).await? else {
            return Err(SyncError::not_found(format!("document '{doc_id}' not found")));
        };
        let Some(meta_bytes) = self.persistence.get_metadata(doc_id).await? else {
            return Err(SyncError::not_found(format!("metadata for '{doc_id}' not found")));
        };

        let stored: StoredDocument = rmp_serde::from_slice(&doc_bytes)
            .map_err(|e| SyncError::with_source(ErrorKind::Storage, "failed to decode document", e))?;
        let metadata: DocumentMetadata = rmp_serde::from_slice(&meta_bytes)
            .map_err(|e| SyncError::with_source(ErrorKind::Storage, "failed to decode metadata", e))?;

        let hlc = HLC::new(format!("{}:{doc_id}", self.node_id), Box::new(SystemClock));
        let mut document = CrdtDocument::new(stored.kind, hlc);
        document.apply_update(stored.update)?;

        self.documents
            .entry(doc_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(DocEntry { document, metadata })));
        Ok(())
    }

    async fn persist(&self, doc_id: &str, document: &CrdtDocument, metadata: &DocumentMetadata) -> Result<()> {
        let stored = StoredDocument { kind: document.kind(), update: document.encode_update(None) };
        let doc_bytes = rmp_serde::to_vec_named(&stored)
            .map_err(|e| SyncError::with_source(ErrorKind::Storage, "failed to encode document", e))?;
        let meta_bytes = rmp_serde::to_vec_named(metadata)
            .map_err(|e| SyncError::with_source(ErrorKind::Storage, "failed to encode metadata", e))?;
        self.persistence.put_document_and_metadata(doc_id, doc_bytes, meta_bytes).await
    }

    /// Runs `mutator` as a local transaction against `doc_id`, persisting the
    /// result (single-flight per document) and notifying observers with
    /// `Origin::Local`.
    pub async fn transact<F>(&self, doc_id: &str, mutator: F) -> Result<UpdateBlob>
    where
        F: FnOnce(&mut CrdtDocument) -> Result<()>,
    {
        self.ensure_loaded(doc_id).await?;
        let entry_lock = self.documents.get(doc_id).expect("just ensured loaded").clone();
        let mut entry = entry_lock.lock().await;

        let update = entry.document.transact(mutator)?;

        entry.metadata.version += 1;
        entry.metadata.last_modified = self.metadata_clock.lock().now();
        if entry.metadata.sync_status != SyncStatus::Conflict {
            entry.metadata.sync_status = SyncStatus::Unsynced;
        }

        let version = entry.metadata.version;
        drop(entry);

        // The save closure re-reads the document on every invocation rather
        // than capturing a fixed snapshot, so a coalesced re-run always
        // persists whatever is latest when it actually executes.
        let persistence = self.persistence.clone();
        let doc_id_owned = doc_id.to_string();
        self.coalescer
            .coalesce(doc_id, || {
                let persistence = persistence.clone();
                let doc_id_owned = doc_id_owned.clone();
                let entry_lock = entry_lock.clone();
                async move {
                    let (doc_bytes, meta_bytes) = {
                        let entry = entry_lock.lock().await;
                        let stored = StoredDocument { kind: entry.document.kind(), update: entry.document.encode_update(None) };
                        let doc_bytes = match rmp_serde::to_vec_named(&stored) {
                            Ok(b) => b,
                            Err(e) => {
                                tracing::warn!(doc_id = %doc_id_owned, error = %e, "failed to encode document for save");
                                return;
                            }
                        };
                        let meta_bytes = match rmp_serde::to_vec_named(&entry.metadata) {
                            Ok(b) => b,
                            Err(e) => {
                                tracing::warn!(doc_id = %doc_id_owned, error = %e, "failed to encode metadata for save");
                                return;
                            }
                        };
                        (doc_bytes, meta_bytes)
                    };
                    if let Err(e) = persistence.put_document_and_metadata(&doc_id_owned, doc_bytes, meta_bytes).await {
                        tracing::warn!(doc_id = %doc_id_owned, error = %e, "failed to persist document");
                        let mut entry = entry_lock.lock().await;
                        entry.metadata.sync_status = SyncStatus::Failed;
                    }
                }
            })
            .await;

        tracing::debug!(doc_id = %doc_id, version, "local mutation committed");
        self.notify(doc_id, &ChangeEvent { doc_id: doc_id.to_string(), version, update: update.clone() }, Origin::Local);
        Ok(update)
    }

    /// Applies a remote update blob under a transaction tagged `remote`.
    /// Observers see `Origin::Remote` and must not enqueue further sync work
    /// for this event (breaking the echo loop is the scheduler's job).
    pub async fn apply_remote_update(&self, doc_id: &str, update: UpdateBlob) -> Result<()> {
        self.ensure_loaded(doc_id).await?;
        let entry_lock = self.documents.get(doc_id).expect("just ensured loaded").clone();
        let mut entry = entry_lock.lock().await;

        entry.document.apply_update(update.clone())?;
        entry.metadata.version += 1;
        let now = self.metadata_clock.lock().now();
        entry.metadata.last_modified = now.clone();
        entry.metadata.last_synced = Some(now);
        entry.metadata.sync_status = SyncStatus::Synced;

        let version = entry.metadata.version;
        self.persist(doc_id, &entry.document, &entry.metadata).await?;
        drop(entry);

        self.notify(doc_id, &ChangeEvent { doc_id: doc_id.to_string(), version, update }, Origin::Remote);
        Ok(())
    }

    pub async fn get_path(&self, doc_id: &str, path: &str) -> Result<Option<Value>> {
        self.ensure_loaded(doc_id).await?;
        let entry_lock = self.documents.get(doc_id).expect("just ensured loaded").clone();
        let entry = entry_lock.lock().await;
        entry.document.get_path(path)
    }

    /// Snapshots the whole document as a single [`Value`], for structural
    /// conflict detection against a remote snapshot.
    pub async fn get_value(&self, doc_id: &str) -> Result<Value> {
        self.ensure_loaded(doc_id).await?;
        let entry_lock = self.documents.get(doc_id).expect("just ensured loaded").clone();
        let entry = entry_lock.lock().await;
        Ok(entry.document.to_value())
    }

    pub async fn get_update(&self, doc_id: &str, since: Option<&StateVector>) -> Result<UpdateBlob> {
        self.ensure_loaded(doc_id).await?;
        let entry_lock = self.documents.get(doc_id).expect("just ensured loaded").clone();
        let entry = entry_lock.lock().await;
        Ok(entry.document.encode_update(since))
    }

    pub async fn get_state_vector(&self, doc_id: &str) -> Result<StateVector> {
        self.ensure_loaded(doc_id).await?;
        let entry_lock = self.documents.get(doc_id).expect("just ensured loaded").clone();
        let entry = entry_lock.lock().await;
        Ok(entry.document.state_vector())
    }

    pub async fn get_metadata(&self, doc_id: &str) -> Result<DocumentMetadata> {
        self.ensure_loaded(doc_id).await?;
        let entry_lock = self.documents.get(doc_id).expect("just ensured loaded").clone();
        let entry = entry_lock.lock().await;
        Ok(entry.metadata.clone())
    }

    /// Applies a patch closure to a document's metadata without touching its
    /// CRDT state or bumping `version` (used by the scheduler and conflict
    /// manager to flip `syncStatus`/`lastSynced` directly).
    pub async fn update_metadata<F>(&self, doc_id: &str, patch: F) -> Result<DocumentMetadata>
    where
        F: FnOnce(&mut DocumentMetadata),
    {
        self.ensure_loaded(doc_id).await?;
        let entry_lock = self.documents.get(doc_id).expect("just ensured loaded").clone();
        let mut entry = entry_lock.lock().await;
        patch(&mut entry.metadata);
        let metadata = entry.metadata.clone();
        let meta_bytes = rmp_serde::to_vec_named(&metadata)
            .map_err(|e| SyncError::with_source(ErrorKind::Storage, "failed to encode metadata", e))?;
        self.persistence.put_metadata(doc_id, meta_bytes).await?;
        Ok(metadata)
    }

    /// Deletes a document, cascading to its metadata. Idempotent.
    pub async fn delete_document(&self, doc_id: &str) -> Result<()> {
        self.documents.remove(doc_id);
        self.per_doc_observers.remove(doc_id);
        self.persistence.delete_document_and_metadata(doc_id).await
    }
}
