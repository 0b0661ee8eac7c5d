//! Offline-first sync engine: persistence, a document store over
//! CRDT-backed documents, structural conflict detection and resolution, a
//! background sync scheduler, and an offline map tile/feature cache.
//!
//! [`SyncEngine`] wires the five components together behind one
//! application-facing handle; each component also works standalone for
//! callers that only need a slice of the stack (e.g. a server that only
//! needs [`persistence`] and [`store`]).

pub mod config;
pub mod conflict;
pub mod host;
pub mod mapcache;
pub mod persistence;
pub mod store;
pub mod sync;

use std::sync::Arc;
use std::time::Duration;

use sync_core::model::SyncOperation;
use sync_core::{DocumentKind, Result, Value};

pub use config::{EngineConfig, SyncConfig, SyncDirection, SyncMode, TileCacheSettings};
pub use conflict::ConflictManager;
pub use host::{FocusSource, NetworkMonitor};
pub use mapcache::{FeatureStore, TileCache};
pub use store::DocumentStore;
pub use sync::{HttpTransport, SchedulerHandle, SyncTransport};

use sync::{SchedulerChangeObserver, SchedulerPolicy};

#[cfg(feature = "redb")]
use persistence::RedbPersistence;
use persistence::{MemoryPersistence, Persistence};

/// Top-level handle over every engine component, constructed once per
/// embedding application and shared behind an `Arc` by callers that need
/// concurrent access (the CLI, a UI layer, background sync callbacks).
pub struct SyncEngine {
    pub documents: Arc<DocumentStore>,
    pub conflicts: Arc<ConflictManager>,
    pub tiles: Arc<TileCache>,
    pub features: Arc<FeatureStore>,
    scheduler: SchedulerHandle,
    mode: SyncMode,
}

impl SyncEngine {
    /// Builds an engine backed by `persistence` and a caller-supplied
    /// [`SyncTransport`], with no host-platform connectivity/focus signals.
    /// Prefer [`SyncEngine::open`] for the common `redb`-on-disk +
    /// HTTP-transport case, or [`SyncEngine::with_host`] to wire
    /// `syncOnNetworkChange`/`syncOnFocus`.
    pub async fn new(config: EngineConfig, persistence: Arc<dyn Persistence>, transport: Arc<dyn SyncTransport>) -> Result<Self> {
        Self::with_host(config, persistence, transport, None, None).await
    }

    /// Like [`Self::new`], additionally wiring the host-provided
    /// [`NetworkMonitor`]/[`FocusSource`] (§6.4) into the `syncOnNetworkChange`
    /// and `syncOnFocus` triggers (§4.4). Either may be omitted; the
    /// corresponding trigger then never fires, same as an absent host
    /// capability anywhere else in the engine.
    pub async fn with_host(
        config: EngineConfig,
        persistence: Arc<dyn Persistence>,
        transport: Arc<dyn SyncTransport>,
        network_monitor: Option<Arc<dyn NetworkMonitor>>,
        focus_source: Option<Arc<dyn FocusSource>>,
    ) -> Result<Self> {
        let documents = Arc::new(DocumentStore::new(config.node_id.clone(), persistence.clone()));
        let conflicts = Arc::new(ConflictManager::new(config.node_id.clone(), documents.clone()));
        let tiles = Arc::new(TileCache::load(persistence.clone(), config.tile_cache.into()).await?);
        let features = Arc::new(FeatureStore::new(persistence.clone()));

        let queue = Arc::new(sync::SyncQueue::load(config.node_id.clone(), persistence.clone()).await?);
        let policy = SchedulerPolicy {
            direction: config.sync.direction,
            batch_size: config.sync.batch_size,
            priority_docs: config.sync.priority_docs.clone(),
            excluded_docs: config.sync.excluded_docs.clone(),
        };
        let scheduler = sync::SchedulerCore::spawn_with_policy(
            documents.clone(),
            conflicts.clone(),
            transport,
            queue,
            config.sync.clone().into(),
            config.sync.max_concurrent_syncs,
            Duration::from_millis(config.sync.network_timeout_ms),
            policy,
        );

        if config.sync.sync_on_document_change {
            documents.subscribe_all(Arc::new(SchedulerChangeObserver::new(scheduler.clone())));
        }

        if config.sync.sync_on_startup {
            for doc_id in persistence.list_document_ids().await? {
                scheduler.enqueue(doc_id, SyncOperation::Update);
            }
        }

        if config.sync.sync_on_network_change {
            if let Some(monitor) = network_monitor {
                spawn_trigger_on_rising_edge(monitor.subscribe(), scheduler.clone());
            }
        }

        if config.sync.sync_on_focus {
            if let Some(focus) = focus_source {
                spawn_trigger_on_rising_edge(focus.subscribe(), scheduler.clone());
            }
        }

        if config.sync.mode == SyncMode::Scheduled {
            spawn_scheduled_ticker(scheduler.clone(), Duration::from_millis(config.sync.sync_interval_ms));
        }

        Ok(Self { documents, conflicts, tiles, features, scheduler, mode: config.sync.mode })
    }

    /// Opens (or creates) a `redb`-backed engine at `config.db_path`, using
    /// the default HTTP transport against `config.sync_endpoint`.
    #[cfg(feature = "redb")]
    pub async fn open(config: EngineConfig) -> Result<Self> {
        let persistence: Arc<dyn Persistence> = Arc::new(RedbPersistence::open(&config.db_path)?);
        let transport: Arc<dyn SyncTransport> = Arc::new(HttpTransport::new(config.sync_endpoint.clone()));
        Self::new(config, persistence, transport).await
    }

    /// Builds an in-memory engine for tests and demos — no disk, no network.
    pub async fn in_memory(config: EngineConfig, transport: Arc<dyn SyncTransport>) -> Result<Self> {
        Self::new(config, Arc::new(MemoryPersistence::new()), transport).await
    }

    /// Creates a document. Queued for the next sync round via the
    /// `syncOnDocumentChange` trigger, unless `mode` is [`SyncMode::Manual`].
    pub async fn create_document(
        &self,
        doc_id: &str,
        kind: DocumentKind,
        initial_fields: Option<Vec<(String, Value)>>,
    ) -> Result<()> {
        self.documents.create_document(doc_id, kind, initial_fields).await?;
        self.maybe_sync_immediately();
        Ok(())
    }

    /// Runs a local mutation. Queued for the next sync round via the
    /// `syncOnDocumentChange` trigger, unless `mode` is [`SyncMode::Manual`].
    pub async fn edit_document<F>(&self, doc_id: &str, mutator: F) -> Result<()>
    where
        F: FnOnce(&mut sync_core::CrdtDocument) -> Result<()>,
    {
        self.documents.transact(doc_id, mutator).await?;
        self.maybe_sync_immediately();
        Ok(())
    }

    /// Deletes a document. Always enqueued directly: a delete produces no
    /// [`store::ChangeEvent`], so the `syncOnDocumentChange` observer never
    /// sees it.
    pub async fn delete_document(&self, doc_id: &str) -> Result<()> {
        self.documents.delete_document(doc_id).await?;
        self.scheduler.cancel_document(doc_id).await?;
        if self.mode != SyncMode::Manual {
            self.scheduler.enqueue(doc_id, SyncOperation::Delete);
        }
        Ok(())
    }

    /// In [`SyncMode::Immediate`], kicks off a sync round right after a local
    /// edit lands rather than waiting for the next explicit or scheduled
    /// round. Spawned so the local edit's caller isn't blocked on a network
    /// round trip.
    fn maybe_sync_immediately(&self) {
        if self.mode == SyncMode::Immediate {
            let scheduler = self.scheduler.clone();
            tokio::spawn(async move { scheduler.sync_all().await });
        }
    }

    /// Triggers an immediate sync round over everything queued.
    pub async fn sync_now(&self) {
        self.scheduler.sync_all().await;
    }

    pub async fn sync_document(&self, doc_id: &str) -> Result<()> {
        self.scheduler.sync_document(doc_id).await
    }

    pub fn pause_sync(&self) {
        self.scheduler.pause();
    }

    pub fn resume_sync(&self) {
        self.scheduler.resume();
    }

    #[must_use]
    pub fn scheduler_state(&self) -> sync::SchedulerState {
        self.scheduler.state()
    }
}

/// Drives `scheduler.sync_all()` once per low-to-high transition observed on
/// `signal` (a network coming back online, the app gaining focus). Edge- not
/// level-triggered, so a host that starts already-online doesn't fire a
/// spurious round before anything has actually changed.
fn spawn_trigger_on_rising_edge(mut signal: tokio::sync::watch::Receiver<bool>, scheduler: SchedulerHandle) {
    tokio::spawn(async move {
        let mut was_true = *signal.borrow();
        while signal.changed().await.is_ok() {
            let now_true = *signal.borrow();
            if now_true && !was_true {
                scheduler.sync_all().await;
            }
            was_true = now_true;
        }
    });
}

fn spawn_scheduled_ticker(scheduler: SchedulerHandle, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.tick().await; // the first tick fires immediately; startup already covers that round
        loop {
            ticker.tick().await;
            scheduler.sync_all().await;
        }
    });
}
