//! Background Sync Scheduler (component D, §4.4): one event loop owns the
//! durable queue and drives bounded-concurrency sync rounds against a
//! [`SyncTransport`], feeding merge results back through the
//! [`DocumentStore`] and structural conflicts through the
//! [`ConflictManager`].

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use sync_core::model::{SyncOperation, SyncQueueEntry, SyncStatus};
use sync_core::{Result, SyncError};
use tokio::sync::{broadcast, mpsc, oneshot, Semaphore};

use crate::config::SyncDirection;
use crate::conflict::ConflictManager;
use crate::store::DocumentStore;

use super::protocol::SyncTransport;
use super::queue::SyncQueue;
use super::retry::RetryPolicy;

/// Named lifecycle events the scheduler emits as it works the queue (§4.4
/// "events"). Delivered best-effort over a broadcast channel — a caller with
/// no active [`SchedulerHandle::subscribe_events`] receiver simply misses them.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    SyncEnqueued { doc_id: String },
    SyncStarted { doc_id: String },
    SyncSuccess { doc_id: String, duration_ms: u64 },
    SyncRetry { doc_id: String, attempts: u32 },
    SyncError { doc_id: String, error: String },
    SyncMaxRetries { doc_id: String },
    SyncPaused,
    SyncResumed,
    QueueAdded { doc_id: String },
    QueueRemoved { doc_id: String },
    QueueCleared,
    ConfigUpdated,
}

/// One completed sync attempt, kept for [`SyncStats`]'s rolling window.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub doc_id: String,
    pub duration_ms: u64,
    pub success: bool,
}

/// Running counters plus the last ten attempt outcomes, for a caller that
/// wants a snapshot rather than subscribing to the live event stream.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub total_attempts: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_retries: u64,
    last_outcomes: VecDeque<SyncOutcome>,
}

const STATS_WINDOW: usize = 10;

impl SyncStats {
    fn record(&mut self, outcome: SyncOutcome) {
        self.total_attempts += 1;
        if outcome.success {
            self.total_successes += 1;
        } else {
            self.total_failures += 1;
        }
        self.last_outcomes.push_back(outcome);
        if self.last_outcomes.len() > STATS_WINDOW {
            self.last_outcomes.pop_front();
        }
    }

    fn record_retry(&mut self) {
        self.total_retries += 1;
    }

    /// The last (up to ten) completed attempts, most recent last.
    #[must_use]
    pub fn last_outcomes(&self) -> &[SyncOutcome] {
        self.last_outcomes.as_slices().0
    }

    /// Mean duration across the retained window, `0.0` if it's empty.
    #[must_use]
    pub fn average_duration_ms(&self) -> f64 {
        if self.last_outcomes.is_empty() {
            return 0.0;
        }
        let total: u64 = self.last_outcomes.iter().map(|o| o.duration_ms).sum();
        total as f64 / self.last_outcomes.len() as f64
    }
}

/// Fans [`SchedulerEvent`]s out to subscribers and folds them into
/// [`SyncStats`]. Cheap to clone; every clone shares the same stats and
/// broadcast sender.
#[derive(Clone)]
struct EventSink {
    events: broadcast::Sender<SchedulerEvent>,
    stats: Arc<parking_lot::Mutex<SyncStats>>,
}

impl EventSink {
    fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self { events, stats: Arc::new(parking_lot::Mutex::new(SyncStats::default())) }
    }

    fn emit(&self, event: SchedulerEvent) {
        match &event {
            SchedulerEvent::SyncSuccess { doc_id, duration_ms } => {
                self.stats.lock().record(SyncOutcome { doc_id: doc_id.clone(), duration_ms: *duration_ms, success: true });
            }
            SchedulerEvent::SyncError { doc_id, .. } => {
                self.stats.lock().record(SyncOutcome { doc_id: doc_id.clone(), duration_ms: 0, success: false });
            }
            SchedulerEvent::SyncRetry { .. } => self.stats.lock().record_retry(),
            _ => {}
        }
        let _ = self.events.send(event);
    }

    fn stats(&self) -> SyncStats {
        self.stats.lock().clone()
    }
}

/// Bridges local document changes into the scheduler's queue (§4.4
/// `syncOnDocumentChange`). Registered with [`DocumentStore::subscribe_all`]
/// so any local mutation — whether made through [`crate::SyncEngine`] or
/// directly against the store — gets queued without the caller having to
/// remember to.
pub struct SchedulerChangeObserver {
    handle: SchedulerHandle,
}

impl SchedulerChangeObserver {
    #[must_use]
    pub fn new(handle: SchedulerHandle) -> Self {
        Self { handle }
    }
}

impl crate::store::ChangeObserver for SchedulerChangeObserver {
    fn on_change(&self, event: &crate::store::ChangeEvent, origin: sync_core::model::Origin) {
        if let sync_core::model::Origin::Local = origin {
            self.handle.enqueue(event.doc_id.clone(), SyncOperation::Update);
        }
    }
}

/// Scheduler lifecycle state, surfaced to the embedding application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Syncing,
    Paused,
    Error,
}

/// Commands accepted by the scheduler's event loop.
enum Command {
    Enqueue { doc_id: String, operation: SyncOperation },
    CancelDocument { doc_id: String, ack: oneshot::Sender<Result<()>> },
    UpdatePolicy { policy: SchedulerPolicy, ack: oneshot::Sender<()> },
    Pause,
    Resume,
    SyncAll { ack: oneshot::Sender<()> },
    SyncDocument { doc_id: String, ack: oneshot::Sender<Result<()>> },
    Shutdown,
}

/// Tunables carried alongside the concurrency/retry knobs already on
/// [`SchedulerCore`] — split out so [`SchedulerCore::spawn`]'s argument list
/// stays readable as §4.4's config surface grows.
#[derive(Debug, Clone)]
pub struct SchedulerPolicy {
    pub direction: SyncDirection,
    /// Entries drained from the queue per round; the rest wait for the next round.
    pub batch_size: usize,
    /// Dequeued ahead of the rest of a drained batch.
    pub priority_docs: BTreeSet<String>,
    /// Never enqueued, even if a caller asks to.
    pub excluded_docs: BTreeSet<String>,
}

impl Default for SchedulerPolicy {
    fn default() -> Self {
        Self { direction: SyncDirection::default(), batch_size: 10, priority_docs: BTreeSet::new(), excluded_docs: BTreeSet::new() }
    }
}

/// Handle used by callers to talk to a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: Arc<parking_lot::RwLock<SchedulerState>>,
    events: EventSink,
}

impl SchedulerHandle {
    pub fn enqueue(&self, doc_id: impl Into<String>, operation: SyncOperation) {
        let _ = self.commands.send(Command::Enqueue { doc_id: doc_id.into(), operation });
    }

    /// Cancels every queued or processing entry for `doc_id` — used when the
    /// document itself has just been deleted, so nothing stale from before
    /// the delete runs against it afterward.
    pub async fn cancel_document(&self, doc_id: impl Into<String>) -> Result<()> {
        let (ack, wait) = oneshot::channel();
        self.commands
            .send(Command::CancelDocument { doc_id: doc_id.into(), ack })
            .map_err(|_| SyncError::cancelled("scheduler is not running"))?;
        wait.await.map_err(|_| SyncError::cancelled("scheduler shut down before replying"))?
    }

    /// Replaces the running scheduler's [`SchedulerPolicy`] (direction,
    /// batch size, priority/excluded docs) and emits [`SchedulerEvent::ConfigUpdated`].
    pub async fn update_policy(&self, policy: SchedulerPolicy) {
        let (ack, wait) = oneshot::channel();
        if self.commands.send(Command::UpdatePolicy { policy, ack }).is_ok() {
            let _ = wait.await;
        }
    }

    pub fn pause(&self) {
        let _ = self.commands.send(Command::Pause);
    }

    pub fn resume(&self) {
        let _ = self.commands.send(Command::Resume);
    }

    /// Subscribes to the scheduler's live event stream (§4.4 "events").
    /// Events sent before this call are not replayed.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.events.subscribe()
    }

    /// A snapshot of running counters and the last ten attempt outcomes.
    #[must_use]
    pub fn stats(&self) -> SyncStats {
        self.events.stats()
    }

    /// Triggers one sync round over everything currently queued and waits
    /// for it to finish.
    pub async fn sync_all(&self) {
        let (ack, wait) = oneshot::channel();
        if self.commands.send(Command::SyncAll { ack }).is_ok() {
            let _ = wait.await;
        }
    }

    /// Syncs one document immediately, out of band from the queue, and
    /// reports the outcome.
    pub async fn sync_document(&self, doc_id: impl Into<String>) -> Result<()> {
        let (ack, wait) = oneshot::channel();
        let doc_id = doc_id.into();
        self.commands
            .send(Command::SyncDocument { doc_id, ack })
            .map_err(|_| SyncError::cancelled("scheduler is not running"))?;
        wait.await.map_err(|_| SyncError::cancelled("scheduler shut down before replying"))?
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    #[must_use]
    pub fn state(&self) -> SchedulerState {
        *self.state.read()
    }
}

/// Owns the queue and drives sync rounds. Construct with [`SchedulerCore::spawn`].
pub struct SchedulerCore {
    store: Arc<DocumentStore>,
    conflicts: Arc<ConflictManager>,
    transport: Arc<dyn SyncTransport>,
    queue: Arc<SyncQueue>,
    retry_policy: RetryPolicy,
    max_concurrent: usize,
    request_timeout: Duration,
    policy: parking_lot::RwLock<SchedulerPolicy>,
    state: Arc<parking_lot::RwLock<SchedulerState>>,
    events: EventSink,
}

impl SchedulerCore {
    /// Spawns the scheduler's event-loop task and returns a handle to it.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        store: Arc<DocumentStore>,
        conflicts: Arc<ConflictManager>,
        transport: Arc<dyn SyncTransport>,
        queue: Arc<SyncQueue>,
        retry_policy: RetryPolicy,
        max_concurrent: usize,
        request_timeout: Duration,
    ) -> SchedulerHandle {
        Self::spawn_with_policy(store, conflicts, transport, queue, retry_policy, max_concurrent, request_timeout, SchedulerPolicy::default())
    }

    /// Like [`Self::spawn`], carrying the full §4.4 policy surface
    /// (`direction`, `batchSize`, `priorityDocs`, `excludedDocs`).
    #[allow(clippy::too_many_arguments)]
    pub fn spawn_with_policy(
        store: Arc<DocumentStore>,
        conflicts: Arc<ConflictManager>,
        transport: Arc<dyn SyncTransport>,
        queue: Arc<SyncQueue>,
        retry_policy: RetryPolicy,
        max_concurrent: usize,
        request_timeout: Duration,
        policy: SchedulerPolicy,
    ) -> SchedulerHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(parking_lot::RwLock::new(SchedulerState::Idle));
        let events = EventSink::new();
        let core = Self {
            store,
            conflicts,
            transport,
            queue,
            retry_policy,
            max_concurrent,
            request_timeout,
            policy: parking_lot::RwLock::new(policy),
            state: state.clone(),
            events: events.clone(),
        };
        tokio::spawn(core.run(rx));
        SchedulerHandle { commands: tx, state, events }
    }

    async fn run(self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent.max(1)));
        let paused = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let inflight_errors = AtomicU32::new(0);

        while let Some(command) = commands.recv().await {
            match command {
                Command::Enqueue { doc_id, operation } => {
                    if self.policy.read().excluded_docs.contains(&doc_id) {
                        tracing::debug!(doc_id, "skipping enqueue: document is excluded from sync");
                        continue;
                    }
                    match self.queue.enqueue(&doc_id, operation).await {
                        Ok(_) => {
                            self.events.emit(SchedulerEvent::SyncEnqueued { doc_id: doc_id.clone() });
                            self.events.emit(SchedulerEvent::QueueAdded { doc_id });
                        }
                        Err(e) => tracing::warn!(doc_id, error = %e, "failed to enqueue sync entry"),
                    }
                }
                Command::CancelDocument { doc_id, ack } => {
                    let result = self.queue.cancel_for_document(&doc_id).await;
                    if matches!(result, Ok(n) if n > 0) {
                        self.events.emit(SchedulerEvent::QueueRemoved { doc_id });
                    }
                    let _ = ack.send(result.map(|_| ()));
                }
                Command::UpdatePolicy { policy, ack } => {
                    *self.policy.write() = policy;
                    self.events.emit(SchedulerEvent::ConfigUpdated);
                    let _ = ack.send(());
                }
                Command::Pause => {
                    paused.store(true, Ordering::SeqCst);
                    *self.state.write() = SchedulerState::Paused;
                    self.events.emit(SchedulerEvent::SyncPaused);
                }
                Command::Resume => {
                    paused.store(false, Ordering::SeqCst);
                    *self.state.write() = SchedulerState::Idle;
                    self.events.emit(SchedulerEvent::SyncResumed);
                }
                Command::SyncAll { ack } => {
                    if !paused.load(Ordering::SeqCst) {
                        self.run_round(&semaphore, &inflight_errors).await;
                    }
                    let _ = ack.send(());
                }
                Command::SyncDocument { doc_id, ack } => {
                    let result = self.sync_one_document(&doc_id).await;
                    let _ = ack.send(result);
                }
                Command::Shutdown => break,
            }
        }
    }

    async fn run_round(&self, semaphore: &Arc<Semaphore>, inflight_errors: &AtomicU32) {
        *self.state.write() = SchedulerState::Syncing;
        let batch_size = self.policy.read().batch_size;
        let mut entries = VecDeque::new();
        while entries.len() < batch_size.max(1) {
            match self.queue.pop_ready().await {
                Ok(Some(entry)) => entries.push_back(entry),
                _ => break,
            }
        }

        // Priority docs run first within the batch, then by the entry's own
        // priority; order otherwise follows the queue's oldest-first
        // ordering (a stable sort preserves it).
        let priority_docs = self.policy.read().priority_docs.clone();
        let mut entries: Vec<_> = entries.into_iter().collect();
        entries.sort_by_key(|e| (!priority_docs.contains(&e.doc_id), -e.priority));

        let mut tasks = FuturesUnordered::new();
        for entry in entries {
            let entry = match self.queue.mark_processing(entry).await {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to mark sync entry processing");
                    inflight_errors.fetch_add(1, Ordering::SeqCst);
                    continue;
                }
            };
            let permit = semaphore.clone().acquire_owned().await.expect("semaphore never closed");
            let store = self.store.clone();
            let conflicts = self.conflicts.clone();
            let transport = self.transport.clone();
            let queue = self.queue.clone();
            let retry_policy = self.retry_policy;
            let timeout = self.request_timeout;
            let direction = self.policy.read().direction;
            let events = self.events.clone();
            tasks.push(async move {
                let _permit = permit;
                run_one_entry(&store, &conflicts, transport.as_ref(), &queue, retry_policy, timeout, direction, entry, &events).await
            });
        }

        while let Some(outcome) = tasks.next().await {
            if outcome.is_err() {
                inflight_errors.fetch_add(1, Ordering::SeqCst);
            }
        }

        *self.state.write() = if inflight_errors.load(Ordering::SeqCst) > 0 { SchedulerState::Error } else { SchedulerState::Idle };
    }

    async fn sync_one_document(&self, doc_id: &str) -> Result<()> {
        *self.state.write() = SchedulerState::Syncing;
        let entry = SyncQueueEntry {
            id: 0,
            doc_id: doc_id.to_string(),
            operation: SyncOperation::Update,
            status: sync_core::model::SyncQueueStatus::Processing,
            attempts: 0,
            next_attempt_at: None,
            last_error: None,
            enqueued_at: self.queue.now(),
            priority: 0,
            payload: None,
        };
        let direction = self.policy.read().direction;
        let result = run_one_entry(
            &self.store,
            &self.conflicts,
            self.transport.as_ref(),
            &self.queue,
            self.retry_policy,
            self.request_timeout,
            direction,
            entry,
            &self.events,
        )
        .await;
        *self.state.write() = if result.is_ok() { SchedulerState::Idle } else { SchedulerState::Error };
        result
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_one_entry(
    store: &Arc<DocumentStore>,
    conflicts: &Arc<ConflictManager>,
    transport: &dyn SyncTransport,
    queue: &Arc<SyncQueue>,
    retry_policy: RetryPolicy,
    timeout: Duration,
    direction: SyncDirection,
    entry: SyncQueueEntry,
    events: &EventSink,
) -> Result<()> {
    let doc_id = entry.doc_id.clone();
    events.emit(SchedulerEvent::SyncStarted { doc_id: doc_id.clone() });
    let started = Instant::now();
    let outcome = sync_document(store, conflicts, transport, timeout, direction, doc_id.clone(), queue).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Ok(()) => {
            queue.mark_completed(entry).await?;
            events.emit(SchedulerEvent::SyncSuccess { doc_id: doc_id.clone(), duration_ms });
            events.emit(SchedulerEvent::QueueRemoved { doc_id: doc_id.clone() });
            tracing::info!(doc_id, "document synced");
            Ok(())
        }
        Err(e) => {
            tracing::warn!(doc_id, error = %e, attempts = entry.attempts, "sync attempt failed");
            events.emit(SchedulerEvent::SyncError { doc_id: doc_id.clone(), error: e.to_string() });
            let retry_at = retry_policy.delay_for(entry.attempts).map(|delay| queue.future_timestamp(delay));
            if retry_at.is_some() {
                events.emit(SchedulerEvent::SyncRetry { doc_id: doc_id.clone(), attempts: entry.attempts + 1 });
            } else {
                events.emit(SchedulerEvent::SyncMaxRetries { doc_id: doc_id.clone() });
                let _ = store.update_metadata(&doc_id, |meta| meta.sync_status = SyncStatus::Failed).await;
            }
            queue.requeue_failed(entry, e.to_string(), retry_at).await?;
            Err(e)
        }
    }
}

async fn sync_document(
    store: &Arc<DocumentStore>,
    conflicts: &Arc<ConflictManager>,
    transport: &dyn SyncTransport,
    timeout: Duration,
    direction: SyncDirection,
    doc_id: String,
    queue: &Arc<SyncQueue>,
) -> Result<()> {
    let doc_id = doc_id.as_str();
    let state_vector = match store.get_state_vector(doc_id).await {
        Ok(sv) => sv,
        Err(e) if e.kind() == sync_core::ErrorKind::NotFound => {
            tracing::debug!(doc_id, "document no longer exists locally; nothing to sync");
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    let state_vector_bytes = rmp_serde::to_vec_named(&state_vector)
        .map_err(|e| SyncError::with_source(sync_core::ErrorKind::Protocol, "failed to encode state vector", e))?;

    // A download-only round still has to send a body (the wire contract has
    // no "request only" shape); it sends the empty update the HLC clock
    // would encode for a document with nothing new to report.
    let outgoing = if direction == SyncDirection::Download {
        sync_core::UpdateBlob::Map(Vec::new())
    } else {
        store.get_update(doc_id, None).await?
    };
    let body = rmp_serde::to_vec_named(&outgoing)
        .map_err(|e| SyncError::with_source(sync_core::ErrorKind::Protocol, "failed to encode outgoing update", e))?;

    let response_bytes = transport.exchange(doc_id, body, Some(state_vector_bytes), timeout).await?;

    if direction == SyncDirection::Upload {
        // Peer applied our update; this replica doesn't merge its response.
        let now = queue.now();
        let _ = store
            .update_metadata(doc_id, |meta| {
                meta.sync_status = SyncStatus::Synced;
                meta.last_synced = Some(now);
            })
            .await;
        return Ok(());
    }

    if response_bytes.is_empty() {
        // §6.2: an empty 2xx body means the peer has nothing new for us,
        // not a malformed response -- mark synced and stop, no decode.
        let now = queue.now();
        let _ = store
            .update_metadata(doc_id, |meta| {
                meta.sync_status = SyncStatus::Synced;
                meta.last_synced = Some(now);
            })
            .await;
        return Ok(());
    }

    let remote_update: sync_core::UpdateBlob = rmp_serde::from_slice(&response_bytes)
        .map_err(|e| SyncError::with_source(sync_core::ErrorKind::Protocol, "failed to decode remote update", e))?;

    store.apply_remote_update(doc_id, remote_update).await?;

    let remote_value = store.get_value(doc_id).await?;
    let now = queue.now();
    conflicts.detect(doc_id, &remote_value, now).await?;

    let _ = store
        .update_metadata(doc_id, |meta| {
            meta.sync_status = SyncStatus::Synced;
            meta.last_synced = Some(queue.now());
        })
        .await;

    Ok(())
}
