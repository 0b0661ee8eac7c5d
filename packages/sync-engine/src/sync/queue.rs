//! Durable sync queue (§4.4 "queue"): a thin typed wrapper over
//! [`Persistence`]'s sync-entry collection, plus an in-memory FIFO ordering
//! rebuilt from durable storage on startup.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sync_core::model::{SyncOperation, SyncQueueEntry, SyncQueueStatus};
use sync_core::{ClockSource, Result, SystemClock, Timestamp, HLC};

use crate::persistence::Persistence;

/// Orders pending work and mirrors it into durable storage.
pub struct SyncQueue {
    persistence: Arc<dyn Persistence>,
    order: Mutex<VecDeque<u64>>,
    clock: Mutex<HLC>,
}

impl SyncQueue {
    /// Rebuilds in-memory FIFO order from whatever is durably pending,
    /// oldest `enqueued_at` first.
    pub async fn load(node_id: impl Into<String>, persistence: Arc<dyn Persistence>) -> Result<Self> {
        let mut pending = persistence.list_sync_entries(Some(SyncQueueStatus::Pending)).await?;
        pending.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at));
        let order = pending.into_iter().map(|e| e.id).collect();
        Ok(Self {
            persistence,
            order: Mutex::new(order),
            clock: Mutex::new(HLC::new(node_id.into(), Box::new(SystemClock))),
        })
    }

    pub async fn enqueue(&self, doc_id: &str, operation: SyncOperation) -> Result<u64> {
        self.enqueue_with_priority(doc_id, operation, 0, None).await
    }

    /// Like [`Self::enqueue`], additionally recording a drain-order
    /// `priority` and an optional `payload` (a serialized update blob or
    /// tombstone marker) captured at enqueue time.
    pub async fn enqueue_with_priority(
        &self,
        doc_id: &str,
        operation: SyncOperation,
        priority: i32,
        payload: Option<Vec<u8>>,
    ) -> Result<u64> {
        let enqueued_at = self.clock.lock().now();
        let entry = SyncQueueEntry {
            id: 0,
            doc_id: doc_id.to_string(),
            operation,
            status: SyncQueueStatus::Pending,
            attempts: 0,
            next_attempt_at: None,
            last_error: None,
            enqueued_at,
            priority,
            payload,
        };
        let id = self.persistence.enqueue_sync_entry(entry).await?;
        self.order.lock().push_back(id);
        Ok(id)
    }

    /// Pops the oldest pending entry whose `next_attempt_at` has passed, if
    /// any. Entries not yet due are cycled back onto the queue in their
    /// original order rather than dropped, so a backed-off entry isn't lost
    /// and still drains FIFO once its delay elapses.
    pub async fn pop_ready(&self) -> Result<Option<SyncQueueEntry>> {
        let now = SystemClock.now();
        let candidates = self.order.lock().len();
        let mut deferred = Vec::new();
        let mut ready = None;

        for _ in 0..candidates {
            let candidate_id = { self.order.lock().pop_front() };
            let Some(id) = candidate_id else { break };
            let Some(entry) = self.persistence.get_sync_entry(id).await? else { continue };
            if entry.status != SyncQueueStatus::Pending {
                continue;
            }
            if entry.next_attempt_at.as_ref().is_none_or(|t| t.millis <= now) {
                ready = Some(entry);
                break;
            }
            deferred.push(id);
        }

        if !deferred.is_empty() {
            let mut order = self.order.lock();
            for id in deferred.into_iter().rev() {
                order.push_front(id);
            }
        }
        Ok(ready)
    }

    pub async fn mark_processing(&self, mut entry: SyncQueueEntry) -> Result<SyncQueueEntry> {
        entry.status = SyncQueueStatus::Processing;
        self.persistence.update_sync_entry(entry.clone()).await?;
        Ok(entry)
    }

    /// Current wall-clock time as an HLC timestamp stamped with this queue's
    /// node id, for bookkeeping fields the caller doesn't need causal
    /// ordering for (e.g. a retry deadline).
    #[must_use]
    pub fn now(&self) -> Timestamp {
        self.clock.lock().now()
    }

    /// `now() + delay`, for computing a retry entry's `next_attempt_at`.
    #[must_use]
    pub fn future_timestamp(&self, delay: Duration) -> Timestamp {
        let mut ts = self.now();
        ts.millis += delay.as_millis() as u64;
        ts
    }

    /// Cancels every queue entry (pending or processing) for `doc_id`,
    /// durably and from the in-memory order, so work already queued for a
    /// document doesn't run after the document itself is gone. Returns the
    /// number of entries cancelled.
    pub async fn cancel_for_document(&self, doc_id: &str) -> Result<usize> {
        let entries = self.persistence.list_sync_entries(None).await?;
        let cancelled: Vec<u64> = entries.iter().filter(|e| e.doc_id == doc_id).map(|e| e.id).collect();
        for id in &cancelled {
            self.persistence.remove_sync_entry(*id).await?;
        }
        if !cancelled.is_empty() {
            self.order.lock().retain(|id| !cancelled.contains(id));
        }
        Ok(cancelled.len())
    }

    pub async fn mark_completed(&self, mut entry: SyncQueueEntry) -> Result<()> {
        entry.status = SyncQueueStatus::Completed;
        self.persistence.update_sync_entry(entry.clone()).await?;
        self.persistence.remove_sync_entry(entry.id).await
    }

    /// Requeues a failed entry with incremented attempts. If `retry_at` is
    /// `None` the entry's retry budget is exhausted and it's marked failed
    /// (not re-queued).
    pub async fn requeue_failed(
        &self,
        mut entry: SyncQueueEntry,
        error: String,
        retry_at: Option<sync_core::Timestamp>,
    ) -> Result<()> {
        entry.attempts += 1;
        entry.last_error = Some(error);
        match retry_at {
            Some(next) => {
                entry.status = SyncQueueStatus::Pending;
                entry.next_attempt_at = Some(next);
                self.persistence.update_sync_entry(entry.clone()).await?;
                self.order.lock().push_back(entry.id);
            }
            None => {
                entry.status = SyncQueueStatus::Failed;
                self.persistence.update_sync_entry(entry).await?;
            }
        }
        Ok(())
    }

    pub async fn pending_count(&self) -> Result<usize> {
        Ok(self.persistence.list_sync_entries(Some(SyncQueueStatus::Pending)).await?.len())
    }
}
