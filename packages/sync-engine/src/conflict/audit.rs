//! Append-only audit trail of conflict resolutions (§4.3 "audit log").
//!
//! Distinct from [`Persistence`](crate::persistence::Persistence)'s generic
//! collections: this is an in-process index kept by the conflict manager so
//! queries by conflict/document/user stay cheap without scanning storage.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use sync_core::model::AuditLogEntry;

/// In-memory append-only log of [`AuditLogEntry`] records.
#[derive(Default)]
pub struct AuditLog {
    entries: RwLock<Vec<AuditLogEntry>>,
    next_id: AtomicU64,
}

impl AuditLog {
    #[must_use]
    pub fn new() -> Self {
        Self { entries: RwLock::new(Vec::new()), next_id: AtomicU64::new(1) }
    }

    /// Assigns an id and appends `entry`, returning the stamped record.
    pub fn record(&self, mut entry: AuditLogEntry) -> AuditLogEntry {
        entry.id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.entries.write().push(entry.clone());
        entry
    }

    #[must_use]
    pub fn for_conflict(&self, conflict_id: &str) -> Vec<AuditLogEntry> {
        self.entries.read().iter().filter(|e| e.conflict_id == conflict_id).cloned().collect()
    }

    #[must_use]
    pub fn for_document(&self, doc_id: &str) -> Vec<AuditLogEntry> {
        self.entries.read().iter().filter(|e| e.doc_id == doc_id).cloned().collect()
    }

    #[must_use]
    pub fn all(&self) -> Vec<AuditLogEntry> {
        self.entries.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use sync_core::model::{AuditAction, ResolutionStrategy};
    use sync_core::Timestamp;

    use super::*;

    fn ts() -> Timestamp {
        Timestamp { millis: 0, counter: 0, node_id: "n".to_string() }
    }

    fn entry(doc_id: &str, conflict_id: &str) -> AuditLogEntry {
        AuditLogEntry {
            id: 0,
            doc_id: doc_id.to_string(),
            conflict_id: conflict_id.to_string(),
            action: AuditAction::Resolved,
            strategy: Some(ResolutionStrategy::AcceptRemote),
            applied_value: None,
            applied_at: ts(),
            applied_by: "alice".to_string(),
            details: None,
        }
    }

    #[test]
    fn record_assigns_increasing_ids() {
        let log = AuditLog::new();
        let first = log.record(entry("doc1", "c1"));
        let second = log.record(entry("doc1", "c2"));
        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
    }

    #[test]
    fn for_conflict_filters_to_matching_id() {
        let log = AuditLog::new();
        log.record(entry("doc1", "c1"));
        log.record(entry("doc1", "c2"));
        assert_eq!(log.for_conflict("c1").len(), 1);
    }

    #[test]
    fn for_document_filters_to_matching_doc() {
        let log = AuditLog::new();
        log.record(entry("doc1", "c1"));
        log.record(entry("doc2", "c2"));
        assert_eq!(log.for_document("doc1").len(), 1);
    }
}
