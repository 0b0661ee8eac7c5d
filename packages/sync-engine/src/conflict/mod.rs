//! Conflict Manager (component C, §4.3): detects structural divergence
//! between local and remote document snapshots, dispatches resolution
//! strategies, writes the outcome back into the document store, and keeps
//! an append-only audit trail.

pub mod audit;
pub mod detect;
pub mod resolve;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use sync_core::model::{AuditAction, ConflictRecord, ConflictStatus, ResolutionStrategy};
use sync_core::{Result, SyncError, SystemClock, Timestamp, Value, HLC};

pub use audit::AuditLog;
pub use detect::{detect_conflicts, DetectedConflict};
pub use resolve::{resolve_value, FieldChoice, KindHandler, MergeRegistry, ValueTag};

use crate::store::DocumentStore;

/// Ties detection, resolution, writeback, and auditing together over one
/// [`DocumentStore`].
pub struct ConflictManager {
    store: Arc<DocumentStore>,
    conflicts: DashMap<String, ConflictRecord>,
    audit: AuditLog,
    clock: parking_lot::Mutex<HLC>,
    next_id: AtomicU64,
    merge_registry: MergeRegistry,
}

impl ConflictManager {
    #[must_use]
    pub fn new(node_id: impl Into<String>, store: Arc<DocumentStore>) -> Self {
        Self {
            store,
            conflicts: DashMap::new(),
            audit: AuditLog::new(),
            clock: parking_lot::Mutex::new(HLC::new(node_id.into(), Box::new(SystemClock))),
            next_id: AtomicU64::new(1),
            merge_registry: MergeRegistry::new(),
        }
    }

    /// Overrides the `auto_merge` handler for one value kind (e.g. a
    /// different array merge policy) without replacing the rest of the
    /// registry.
    pub fn set_merge_handler(&mut self, tag: ValueTag, handler: Box<dyn KindHandler>) {
        self.merge_registry.set_handler(tag, handler);
    }

    fn next_conflict_id(&self) -> String {
        format!("conflict-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Diffs `doc_id`'s current local state against `remote`, recording one
    /// [`ConflictRecord`] per structural divergence. `remote_timestamp` is
    /// the HLC timestamp the remote snapshot was stamped with on arrival.
    pub async fn detect(
        &self,
        doc_id: &str,
        remote: &Value,
        remote_timestamp: Timestamp,
    ) -> Result<Vec<ConflictRecord>> {
        let local = self.store.get_value(doc_id).await?;
        let metadata = self.store.get_metadata(doc_id).await?;
        let found = detect_conflicts(&local, remote);

        let mut records = Vec::with_capacity(found.len());
        let detected_at = self.clock.lock().now();
        for d in found {
            let record = ConflictRecord {
                id: self.next_conflict_id(),
                doc_id: doc_id.to_string(),
                field_path: d.path,
                conflict_type: d.conflict_type,
                status: ConflictStatus::Pending,
                local_value: d.local_value,
                remote_value: d.remote_value,
                local_timestamp: metadata.last_modified.clone(),
                remote_timestamp: remote_timestamp.clone(),
                resolution: None,
                detected_at: detected_at.clone(),
                resolved_at: None,
                resolved_by: None,
                resolved_value: None,
                field_resolutions: None,
            };
            self.conflicts.insert(record.id.clone(), record.clone());

            self.audit.record(sync_core::model::AuditLogEntry {
                id: 0,
                doc_id: record.doc_id.clone(),
                conflict_id: record.id.clone(),
                action: AuditAction::Detected,
                strategy: None,
                applied_value: None,
                applied_at: detected_at.clone(),
                applied_by: "system".to_string(),
                details: Some(record.field_path.clone()),
            });

            records.push(record);
        }

        if !records.is_empty() {
            self.store
                .update_metadata(doc_id, |meta| meta.sync_status = sync_core::model::SyncStatus::Conflict)
                .await?;
            tracing::warn!(doc_id, count = records.len(), "structural conflicts detected");
        }
        Ok(records)
    }

    fn require_pending(&self, conflict_id: &str) -> Result<ConflictRecord> {
        let record = self
            .conflicts
            .get(conflict_id)
            .ok_or_else(|| SyncError::not_found(format!("conflict '{conflict_id}' not found")))?
            .clone();
        match record.status {
            ConflictStatus::Resolved | ConflictStatus::Ignored => {
                Err(SyncError::already_resolved(format!("conflict '{conflict_id}' is already {:?}", record.status)))
            }
            _ => Ok(record),
        }
    }

    /// Resolves one conflict with `strategy`, writing the resolved value
    /// back into the document (unless the conflict's path is the document
    /// root, which has no single-value replacement) and appending an audit
    /// entry. `custom` is required by [`ResolutionStrategy::Custom`].
    pub async fn resolve(
        &self,
        conflict_id: &str,
        strategy: ResolutionStrategy,
        principal: &str,
        custom: Option<Value>,
    ) -> Result<ConflictRecord> {
        let record = self.require_pending(conflict_id)?;
        if strategy == ResolutionStrategy::FieldLevel {
            return Err(SyncError::invalid_argument("field_level strategy requires resolve_field_level"));
        }

        let resolved = resolve_value(
            strategy,
            record.local_value.as_ref(),
            record.remote_value.as_ref(),
            Some(&record.local_timestamp),
            Some(&record.remote_timestamp),
            custom,
            &self.merge_registry,
        )?;

        self.write_back(&record, &resolved).await?;
        self.finalize(record, strategy, resolved, principal).await
    }

    /// Resolves every pending conflict on `doc_id` whose field path is a key
    /// in `choices`, one resolution per matching conflict (spec scenario 3:
    /// a single `field_level` call covers several independent field
    /// conflicts, each with its own local/remote/merged choice).
    pub async fn resolve_field_level(
        &self,
        doc_id: &str,
        choices: &HashMap<String, FieldChoice>,
        principal: &str,
    ) -> Result<Vec<ConflictRecord>> {
        let matching: Vec<ConflictRecord> = self
            .conflicts
            .iter()
            .filter(|e| e.doc_id == doc_id && e.status == ConflictStatus::Pending && choices.contains_key(&e.field_path))
            .map(|e| e.value().clone())
            .collect();

        if matching.is_empty() {
            return Err(SyncError::invalid_argument(format!("no pending conflicts on '{doc_id}' match the given fields")));
        }

        let mut resolved_records = Vec::with_capacity(matching.len());
        for mut record in matching {
            let choice = choices[&record.field_path];
            let resolved = match choice {
                FieldChoice::Local => record
                    .local_value
                    .clone()
                    .ok_or_else(|| SyncError::invalid_argument("no local value to keep"))?,
                FieldChoice::Remote => record
                    .remote_value
                    .clone()
                    .ok_or_else(|| SyncError::invalid_argument("no remote value to accept"))?,
                FieldChoice::Merged => self.merge_registry.merge(
                    record.local_value.as_ref().unwrap_or(&Value::Null),
                    record.remote_value.as_ref().unwrap_or(&Value::Null),
                    Some(&record.local_timestamp),
                    Some(&record.remote_timestamp),
                ),
            };

            let mut field_resolutions = std::collections::BTreeMap::new();
            field_resolutions.insert(record.field_path.clone(), field_choice_to_strategy(choice));
            record.field_resolutions = Some(field_resolutions);

            self.write_back(&record, &resolved).await?;
            resolved_records.push(self.finalize(record, ResolutionStrategy::FieldLevel, resolved, principal).await?);
        }
        Ok(resolved_records)
    }

    async fn write_back(&self, record: &ConflictRecord, resolved: &Value) -> Result<()> {
        if record.field_path.is_empty() {
            // The document root has no single-value replacement primitive;
            // whole-document conflicts are resolved by the caller choosing
            // a side and re-creating state, not by this writeback.
            return Ok(());
        }
        let path = record.field_path.clone();
        let value = resolved.clone();
        self.store.transact(&record.doc_id, move |doc| doc.set_at_path(&path, value)).await?;
        Ok(())
    }

    async fn finalize(
        &self,
        mut record: ConflictRecord,
        strategy: ResolutionStrategy,
        resolved: Value,
        principal: &str,
    ) -> Result<ConflictRecord> {
        let now = self.clock.lock().now();
        record.status = ConflictStatus::Resolved;
        record.resolution = Some(strategy);
        record.resolved_at = Some(now.clone());
        record.resolved_by = Some(principal.to_string());
        record.resolved_value = Some(resolved.clone());
        self.conflicts.insert(record.id.clone(), record.clone());

        self.audit.record(sync_core::model::AuditLogEntry {
            id: 0,
            doc_id: record.doc_id.clone(),
            conflict_id: record.id.clone(),
            action: AuditAction::Resolved,
            strategy: Some(strategy),
            applied_value: Some(resolved),
            applied_at: now,
            applied_by: principal.to_string(),
            details: None,
        });

        if !self.has_pending(&record.doc_id) {
            self.store
                .update_metadata(&record.doc_id, |meta| meta.sync_status = sync_core::model::SyncStatus::Unsynced)
                .await?;
        }

        tracing::info!(conflict_id = %record.id, doc_id = %record.doc_id, ?strategy, "conflict resolved");
        Ok(record)
    }

    fn has_pending(&self, doc_id: &str) -> bool {
        self.conflicts.iter().any(|e| e.doc_id == doc_id && e.status == ConflictStatus::Pending)
    }

    #[must_use]
    pub fn get(&self, conflict_id: &str) -> Option<ConflictRecord> {
        self.conflicts.get(conflict_id).map(|e| e.clone())
    }

    #[must_use]
    pub fn get_by_doc(&self, doc_id: &str) -> Vec<ConflictRecord> {
        self.conflicts.iter().filter(|e| e.doc_id == doc_id).map(|e| e.value().clone()).collect()
    }

    #[must_use]
    pub fn get_by_status(&self, status: ConflictStatus) -> Vec<ConflictRecord> {
        self.conflicts.iter().filter(|e| e.status == status).map(|e| e.value().clone()).collect()
    }

    #[must_use]
    pub fn get_pending(&self) -> Vec<ConflictRecord> {
        self.get_by_status(ConflictStatus::Pending)
    }

    #[must_use]
    pub fn get_all(&self) -> Vec<ConflictRecord> {
        self.conflicts.iter().map(|e| e.value().clone()).collect()
    }

    /// Resolutions ever applied by `principal`, looked up via the audit log
    /// (conflict records themselves don't carry a resolver identity).
    #[must_use]
    pub fn get_by_user(&self, principal: &str) -> Vec<ConflictRecord> {
        self.audit
            .all()
            .into_iter()
            .filter(|e| e.applied_by == principal)
            .filter_map(|e| self.get(&e.conflict_id))
            .collect()
    }

    /// Drops every resolved/ignored conflict from the in-memory index. The
    /// audit trail is untouched; this only trims the queryable conflict set.
    pub fn clear_resolved(&self) {
        self.conflicts.retain(|_, v| v.status != ConflictStatus::Resolved && v.status != ConflictStatus::Ignored);
    }

    #[must_use]
    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    /// Marks a pending conflict ignored without writing anything back,
    /// recording `principal` as the one who dismissed it.
    pub fn ignore(&self, conflict_id: &str, principal: &str) -> Result<ConflictRecord> {
        let mut record = self.require_pending(conflict_id)?;
        let now = self.clock.lock().now();
        record.status = ConflictStatus::Ignored;
        record.resolved_at = Some(now.clone());
        record.resolved_by = Some(principal.to_string());
        self.conflicts.insert(record.id.clone(), record.clone());

        self.audit.record(sync_core::model::AuditLogEntry {
            id: 0,
            doc_id: record.doc_id.clone(),
            conflict_id: record.id.clone(),
            action: AuditAction::Ignored,
            strategy: None,
            applied_value: None,
            applied_at: now,
            applied_by: principal.to_string(),
            details: None,
        });

        Ok(record)
    }
}

/// Maps a `resolve_field_level` choice to the resolution strategy it
/// corresponds to, for [`ConflictRecord::field_resolutions`].
fn field_choice_to_strategy(choice: FieldChoice) -> ResolutionStrategy {
    match choice {
        FieldChoice::Local => ResolutionStrategy::KeepLocal,
        FieldChoice::Remote => ResolutionStrategy::AcceptRemote,
        FieldChoice::Merged => ResolutionStrategy::AutoMerge,
    }
}

impl std::fmt::Debug for ConflictManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictManager").field("pending", &self.get_pending().len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use sync_core::{DocumentKind, ErrorKind};

    use super::*;
    use crate::persistence::MemoryPersistence;

    fn ts(millis: u64) -> Timestamp {
        Timestamp { millis, counter: 0, node_id: "remote".to_string() }
    }

    async fn make_manager() -> (Arc<DocumentStore>, ConflictManager) {
        let store = Arc::new(DocumentStore::new("node-A", Arc::new(MemoryPersistence::new())));
        store
            .create_document(
                "doc1",
                DocumentKind::Map,
                Some(vec![
                    ("owner".to_string(), Value::String("alice".to_string())),
                    ("value".to_string(), Value::Int(10)),
                ]),
            )
            .await
            .unwrap();
        let manager = ConflictManager::new("node-A", store.clone());
        (store, manager)
    }

    fn obj(pairs: &[(&str, Value)]) -> Value {
        Value::Map(pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect::<BTreeMap<_, _>>())
    }

    #[tokio::test]
    async fn detect_records_one_conflict_per_divergent_field() {
        let (_store, manager) = make_manager().await;
        let remote = obj(&[("owner", Value::String("bob".to_string())), ("value", Value::Int(10))]);

        let found = manager.detect("doc1", &remote, ts(100)).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].field_path, "owner");
        assert_eq!(manager.get_pending().len(), 1);
    }

    #[tokio::test]
    async fn keep_local_resolves_without_changing_document() {
        let (store, manager) = make_manager().await;
        let remote = obj(&[("owner", Value::String("bob".to_string())), ("value", Value::Int(10))]);
        let found = manager.detect("doc1", &remote, ts(100)).await.unwrap();

        let resolved = manager.resolve(&found[0].id, ResolutionStrategy::KeepLocal, "alice", None).await.unwrap();
        assert_eq!(resolved.status, ConflictStatus::Resolved);
        assert_eq!(store.get_path("doc1", "owner").await.unwrap(), Some(Value::String("alice".to_string())));
    }

    #[tokio::test]
    async fn accept_remote_writes_remote_value_back() {
        let (store, manager) = make_manager().await;
        let remote = obj(&[("owner", Value::String("bob".to_string())), ("value", Value::Int(10))]);
        let found = manager.detect("doc1", &remote, ts(100)).await.unwrap();

        manager.resolve(&found[0].id, ResolutionStrategy::AcceptRemote, "alice", None).await.unwrap();
        assert_eq!(store.get_path("doc1", "owner").await.unwrap(), Some(Value::String("bob".to_string())));
    }

    #[tokio::test]
    async fn resolving_twice_fails_already_resolved() {
        let (_store, manager) = make_manager().await;
        let remote = obj(&[("owner", Value::String("bob".to_string())), ("value", Value::Int(10))]);
        let found = manager.detect("doc1", &remote, ts(100)).await.unwrap();

        manager.resolve(&found[0].id, ResolutionStrategy::KeepLocal, "alice", None).await.unwrap();
        let err = manager.resolve(&found[0].id, ResolutionStrategy::KeepLocal, "alice", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyResolved);
    }

    #[tokio::test]
    async fn resolve_unknown_conflict_is_not_found() {
        let (_store, manager) = make_manager().await;
        let err = manager.resolve("nope", ResolutionStrategy::KeepLocal, "alice", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn field_level_resolves_multiple_independent_conflicts_in_one_call() {
        let (store, manager) = make_manager().await;
        // "tag" is asymmetric (existence), "owner" is a value mismatch --
        // spec scenario 3 resolves both via one field_level call.
        let remote = obj(&[
            ("owner", Value::String("bob".to_string())),
            ("value", Value::Int(10)),
            ("tag", Value::String("urgent".to_string())),
        ]);
        manager.detect("doc1", &remote, ts(100)).await.unwrap();

        let mut choices = HashMap::new();
        choices.insert("owner".to_string(), FieldChoice::Local);
        choices.insert("tag".to_string(), FieldChoice::Remote);

        let resolved = manager.resolve_field_level("doc1", &choices, "alice").await.unwrap();
        assert_eq!(resolved.len(), 2);
        assert_eq!(store.get_path("doc1", "owner").await.unwrap(), Some(Value::String("alice".to_string())));
        assert_eq!(store.get_path("doc1", "tag").await.unwrap(), Some(Value::String("urgent".to_string())));
    }

    #[tokio::test]
    async fn resolved_conflicts_are_queryable_by_resolving_user() {
        let (_store, manager) = make_manager().await;
        let remote = obj(&[("owner", Value::String("bob".to_string())), ("value", Value::Int(10))]);
        let found = manager.detect("doc1", &remote, ts(100)).await.unwrap();
        manager.resolve(&found[0].id, ResolutionStrategy::KeepLocal, "alice", None).await.unwrap();

        assert_eq!(manager.get_by_user("alice").len(), 1);
        assert!(manager.get_by_user("nobody").is_empty());
    }

    #[tokio::test]
    async fn clear_resolved_drops_resolved_but_keeps_pending() {
        let (_store, manager) = make_manager().await;
        let remote = obj(&[
            ("owner", Value::String("bob".to_string())),
            ("value", Value::Int(99)),
        ]);
        let found = manager.detect("doc1", &remote, ts(100)).await.unwrap();
        manager.resolve(&found[0].id, ResolutionStrategy::KeepLocal, "alice", None).await.unwrap();

        manager.clear_resolved();
        assert!(manager.get_all().iter().all(|c| c.status != ConflictStatus::Resolved));
    }

    #[tokio::test]
    async fn ignore_marks_conflict_ignored_and_records_who_ignored_it() {
        let (_store, manager) = make_manager().await;
        let remote = obj(&[("owner", Value::String("bob".to_string())), ("value", Value::Int(10))]);
        let found = manager.detect("doc1", &remote, ts(100)).await.unwrap();

        let ignored = manager.ignore(&found[0].id, "alice").unwrap();
        assert_eq!(ignored.status, ConflictStatus::Ignored);
        assert_eq!(ignored.resolved_by, Some("alice".to_string()));
    }

    #[tokio::test]
    async fn detect_resolve_and_ignore_each_append_one_audit_entry() {
        let (_store, manager) = make_manager().await;
        let remote = obj(&[
            ("owner", Value::String("bob".to_string())),
            ("value", Value::Int(99)),
        ]);
        let found = manager.detect("doc1", &remote, ts(100)).await.unwrap();
        assert_eq!(manager.audit_log().all().iter().filter(|e| e.action == AuditAction::Detected).count(), 2);

        manager.resolve(&found[0].id, ResolutionStrategy::KeepLocal, "alice", None).await.unwrap();
        manager.ignore(&found[1].id, "alice").unwrap();

        let entries = manager.audit_log().all();
        assert_eq!(entries.iter().filter(|e| e.action == AuditAction::Resolved).count(), 1);
        assert_eq!(entries.iter().filter(|e| e.action == AuditAction::Ignored).count(), 1);
    }

    #[tokio::test]
    async fn field_level_resolution_records_field_resolutions() {
        let (_store, manager) = make_manager().await;
        let remote = obj(&[
            ("owner", Value::String("bob".to_string())),
            ("value", Value::Int(10)),
            ("tag", Value::String("urgent".to_string())),
        ]);
        manager.detect("doc1", &remote, ts(100)).await.unwrap();

        let mut choices = HashMap::new();
        choices.insert("owner".to_string(), FieldChoice::Local);
        choices.insert("tag".to_string(), FieldChoice::Remote);

        let resolved = manager.resolve_field_level("doc1", &choices, "alice").await.unwrap();
        for record in &resolved {
            let resolutions = record.field_resolutions.as_ref().unwrap();
            assert_eq!(resolutions.len(), 1);
        }
    }
}
