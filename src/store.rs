// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local document store abstraction.
//!
//! The engine treats the store as a given collaborator behind the
//! [`DocumentStore`] trait: it persists revisions, answers predicate
//! queries, exposes a change feed, and applies pulled revisions through the
//! conflict resolver before making them visible. [`MemoryStore`] is the
//! in-process implementation used by tests and standalone deployments; a
//! durable store plugs in behind the same trait.
//!
//! Conflict detection happens in `apply_replicated`: a pulled revision
//! arrives with its revision ancestry, and the store checks descent against
//! the local revision history. Only genuinely divergent revisions reach the
//! resolver.

use crate::document::Document;
use crate::error::{EngineError, Result};
use crate::resolver::{self, ConflictPolicy};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Boxed future alias for object-safe async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A simple conjunctive filter over documents.
#[derive(Debug, Clone, Default)]
pub struct Predicate {
    /// Match only documents with this `type` field.
    pub doc_type: Option<String>,
    /// Field equality constraints, all of which must hold.
    pub equals: Vec<(String, Value)>,
}

impl Predicate {
    /// Match every live document.
    pub fn any() -> Self {
        Self::default()
    }

    /// Match live documents of the given type.
    pub fn of_type(doc_type: impl Into<String>) -> Self {
        Self {
            doc_type: Some(doc_type.into()),
            equals: Vec::new(),
        }
    }

    /// Add a field equality constraint.
    pub fn with_eq(mut self, field: impl Into<String>, value: Value) -> Self {
        self.equals.push((field.into(), value));
        self
    }

    /// Whether a document satisfies this predicate. Tombstones never match.
    pub fn matches(&self, doc: &Document) -> bool {
        if doc.deleted {
            return false;
        }
        if let Some(ty) = &self.doc_type {
            if doc.doc_type() != Some(ty.as_str()) {
                return false;
            }
        }
        self.equals
            .iter()
            .all(|(field, value)| doc.fields.get(field) == Some(value))
    }
}

/// A change made visible in the store, broadcast to subscribers.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// Store sequence number of this change.
    pub seq: u64,
    /// The revision that became current (may be a tombstone).
    pub doc: Document,
}

/// Result of applying a pulled revision.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// The pulled revision became current as-is.
    Applied(Document),
    /// The store already had this revision or a descendant of it.
    Unchanged,
    /// The revision conflicted; the resolver's merge became current.
    Merged(Document),
}

/// The store collaborator contract.
///
/// All methods return boxed futures so the trait stays object-safe; the
/// engine holds the store as `Arc<dyn DocumentStore>`.
pub trait DocumentStore: Send + Sync {
    /// Fetch the current revision, tombstones included.
    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<Document>>>;

    /// Persist a locally authored revision and return it.
    fn save<'a>(&'a self, doc: Document) -> BoxFuture<'a, Result<Document>>;

    /// Replace the current revision with a tombstone.
    fn delete<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>>;

    /// All live documents matching the predicate.
    fn query<'a>(&'a self, predicate: Predicate) -> BoxFuture<'a, Result<Vec<Document>>>;

    /// Subscribe to the change feed. Every made-visible revision is
    /// broadcast; callers filter with a [`Predicate`] as needed.
    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;

    /// Documents whose current revision changed after `since`, each with its
    /// revision ancestry (oldest first, current revision excluded), plus the
    /// new checkpoint to pass on the next call.
    fn changes_since(&self, since: u64) -> BoxFuture<'_, Result<(Vec<(Document, Vec<String>)>, u64)>>;

    /// Apply a pulled revision. Detects conflicts against local history and
    /// resolves them with `policy` before anything becomes visible.
    fn apply_replicated<'a>(
        &'a self,
        doc: Document,
        ancestry: Vec<String>,
        policy: ConflictPolicy,
    ) -> BoxFuture<'a, Result<ApplyOutcome>>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// MemoryStore
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct MemoryInner {
    docs: HashMap<String, Document>,
    /// Revision ids per document, oldest first, current revision last.
    history: HashMap<String, Vec<String>>,
    /// Sequence at which each document last changed.
    last_seq: HashMap<String, u64>,
    seq: u64,
}

/// In-memory [`DocumentStore`].
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            inner: Mutex::new(MemoryInner::default()),
            changes,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>> {
        self.inner
            .lock()
            .map_err(|_| EngineError::Store("store lock poisoned".to_string()))
    }

    /// Record `doc` as current, advance the feed, notify subscribers.
    /// Caller holds the lock.
    fn commit(&self, inner: &mut MemoryInner, doc: Document) {
        inner.seq += 1;
        inner
            .history
            .entry(doc.id.clone())
            .or_default()
            .push(doc.rev.clone());
        inner.last_seq.insert(doc.id.clone(), inner.seq);
        inner.docs.insert(doc.id.clone(), doc.clone());
        let _ = self.changes.send(ChangeEvent {
            seq: inner.seq,
            doc,
        });
    }

    fn apply_inner(
        &self,
        doc: Document,
        ancestry: Vec<String>,
        policy: ConflictPolicy,
    ) -> Result<ApplyOutcome> {
        let mut inner = self.lock()?;

        let Some(current) = inner.docs.get(&doc.id).cloned() else {
            // First sighting: adopt the remote lineage, then commit appends
            // the carried revision itself.
            inner.history.insert(doc.id.clone(), ancestry);
            self.commit(&mut inner, doc.clone());
            return Ok(ApplyOutcome::Applied(doc));
        };

        if current.rev == doc.rev {
            return Ok(ApplyOutcome::Unchanged);
        }

        // Remote descends from our current revision: fast-forward.
        if ancestry.iter().any(|rev| *rev == current.rev) {
            self.commit(&mut inner, doc.clone());
            return Ok(ApplyOutcome::Applied(doc));
        }

        // Remote revision is already in our lineage: nothing newer.
        let seen = inner
            .history
            .get(&doc.id)
            .is_some_and(|revs| revs.iter().any(|rev| *rev == doc.rev));
        if seen {
            return Ok(ApplyOutcome::Unchanged);
        }

        // Divergent lineages: resolve.
        let resolved = resolver::resolve(policy, &doc.id, Some(&current), Some(&doc));
        crate::metrics::record_conflict_resolved(policy);
        if resolved == current {
            Ok(ApplyOutcome::Unchanged)
        } else if resolved == doc {
            self.commit(&mut inner, doc.clone());
            Ok(ApplyOutcome::Applied(doc))
        } else {
            self.commit(&mut inner, resolved.clone());
            Ok(ApplyOutcome::Merged(resolved))
        }
    }
}

impl DocumentStore for MemoryStore {
    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<Document>>> {
        let result = self.lock().map(|inner| inner.docs.get(id).cloned());
        Box::pin(async move { result })
    }

    fn save<'a>(&'a self, doc: Document) -> BoxFuture<'a, Result<Document>> {
        let result = self.lock().map(|mut inner| {
            self.commit(&mut inner, doc.clone());
            doc
        });
        Box::pin(async move { result })
    }

    fn delete<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>> {
        let result = self.lock().map(|mut inner| {
            let tombstone = match inner.docs.get(id) {
                Some(current) => current.delete_revision(),
                None => Document::tombstone(id),
            };
            self.commit(&mut inner, tombstone);
        });
        Box::pin(async move { result })
    }

    fn query<'a>(&'a self, predicate: Predicate) -> BoxFuture<'a, Result<Vec<Document>>> {
        let result = self.lock().map(|inner| {
            let mut docs: Vec<Document> = inner
                .docs
                .values()
                .filter(|doc| predicate.matches(doc))
                .cloned()
                .collect();
            docs.sort_by(|a, b| a.id.cmp(&b.id));
            docs
        });
        Box::pin(async move { result })
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    fn changes_since(&self, since: u64) -> BoxFuture<'_, Result<(Vec<(Document, Vec<String>)>, u64)>> {
        let result = self.lock().map(|inner| {
            let mut changed: Vec<(u64, Document, Vec<String>)> = inner
                .last_seq
                .iter()
                .filter(|(_, seq)| **seq > since)
                .filter_map(|(id, seq)| {
                    let doc = inner.docs.get(id)?.clone();
                    let mut ancestry = inner.history.get(id).cloned().unwrap_or_default();
                    // Ancestry excludes the current revision.
                    ancestry.pop();
                    Some((*seq, doc, ancestry))
                })
                .collect();
            changed.sort_by_key(|(seq, _, _)| *seq);
            let docs = changed
                .into_iter()
                .map(|(_, doc, ancestry)| (doc, ancestry))
                .collect();
            (docs, inner.seq)
        });
        Box::pin(async move { result })
    }

    fn apply_replicated<'a>(
        &'a self,
        doc: Document,
        ancestry: Vec<String>,
        policy: ConflictPolicy,
    ) -> BoxFuture<'a, Result<ApplyOutcome>> {
        let result = self.apply_inner(doc, ancestry, policy);
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{EmergencyRequest, EmergencyType};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn request_doc(id: &str, requested_at: i64) -> Document {
        let req = EmergencyRequest::new_open(EmergencyType::Ambulance, "stockholm", "1", requested_at);
        Document::new(id, req.into_fields())
    }

    #[tokio::test]
    async fn test_save_and_get() {
        let store = MemoryStore::new();
        let doc = request_doc("r1", 1000);
        store.save(doc.clone()).await.unwrap();
        assert_eq!(store.get("r1").await.unwrap(), Some(doc));
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_leaves_tombstone() {
        let store = MemoryStore::new();
        store.save(request_doc("r1", 1000)).await.unwrap();
        store.delete("r1").await.unwrap();

        let doc = store.get("r1").await.unwrap().unwrap();
        assert!(doc.deleted);
        assert_eq!(doc.generation(), 2);
    }

    #[tokio::test]
    async fn test_query_predicate() {
        let store = MemoryStore::new();
        store.save(request_doc("r1", 1000)).await.unwrap();
        store.save(request_doc("r2", 2000)).await.unwrap();
        let mut other = BTreeMap::new();
        other.insert("type".to_string(), json!("user"));
        store.save(Document::new("u1", other)).await.unwrap();

        let requests = store
            .query(Predicate::of_type("emergency_request"))
            .await
            .unwrap();
        assert_eq!(requests.len(), 2);

        let open = store
            .query(Predicate::of_type("emergency_request").with_eq("status", json!("open")))
            .await
            .unwrap();
        assert_eq!(open.len(), 2);

        let responded = store
            .query(Predicate::of_type("emergency_request").with_eq("status", json!("responded")))
            .await
            .unwrap();
        assert!(responded.is_empty());
    }

    #[tokio::test]
    async fn test_query_excludes_tombstones() {
        let store = MemoryStore::new();
        store.save(request_doc("r1", 1000)).await.unwrap();
        store.delete("r1").await.unwrap();
        assert!(store.query(Predicate::any()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_receives_changes() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe();
        store.save(request_doc("r1", 1000)).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.doc.id, "r1");
        assert_eq!(event.seq, 1);
    }

    #[tokio::test]
    async fn test_changes_since() {
        let store = MemoryStore::new();
        store.save(request_doc("r1", 1000)).await.unwrap();
        store.save(request_doc("r2", 2000)).await.unwrap();

        let (docs, checkpoint) = store.changes_since(0).await.unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(checkpoint, 2);

        let (docs, checkpoint) = store.changes_since(checkpoint).await.unwrap();
        assert!(docs.is_empty());
        assert_eq!(checkpoint, 2);
    }

    #[tokio::test]
    async fn test_changes_since_ancestry_excludes_current() {
        let store = MemoryStore::new();
        let doc = store.save(request_doc("r1", 1000)).await.unwrap();
        let mut fields = doc.fields.clone();
        fields.insert("status".to_string(), json!("responded"));
        let revised = store.save(doc.revise(fields)).await.unwrap();

        let (docs, _) = store.changes_since(0).await.unwrap();
        let (current, ancestry) = &docs[0];
        assert_eq!(current.rev, revised.rev);
        assert_eq!(ancestry, &vec![doc.rev]);
    }

    #[tokio::test]
    async fn test_apply_new_document() {
        let store = MemoryStore::new();
        let doc = request_doc("r1", 1000);
        let outcome = store
            .apply_replicated(doc.clone(), vec![], ConflictPolicy::Mesh)
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied(doc));
    }

    #[tokio::test]
    async fn test_apply_new_document_adopts_ancestry() {
        let store = MemoryStore::new();
        let base = request_doc("r1", 1000);
        let mut fields = base.fields.clone();
        fields.insert("status".to_string(), json!("responded"));
        let newer = base.revise(fields);

        let outcome = store
            .apply_replicated(newer.clone(), vec![base.rev.clone()], ConflictPolicy::Gateway)
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied(newer.clone()));

        // The adopted lineage makes the old revision a known ancestor, not
        // a conflict.
        let outcome = store
            .apply_replicated(base, vec![], ConflictPolicy::Gateway)
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Unchanged);
        assert_eq!(store.get("r1").await.unwrap(), Some(newer));
    }

    #[tokio::test]
    async fn test_apply_same_revision_unchanged() {
        let store = MemoryStore::new();
        let doc = request_doc("r1", 1000);
        store.save(doc.clone()).await.unwrap();
        let outcome = store
            .apply_replicated(doc, vec![], ConflictPolicy::Mesh)
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_apply_fast_forward() {
        let store = MemoryStore::new();
        let doc = store.save(request_doc("r1", 1000)).await.unwrap();
        let mut fields = doc.fields.clone();
        fields.insert("status".to_string(), json!("responded"));
        let newer = doc.revise(fields);

        let outcome = store
            .apply_replicated(newer.clone(), vec![doc.rev], ConflictPolicy::Mesh)
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied(newer.clone()));
        assert_eq!(store.get("r1").await.unwrap(), Some(newer));
    }

    #[tokio::test]
    async fn test_apply_stale_ancestor_unchanged() {
        let store = MemoryStore::new();
        let doc = store.save(request_doc("r1", 1000)).await.unwrap();
        let mut fields = doc.fields.clone();
        fields.insert("status".to_string(), json!("responded"));
        let newer = store.save(doc.revise(fields)).await.unwrap();

        // A peer pushes the old revision back at us.
        let outcome = store
            .apply_replicated(doc, vec![], ConflictPolicy::Mesh)
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Unchanged);
        assert_eq!(store.get("r1").await.unwrap(), Some(newer));
    }

    #[tokio::test]
    async fn test_apply_conflict_gateway_first_responder() {
        let store = MemoryStore::new();
        let base = store.save(request_doc("r1", 1000)).await.unwrap();

        // We responded at 1500; a peer responded at 1400.
        let mut ours = base.fields.clone();
        ours.insert("status".to_string(), json!("responded"));
        ours.insert("responded_at".to_string(), json!(1500));
        store.save(base.revise(ours)).await.unwrap();

        let mut theirs = base.fields.clone();
        theirs.insert("status".to_string(), json!("responded"));
        theirs.insert("responded_at".to_string(), json!(1400));
        let remote = base.revise(theirs);

        let outcome = store
            .apply_replicated(remote.clone(), vec![], ConflictPolicy::Gateway)
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied(remote.clone()));
        assert_eq!(
            store.get("r1").await.unwrap().unwrap().get_i64("responded_at"),
            Some(1400)
        );
    }

    #[tokio::test]
    async fn test_apply_conflict_gateway_local_wins_unchanged() {
        let store = MemoryStore::new();
        let base = store.save(request_doc("r1", 1000)).await.unwrap();

        let mut ours = base.fields.clone();
        ours.insert("status".to_string(), json!("responded"));
        ours.insert("responded_at".to_string(), json!(1400));
        let local = store.save(base.revise(ours)).await.unwrap();

        let mut theirs = base.fields.clone();
        theirs.insert("status".to_string(), json!("responded"));
        theirs.insert("responded_at".to_string(), json!(1500));
        let remote = base.revise(theirs);

        let outcome = store
            .apply_replicated(remote, vec![], ConflictPolicy::Gateway)
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Unchanged);
        assert_eq!(store.get("r1").await.unwrap(), Some(local));
    }

    #[tokio::test]
    async fn test_apply_conflict_mesh_merges() {
        let store = MemoryStore::new();
        let base = store.save(request_doc("r1", 1000)).await.unwrap();

        let mut ours = base.fields.clone();
        ours.insert("note_local".to_string(), json!("a"));
        store.save(base.revise(ours)).await.unwrap();

        let mut theirs = base.fields.clone();
        theirs.insert("note_remote".to_string(), json!("b"));
        let remote = base.revise(theirs);

        let outcome = store
            .apply_replicated(remote, vec![], ConflictPolicy::Mesh)
            .await
            .unwrap();
        let ApplyOutcome::Merged(merged) = outcome else {
            panic!("expected merge");
        };
        assert_eq!(merged.fields.get("note_local"), Some(&json!("a")));
        assert_eq!(merged.fields.get("note_remote"), Some(&json!("b")));
        assert_eq!(store.get("r1").await.unwrap(), Some(merged));
    }

    #[test]
    fn test_predicate_tombstone_never_matches() {
        let tombstone = Document::tombstone("r1");
        assert!(!Predicate::any().matches(&tombstone));
    }
}
