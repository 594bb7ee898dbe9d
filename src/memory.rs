// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process document store implementing every collaborator trait.
//!
//! [`MemoryDatabase`] keeps a revision tree per document, a monotonically
//! increasing changes feed, and update/destroyed notifications. It is the
//! reference adapter: sessions can replicate between two in-process stores
//! exactly as they would between a local store and a remote one.
//!
//! # Revision Trees
//!
//! ```text
//! doc "a":   1-x ── 2-y ── 3-z      (leaf, winner)
//!                    └──── 3-w      (leaf, conflict)
//! ```
//!
//! Every revision id ever seen is kept in `known`; leaves carry the
//! revision's full history. The winner is the highest non-deleted leaf
//! under [`compare_revs`], falling back to the highest deleted leaf.
//!
//! All mutating methods are synchronous, so they can be called from event
//! callbacks.

use crate::adapter::{BoxFuture, BulkFetch, BulkWrite, ChangeSource, DatabaseHandle, RevisionDiffer, WriteOutcome};
use crate::error::{ReplicationError, Result};
use crate::model::{compare_revs, ChangeRecord, Document, RevisionHistory, RevisionRef, RevisionRequest, Sequence};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{broadcast, watch};
use tracing::debug;

/// Body and history of one stored revision.
#[derive(Debug, Clone)]
struct StoredRevision {
    /// Revision ids newest first (this one included).
    history: RevisionHistory,
    deleted: bool,
    body: serde_json::Value,
}

#[derive(Debug, Default)]
struct DocEntry {
    /// Every revision id known for this document, with or without a body.
    known: HashSet<String>,
    /// Revisions we hold a body for.
    bodies: HashMap<String, StoredRevision>,
    /// Current leaf revision ids.
    leaves: HashSet<String>,
    /// Sequence of the latest change to this document.
    seq: Sequence,
}

impl DocEntry {
    /// Winning leaf: highest non-deleted, else highest deleted.
    fn winner(&self) -> Option<&str> {
        let live = self
            .leaves
            .iter()
            .filter(|rev| !self.is_deleted(rev))
            .max_by(|a, b| compare_revs(a, b));
        live.or_else(|| self.leaves.iter().max_by(|a, b| compare_revs(a, b)))
            .map(String::as_str)
    }

    fn is_deleted(&self, rev: &str) -> bool {
        self.bodies.get(rev).map(|r| r.deleted).unwrap_or(false)
    }

    /// Leaves as revision refs, winner first.
    fn leaf_refs(&self, id: &str) -> Vec<RevisionRef> {
        let winner = self.winner().map(str::to_string);
        let mut leaves: Vec<&String> = self.leaves.iter().collect();
        leaves.sort_by(|a, b| compare_revs(b, a));
        if let Some(w) = &winner {
            if let Some(pos) = leaves.iter().position(|r| *r == w) {
                let w = leaves.remove(pos);
                leaves.insert(0, w);
            }
        }
        leaves
            .into_iter()
            .filter_map(|rev| {
                let ancestry = self
                    .bodies
                    .get(rev)
                    .map(|r| r.history.revs())
                    .unwrap_or_default();
                RevisionRef::new(id, rev.clone(), ancestry)
            })
            .collect()
    }
}

#[derive(Debug, Default)]
struct Inner {
    docs: BTreeMap<String, DocEntry>,
    /// Sequence -> document id; only the latest change per document is kept.
    changes: BTreeMap<Sequence, String>,
    update_seq: Sequence,
    destroyed: bool,
}

impl Inner {
    /// Store one revision with `new_edits = false` semantics.
    fn store(&mut self, doc: Document) -> WriteOutcome {
        let history = doc.revisions.revs();
        if history.first() != Some(&doc.rev) {
            return WriteOutcome::Rejected(format!("revision history of {} does not start at {}", doc.id, doc.rev));
        }

        let entry = self.docs.entry(doc.id.clone()).or_default();
        if entry.known.contains(&doc.rev) {
            return WriteOutcome::Conflict;
        }

        for rev in &history {
            entry.leaves.remove(rev);
            entry.known.insert(rev.clone());
        }
        entry.leaves.insert(doc.rev.clone());
        entry.bodies.insert(
            doc.rev.clone(),
            StoredRevision {
                history: doc.revisions,
                deleted: doc.deleted,
                body: doc.body,
            },
        );

        let previous = entry.seq;
        self.update_seq += 1;
        entry.seq = self.update_seq;
        self.changes.remove(&previous);
        self.changes.insert(self.update_seq, doc.id);
        WriteOutcome::Written
    }

    fn change_record(&self, id: &str, seq: Sequence) -> Option<ChangeRecord> {
        let entry = self.docs.get(id)?;
        let deleted = entry.winner().map(|w| entry.is_deleted(w)).unwrap_or(false);
        Some(ChangeRecord {
            id: id.to_string(),
            seq,
            revisions: entry.leaf_refs(id),
            deleted,
        })
    }
}

/// An in-memory database.
pub struct MemoryDatabase {
    name: String,
    inner: Mutex<Inner>,
    updates: watch::Sender<Sequence>,
    destroyed: broadcast::Sender<()>,
}

impl MemoryDatabase {
    /// Create an empty database.
    pub fn new(name: impl Into<String>) -> Self {
        let (updates, _) = watch::channel(0);
        let (destroyed, _) = broadcast::channel(1);
        Self {
            name: name.into(),
            inner: Mutex::new(Inner::default()),
            updates,
            destroyed,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_alive(&self, inner: &Inner) -> Result<()> {
        if inner.destroyed {
            return Err(ReplicationError::Destroyed {
                handle: self.name.clone(),
            });
        }
        Ok(())
    }

    fn notify(&self, seq: Sequence) {
        self.updates.send_replace(seq);
    }

    /// Database name (also its handle id).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of documents whose winning revision is not deleted.
    pub fn doc_count(&self) -> usize {
        let inner = self.lock();
        inner
            .docs
            .values()
            .filter(|entry| entry.winner().map(|w| !entry.is_deleted(w)).unwrap_or(false))
            .count()
    }

    /// Latest sequence in the changes feed.
    pub fn update_seq(&self) -> Sequence {
        self.lock().update_seq
    }

    /// Winning revision of a document, if it exists and is not deleted.
    pub fn get(&self, id: &str) -> Option<Document> {
        let inner = self.lock();
        let entry = inner.docs.get(id)?;
        let winner = entry.winner()?;
        let stored = entry.bodies.get(winner)?;
        if stored.deleted {
            return None;
        }
        Some(Document {
            id: id.to_string(),
            rev: winner.to_string(),
            revisions: stored.history.clone(),
            deleted: false,
            body: stored.body.clone(),
        })
    }

    /// Create a document, or add a child revision to its current winner.
    ///
    /// Returns the new revision id.
    pub fn put(&self, id: impl Into<String>, body: serde_json::Value) -> Result<String> {
        self.edit(id.into(), body, false)
    }

    /// Create a document with a generated id. Returns `(id, rev)`.
    pub fn post(&self, body: serde_json::Value) -> Result<(String, String)> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let rev = self.edit(id.clone(), body, false)?;
        Ok((id, rev))
    }

    /// Delete a document by writing a tombstone revision.
    pub fn remove(&self, id: impl Into<String>) -> Result<String> {
        self.edit(id.into(), serde_json::Value::Null, true)
    }

    fn edit(&self, id: String, body: serde_json::Value, deleted: bool) -> Result<String> {
        let hash = uuid::Uuid::new_v4().simple().to_string();
        let (seq, rev) = {
            let mut inner = self.lock();
            self.check_alive(&inner)?;

            let parent = inner
                .docs
                .get(&id)
                .and_then(|entry| entry.winner().and_then(|w| entry.bodies.get(w)))
                .map(|stored| stored.history.clone());
            if deleted && parent.is_none() {
                return Err(ReplicationError::BadRequest(format!("cannot delete missing document {}", id)));
            }

            let revisions = match parent {
                Some(history) => history.child(hash),
                None => RevisionHistory {
                    start: 1,
                    ids: vec![hash],
                },
            };
            let rev = revisions
                .head()
                .ok_or_else(|| ReplicationError::Internal("empty revision history".into()))?;
            let doc = Document {
                id: id.clone(),
                rev: rev.clone(),
                revisions,
                deleted,
                body,
            };
            match inner.store(doc) {
                WriteOutcome::Written => {}
                other => {
                    return Err(ReplicationError::Internal(format!("local edit of {} not stored: {:?}", id, other)));
                }
            }
            debug!(db = %self.name, id = %id, rev = %rev, "Document edited");
            (inner.update_seq, rev)
        };
        self.notify(seq);
        Ok(rev)
    }

    /// Store documents verbatim with their revision histories.
    pub fn bulk_docs(&self, docs: Vec<Document>) -> Result<Vec<WriteOutcome>> {
        let (outcomes, seq, wrote) = {
            let mut inner = self.lock();
            self.check_alive(&inner)?;
            let outcomes: Vec<WriteOutcome> = docs.into_iter().map(|doc| inner.store(doc)).collect();
            let wrote = outcomes.iter().any(|o| *o == WriteOutcome::Written);
            (outcomes, inner.update_seq, wrote)
        };
        if wrote {
            self.notify(seq);
        }
        Ok(outcomes)
    }

    /// Destroy the database: drop all data and notify `destroyed` subscribers.
    pub fn destroy(&self) {
        {
            let mut inner = self.lock();
            inner.docs.clear();
            inner.changes.clear();
            inner.destroyed = true;
        }
        let _ = self.destroyed.send(());
        debug!(db = %self.name, "Database destroyed");
    }

    /// Whether [`destroy`](Self::destroy) was called.
    pub fn is_destroyed(&self) -> bool {
        self.lock().destroyed
    }

    /// Live subscriptions to the `destroyed` notification.
    pub fn destroyed_listener_count(&self) -> usize {
        self.destroyed.receiver_count()
    }

    /// Live subscriptions to the update-sequence feed.
    pub fn change_listener_count(&self) -> usize {
        self.updates.receiver_count()
    }

    fn changes_after(&self, since: Sequence, limit: usize) -> Result<Vec<ChangeRecord>> {
        let inner = self.lock();
        self.check_alive(&inner)?;
        Ok(inner
            .changes
            .range(since.saturating_add(1)..)
            .take(limit)
            .filter_map(|(seq, id)| inner.change_record(id, *seq))
            .collect())
    }

    fn missing(&self, candidates: Vec<RevisionRequest>) -> Result<HashMap<String, Vec<String>>> {
        let inner = self.lock();
        self.check_alive(&inner)?;
        let mut missing = HashMap::new();
        for candidate in candidates {
            let known = inner.docs.get(&candidate.id).map(|e| &e.known);
            let revs: Vec<String> = candidate
                .revs
                .into_iter()
                .filter(|rev| known.map(|k| !k.contains(rev)).unwrap_or(true))
                .collect();
            if !revs.is_empty() {
                missing.insert(candidate.id, revs);
            }
        }
        Ok(missing)
    }

    fn bodies(&self, requests: Vec<RevisionRequest>) -> Result<Vec<Result<Document>>> {
        let inner = self.lock();
        self.check_alive(&inner)?;
        let mut docs = Vec::new();
        for request in requests {
            let entry = inner.docs.get(&request.id);
            for rev in request.revs {
                let doc = entry.and_then(|e| e.bodies.get(&rev)).map(|stored| Document {
                    id: request.id.clone(),
                    rev: rev.clone(),
                    revisions: stored.history.clone(),
                    deleted: stored.deleted,
                    body: stored.body.clone(),
                });
                docs.push(doc.ok_or_else(|| {
                    ReplicationError::BadRequest(format!("missing revision {} of {}", rev, request.id))
                }));
            }
        }
        Ok(docs)
    }
}

impl DatabaseHandle for MemoryDatabase {
    fn id(&self) -> &str {
        &self.name
    }

    fn destroyed(&self) -> broadcast::Receiver<()> {
        self.destroyed.subscribe()
    }
}

impl ChangeSource for MemoryDatabase {
    fn changes_since(&self, since: Sequence, limit: usize) -> BoxFuture<'_, Vec<ChangeRecord>> {
        Box::pin(async move { self.changes_after(since, limit) })
    }

    fn subscribe(&self) -> watch::Receiver<Sequence> {
        self.updates.subscribe()
    }
}

impl RevisionDiffer for MemoryDatabase {
    fn diff(&self, candidates: Vec<RevisionRequest>) -> BoxFuture<'_, HashMap<String, Vec<String>>> {
        Box::pin(async move { self.missing(candidates) })
    }
}

impl BulkFetch for MemoryDatabase {
    fn fetch(&self, requests: Vec<RevisionRequest>) -> BoxFuture<'_, Vec<Result<Document>>> {
        Box::pin(async move { self.bodies(requests) })
    }
}

impl BulkWrite for MemoryDatabase {
    fn write(&self, docs: Vec<Document>) -> BoxFuture<'_, Vec<WriteOutcome>> {
        Box::pin(async move { self.bulk_docs(docs) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn replicated(id: &str, rev: &str, history: RevisionHistory) -> Document {
        Document {
            id: id.into(),
            rev: rev.into(),
            revisions: history,
            deleted: false,
            body: json!({}),
        }
    }

    #[test]
    fn test_put_and_get() {
        let db = MemoryDatabase::new("db");
        let rev1 = db.put("a", json!({"n": 1})).unwrap();
        assert!(rev1.starts_with("1-"));
        let rev2 = db.put("a", json!({"n": 2})).unwrap();
        assert!(rev2.starts_with("2-"));

        let doc = db.get("a").unwrap();
        assert_eq!(doc.rev, rev2);
        assert_eq!(doc.body, json!({"n": 2}));
        assert_eq!(doc.revisions.revs(), vec![rev2, rev1]);
        assert_eq!(db.doc_count(), 1);
        assert_eq!(db.update_seq(), 2);
    }

    #[test]
    fn test_post_generates_ids() {
        let db = MemoryDatabase::new("db");
        let (a, _) = db.post(json!({})).unwrap();
        let (b, _) = db.post(json!({})).unwrap();
        assert_ne!(a, b);
        assert_eq!(db.doc_count(), 2);
    }

    #[test]
    fn test_remove_tombstones() {
        let db = MemoryDatabase::new("db");
        db.put("a", json!({})).unwrap();
        db.remove("a").unwrap();
        assert!(db.get("a").is_none());
        assert_eq!(db.doc_count(), 0);
        assert!(db.remove("nope").is_err());
    }

    #[tokio::test]
    async fn test_changes_keep_latest_per_doc() {
        let db = MemoryDatabase::new("db");
        db.put("a", json!({})).unwrap();
        db.put("b", json!({})).unwrap();
        db.put("a", json!({})).unwrap();

        let changes = db.changes_since(0, 10).await.unwrap();
        let ids: Vec<&str> = changes.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(changes[1].seq, 3);

        let after = db.changes_since(2, 10).await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(db.changes_since(0, 1).await.unwrap().len(), 1);
    }

    #[test]
    fn test_bulk_docs_new_edits_false() {
        let db = MemoryDatabase::new("db");
        let gen2 = RevisionHistory {
            start: 2,
            ids: vec!["x".into(), "y".into()],
        };
        let outcomes = db
            .bulk_docs(vec![
                replicated("a", "1-x", RevisionHistory::from_rev("1-x").unwrap()),
                replicated("b", "2-x", gen2),
            ])
            .unwrap();
        assert_eq!(outcomes, vec![WriteOutcome::Written, WriteOutcome::Written]);
        assert_eq!(db.get("b").unwrap().rev, "2-x");

        // Same revision again is a conflict, not an error
        let again = db
            .bulk_docs(vec![replicated("a", "1-x", RevisionHistory::from_rev("1-x").unwrap())])
            .unwrap();
        assert_eq!(again, vec![WriteOutcome::Conflict]);
        assert_eq!(db.doc_count(), 2);
    }

    #[test]
    fn test_bulk_docs_rejects_bad_history() {
        let db = MemoryDatabase::new("db");
        let outcomes = db
            .bulk_docs(vec![replicated("a", "2-q", RevisionHistory::from_rev("1-x").unwrap())])
            .unwrap();
        assert!(matches!(outcomes[0], WriteOutcome::Rejected(_)));
    }

    #[test]
    fn test_conflicting_leaves_pick_deterministic_winner() {
        let db = MemoryDatabase::new("db");
        db.bulk_docs(vec![
            replicated("a", "1-a", RevisionHistory::from_rev("1-a").unwrap()),
            replicated("a", "1-b", RevisionHistory::from_rev("1-b").unwrap()),
        ])
        .unwrap();
        assert_eq!(db.get("a").unwrap().rev, "1-b");
    }

    #[tokio::test]
    async fn test_diff_reports_missing() {
        let db = MemoryDatabase::new("db");
        let rev = db.put("a", json!({})).unwrap();

        let missing = db
            .diff(vec![
                RevisionRequest::new("a", vec![rev.clone(), "2-zz".into()]),
                RevisionRequest::new("b", vec!["1-q".into()]),
            ])
            .await
            .unwrap();
        assert_eq!(missing.get("a"), Some(&vec!["2-zz".to_string()]));
        assert_eq!(missing.get("b"), Some(&vec!["1-q".to_string()]));

        let none = db.diff(vec![RevisionRequest::new("a", vec![rev])]).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_returns_per_revision_results() {
        let db = MemoryDatabase::new("db");
        let rev = db.put("a", json!({"k": "v"})).unwrap();
        let docs = db
            .fetch(vec![RevisionRequest::new("a", vec![rev.clone(), "9-nope".into()])])
            .await
            .unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].as_ref().unwrap().rev, rev);
        assert!(docs[1].is_err());
    }

    #[tokio::test]
    async fn test_destroy_notifies_and_fails_operations() {
        let db = MemoryDatabase::new("db");
        let mut rx = DatabaseHandle::destroyed(&db);
        assert_eq!(db.destroyed_listener_count(), 1);

        db.destroy();
        assert!(rx.recv().await.is_ok());
        assert!(db.is_destroyed());
        assert!(matches!(
            db.changes_since(0, 10).await,
            Err(ReplicationError::Destroyed { .. })
        ));
        assert!(db.put("a", json!({})).is_err());
    }

    #[tokio::test]
    async fn test_updates_notify_subscribers() {
        let db = MemoryDatabase::new("db");
        let mut rx = db.subscribe();
        assert_eq!(db.change_listener_count(), 1);

        db.put("a", json!({})).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 1);

        drop(rx);
        assert_eq!(db.change_listener_count(), 0);
    }
}
