// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Data model: changes, revisions, documents, batches and checkpoints.
//!
//! # Revision IDs
//!
//! A revision id has the form `"<generation>-<hash>"`, e.g. `"3-a1b2"`.
//! A document's history is carried as a [`RevisionHistory`]: the generation
//! of the newest revision plus the hashes newest-first, so
//! `{ start: 2, ids: ["y", "x"] }` expands to `["2-y", "1-x"]`.
//!
//! ```text
//! ChangeRecord { id: "doc", seq: 42, revisions: [RevisionRef { rev: "2-y", ancestry: ["2-y", "1-x"] }] }
//!                                                   │
//!                     diff against target ──────────┘── missing? fetch + write
//! ```

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Position in a source's changes feed. `0` means "from the beginning".
pub type Sequence = u64;

/// Split a revision id into `(generation, hash)`.
///
/// Returns `None` for anything that is not `<u64 >= 1>-<non-empty hash>`.
pub fn parse_rev(rev: &str) -> Option<(u64, &str)> {
    let (generation, hash) = rev.split_once('-')?;
    let generation: u64 = generation.parse().ok()?;
    if generation == 0 || hash.is_empty() {
        return None;
    }
    Some((generation, hash))
}

/// Total order on revision ids: higher generation wins, ties broken by hash.
///
/// This is the deterministic winner rule used when a document has several
/// leaf revisions. Unparseable ids sort below every valid id.
pub fn compare_revs(a: &str, b: &str) -> Ordering {
    match (parse_rev(a), parse_rev(b)) {
        (Some((ga, ha)), Some((gb, hb))) => ga.cmp(&gb).then_with(|| ha.cmp(hb)),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => a.cmp(b),
    }
}

/// Compact revision history of a document (newest first).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionHistory {
    /// Generation of the newest revision.
    pub start: u64,
    /// Revision hashes, newest first.
    pub ids: Vec<String>,
}

impl RevisionHistory {
    /// History consisting of a single revision.
    pub fn from_rev(rev: &str) -> Option<Self> {
        let (generation, hash) = parse_rev(rev)?;
        Some(Self {
            start: generation,
            ids: vec![hash.to_string()],
        })
    }

    /// Full revision ids, newest first.
    pub fn revs(&self) -> Vec<String> {
        self.ids
            .iter()
            .enumerate()
            .filter_map(|(i, hash)| {
                let generation = self.start.checked_sub(i as u64)?;
                (generation > 0).then(|| format!("{}-{}", generation, hash))
            })
            .collect()
    }

    /// The newest revision id.
    pub fn head(&self) -> Option<String> {
        self.ids.first().map(|hash| format!("{}-{}", self.start, hash))
    }

    /// Extend this history with a new child revision.
    pub fn child(&self, hash: impl Into<String>) -> Self {
        let mut ids = Vec::with_capacity(self.ids.len() + 1);
        ids.push(hash.into());
        ids.extend(self.ids.iter().cloned());
        Self {
            start: self.start + 1,
            ids,
        }
    }
}

/// A reference to one revision of a document, as reported by the changes feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionRef {
    /// Document id.
    pub id: String,
    /// Revision id (`"<generation>-<hash>"`).
    pub rev: String,
    /// Generation parsed from `rev`.
    pub generation: u64,
    /// Revision ids from newest (this one) to oldest.
    pub ancestry: Vec<String>,
}

impl RevisionRef {
    /// Build a reference for a leaf revision with its known ancestry.
    ///
    /// Returns `None` if `rev` is not a valid revision id.
    pub fn new(id: impl Into<String>, rev: impl Into<String>, ancestry: Vec<String>) -> Option<Self> {
        let rev = rev.into();
        let (generation, _) = parse_rev(&rev)?;
        let ancestry = if ancestry.first() == Some(&rev) {
            ancestry
        } else {
            let mut full = Vec::with_capacity(ancestry.len() + 1);
            full.push(rev.clone());
            full.extend(ancestry);
            full
        };
        Some(Self {
            id: id.into(),
            rev,
            generation,
            ancestry,
        })
    }

    /// Build a reference from a document's revision history.
    pub fn from_history(id: impl Into<String>, history: &RevisionHistory) -> Option<Self> {
        let ancestry = history.revs();
        let rev = ancestry.first()?.clone();
        Self::new(id, rev, ancestry)
    }

    /// Whether `other` is this revision or one of its ancestors.
    pub fn descends_from(&self, other: &str) -> bool {
        self.ancestry.iter().any(|r| r == other)
    }
}

/// One unit of source change.
///
/// Immutable once read from the change source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Document id.
    pub id: String,
    /// Sequence at which this change was recorded on the source.
    pub seq: Sequence,
    /// Leaf revisions of the document at `seq`, winner first.
    pub revisions: Vec<RevisionRef>,
    /// Whether the winning revision is a deletion.
    #[serde(default)]
    pub deleted: bool,
}

impl ChangeRecord {
    /// Revision ids of every leaf in this change.
    pub fn revs(&self) -> Vec<String> {
        self.revisions.iter().map(|r| r.rev.clone()).collect()
    }
}

/// A full document body with its revision history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Document id.
    pub id: String,
    /// Revision id of this body.
    pub rev: String,
    /// Revision history (newest first), written verbatim to the target.
    pub revisions: RevisionHistory,
    /// Whether this revision is a deletion marker.
    #[serde(default)]
    pub deleted: bool,
    /// Document content.
    #[serde(default)]
    pub body: serde_json::Value,
}

impl RevisionRequest {
    /// Build a request for one document.
    pub fn new(id: impl Into<String>, revs: Vec<String>) -> Self {
        Self { id: id.into(), revs }
    }
}

/// A document id with a set of revision ids (diff candidates, fetch requests).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionRequest {
    /// Document id.
    pub id: String,
    /// Revision ids (candidates when diffing, missing ones when fetching).
    pub revs: Vec<String>,
}

/// A bounded group of changes processed and checkpointed as a unit.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Changes in feed order.
    pub changes: Vec<ChangeRecord>,
    /// Sequence of the first change.
    pub start_seq: Sequence,
    /// Sequence of the last change; the checkpoint moves here on success.
    pub end_seq: Sequence,
}

impl Batch {
    /// Build a batch from a non-empty window of changes.
    pub fn new(changes: Vec<ChangeRecord>) -> Option<Self> {
        let start_seq = changes.first()?.seq;
        let end_seq = changes.iter().map(|c| c.seq).max().unwrap_or(start_seq);
        Some(Self {
            changes,
            start_seq,
            end_seq,
        })
    }

    /// Number of changes in the batch.
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Whether the batch has no changes.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Durable marker of replication progress for a (source, target) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Source handle id.
    pub source_id: String,
    /// Target handle id.
    pub target_id: String,
    /// Last source sequence whose changes are durably applied to the target.
    pub seq: Sequence,
    /// Session that wrote this checkpoint.
    pub session_id: String,
}
