// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Collaborator traits: what the engine needs from source and target stores.
//!
//! The engine never talks to a storage engine or a transport directly. It
//! drives these narrow interfaces, which lets the same replication loop run
//! against an in-process store ([`MemoryDatabase`](crate::memory::MemoryDatabase)),
//! an HTTP client, or a test double that injects failures.
//!
//! ```text
//!   source                                   target
//! ┌──────────────┐   changes_since    ┌──────────────────┐
//! │ ChangeSource │ ─────────────────► │                  │
//! │  + subscribe │       diff         │  RevisionDiffer  │
//! │              │ ◄───────────────── │                  │
//! │  BulkFetch   │      fetch         │                  │
//! │              │ ─────────────────► │  BulkWrite       │
//! └──────────────┘                    └──────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use doc_replication::adapter::{BoxFuture, DatabaseHandle, RevisionDiffer};
//! use doc_replication::model::RevisionRequest;
//! use std::collections::HashMap;
//! use tokio::sync::broadcast;
//!
//! struct EmptyTarget {
//!     destroyed: broadcast::Sender<()>,
//! }
//!
//! impl DatabaseHandle for EmptyTarget {
//!     fn id(&self) -> &str {
//!         "empty"
//!     }
//!
//!     fn destroyed(&self) -> broadcast::Receiver<()> {
//!         self.destroyed.subscribe()
//!     }
//! }
//!
//! impl RevisionDiffer for EmptyTarget {
//!     fn diff(&self, candidates: Vec<RevisionRequest>) -> BoxFuture<'_, HashMap<String, Vec<String>>> {
//!         // An empty target is missing everything
//!         Box::pin(async move {
//!             Ok(candidates.into_iter().map(|c| (c.id, c.revs)).collect())
//!         })
//!     }
//! }
//! ```

use crate::error::{ReplicationError, Result};
use crate::feed::LiveFeed;
use crate::model::{ChangeRecord, Document, RevisionRequest, Sequence};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Common surface of every source/target handle.
pub trait DatabaseHandle: Send + Sync + 'static {
    /// Stable identifier, used to key checkpoints and label logs.
    fn id(&self) -> &str;

    /// Subscribe to the handle's "destroyed" notification.
    ///
    /// A session subscribes exactly once per handle and keeps the receiver
    /// for its whole lifetime.
    fn destroyed(&self) -> broadcast::Receiver<()>;
}

/// The source's changes feed.
pub trait ChangeSource: DatabaseHandle {
    /// Changes with `seq > since`, in sequence order, at most `limit` of them.
    fn changes_since(&self, since: Sequence, limit: usize) -> BoxFuture<'_, Vec<ChangeRecord>>;

    /// Notifications carrying the source's latest update sequence.
    fn subscribe(&self) -> watch::Receiver<Sequence>;

    /// Open a cancellable live subscription starting after `since`.
    ///
    /// The feed wakes when a change newer than `since` exists or when
    /// `heartbeat` elapses without one.
    fn watch(&self, since: Sequence, heartbeat: Duration) -> LiveFeed {
        LiveFeed::new(self.subscribe(), since, heartbeat)
    }
}

/// Finds which revisions the target is missing.
pub trait RevisionDiffer: DatabaseHandle {
    /// Map of document id to the subset of candidate revisions the target lacks.
    ///
    /// Documents the target already has completely may be omitted.
    fn diff(&self, candidates: Vec<RevisionRequest>) -> BoxFuture<'_, HashMap<String, Vec<String>>>;
}

/// Fetches full document bodies from the source.
pub trait BulkFetch: DatabaseHandle {
    /// One entry per requested revision, in request order.
    fn fetch(&self, requests: Vec<RevisionRequest>) -> BoxFuture<'_, Vec<Result<Document>>>;
}

/// Per-document result of a bulk write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The revision was stored.
    Written,
    /// The target already holds this revision (or a newer one). Not an error.
    Conflict,
    /// The target refused this document (validation, forbidden). Recorded
    /// as a per-document failure; the batch still completes.
    Rejected(String),
    /// The write failed; classified like any other error.
    Failed(ReplicationError),
}

impl WriteOutcome {
    /// Whether the document ended up applied on the target.
    pub fn is_applied(&self) -> bool {
        matches!(self, WriteOutcome::Written | WriteOutcome::Conflict)
    }
}

/// Writes documents (with their revision history) to the target.
pub trait BulkWrite: DatabaseHandle {
    /// One outcome per document, in input order.
    fn write(&self, docs: Vec<Document>) -> BoxFuture<'_, Vec<WriteOutcome>>;
}

/// Everything a replication source must provide.
pub trait ReplicationSource: ChangeSource + BulkFetch {}

impl<T: ChangeSource + BulkFetch> ReplicationSource for T {}

/// Everything a replication target must provide.
pub trait ReplicationTarget: RevisionDiffer + BulkWrite {}

impl<T: RevisionDiffer + BulkWrite> ReplicationTarget for T {}
