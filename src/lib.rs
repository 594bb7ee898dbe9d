//! # Document Replication
//!
//! Live, fault-tolerant replication of revisioned documents from a source
//! database to a target database.
//!
//! ## Architecture
//!
//! A session moves the source's changes feed to the target in batches,
//! checkpointing after each one, and keeps going across transient failures:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                          replication session                              │
//! │                                                                           │
//! │  ┌─────────────┐    ┌──────────────┐    ┌──────────────────────────────┐  │
//! │  │ ChangeSource│───►│ BatchPipeline│───►│ diff → fetch (bulkhead) →    │  │
//! │  │ (changes)   │    │ (windows)    │    │ write with history           │  │
//! │  └─────────────┘    └──────────────┘    └──────────────────────────────┘  │
//! │         ▲                                            │                    │
//! │         │ LiveFeed (idle)                            ▼                    │
//! │  ┌─────────────┐    ┌──────────────┐    ┌─────────────────────────┐       │
//! │  │ Retry       │◄───│ failures     │    │ CheckpointStore (SQLite)│       │
//! │  │ Controller  │    │ (classified) │    │ then `change` event     │       │
//! │  └─────────────┘    └──────────────┘    └─────────────────────────┘       │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Events
//!
//! Sessions report `active`, `paused`, `change`, `complete`, `error` and
//! `cancel` through a [`ReplicationHandle`]. Transient failures only ever show
//! up as `paused(error)`; `error` is reserved for fatal ones.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use doc_replication::{MemoryDatabase, ReplicationOptions, Replicator};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let local = Arc::new(MemoryDatabase::new("local"));
//!     let remote = Arc::new(MemoryDatabase::new("remote"));
//!
//!     let options = ReplicationOptions {
//!         live: true,
//!         retry: true,
//!         ..Default::default()
//!     };
//!     let handle = Replicator::new(remote, local, options).start();
//!     handle.on_paused(|err| {
//!         if err.is_none() {
//!             println!("up to date");
//!         }
//!     });
//!
//!     // Runs until cancelled
//!     handle.cancel();
//!     handle.await.expect("replication failed");
//! }
//! ```

pub mod adapter;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod events;
pub mod feed;
pub mod memory;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod replicator;
pub mod resilience;
pub mod retry;

// Re-exports for convenience
pub use adapter::{
    BulkFetch, BulkWrite, ChangeSource, DatabaseHandle, ReplicationSource, ReplicationTarget, RevisionDiffer,
    WriteOutcome,
};
pub use checkpoint::{CheckpointStore, MemoryCheckpointStore, SqliteCheckpointStore};
pub use config::{BackoffSettings, CheckpointConfig, ReplicationOptions};
pub use error::{ErrorClass, ReplicationError, Result};
pub use events::{EventKind, ListenerId, ReplicationEvent};
pub use memory::MemoryDatabase;
pub use model::{Batch, ChangeRecord, Checkpoint, Document, RevisionHistory, Sequence};
pub use pipeline::{ChangeInfo, DocFailure, ReplicationTotals};
pub use replicator::{
    replicate, CompletionStatus, ReplicationHandle, ReplicationState, ReplicationSummary, Replicator,
};
pub use resilience::{BackoffConfig, BackoffFn};
