//! Shared test utilities for the replication integration tests.
//!
//! This module provides:
//! - A failure-injecting database wrapper with call counters
//! - An event recorder for asserting on event sequences
//! - A checkpoint store that logs every save

#![allow(dead_code)]

pub mod flaky;
pub mod recorder;
pub mod store;

pub use flaky::*;
pub use recorder::*;
pub use store::*;

use doc_replication::{Document, MemoryDatabase, RevisionHistory};
use serde_json::json;
use std::sync::Arc;

/// A fresh pair of in-memory databases.
pub fn databases() -> (Arc<MemoryDatabase>, Arc<MemoryDatabase>) {
    (Arc::new(MemoryDatabase::new("local")), Arc::new(MemoryDatabase::new("remote")))
}

/// A replicated document with an explicit history (`new_edits = false` style).
pub fn doc_with_history(id: &str, start: u64, ids: &[&str]) -> Document {
    let revisions = RevisionHistory {
        start,
        ids: ids.iter().map(|s| s.to_string()).collect(),
    };
    Document {
        id: id.to_string(),
        rev: revisions.head().unwrap(),
        revisions,
        deleted: false,
        body: json!({}),
    }
}
