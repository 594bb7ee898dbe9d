//! Failure-injecting wrapper around [`MemoryDatabase`].
//!
//! Counts every call and fails the ones a configured rule picks, so tests
//! can simulate flaky networks deterministically.

use doc_replication::adapter::{BoxFuture, BulkFetch, BulkWrite, ChangeSource, DatabaseHandle, RevisionDiffer};
use doc_replication::model::RevisionRequest;
use doc_replication::{ChangeRecord, Document, MemoryDatabase, ReplicationError, Sequence, WriteOutcome};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

/// Decides whether the n-th fetch call (1-based) fails, given its requests.
pub type FetchRule = Arc<dyn Fn(usize, &[RevisionRequest]) -> bool + Send + Sync>;

/// Decides whether the n-th write call (1-based) fails, given its documents.
pub type WriteRule = Arc<dyn Fn(usize, &[Document]) -> bool + Send + Sync>;

/// A [`MemoryDatabase`] whose calls can be made to fail.
pub struct FlakyDatabase {
    inner: Arc<MemoryDatabase>,
    fetch_rule: Option<FetchRule>,
    fetch_error: ReplicationError,
    write_rule: Option<WriteRule>,
    /// Fail every call (of any kind) while fewer than this many were made.
    fail_first_calls: usize,
    calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    write_calls: AtomicUsize,
    failures: AtomicUsize,
}

impl FlakyDatabase {
    /// Pass-through wrapper.
    pub fn new(inner: Arc<MemoryDatabase>) -> Self {
        Self {
            inner,
            fetch_rule: None,
            fetch_error: ReplicationError::network("bulk_get", "flunking you"),
            write_rule: None,
            fail_first_calls: 0,
            calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
            write_calls: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        }
    }

    /// Fail fetch calls chosen by `rule`.
    pub fn failing_fetch<F>(inner: Arc<MemoryDatabase>, rule: F) -> Self
    where
        F: Fn(usize, &[RevisionRequest]) -> bool + Send + Sync + 'static,
    {
        Self {
            fetch_rule: Some(Arc::new(rule)),
            ..Self::new(inner)
        }
    }

    /// Fail every `n`-th fetch call, up to and including call `until`.
    pub fn failing_every_nth_fetch(inner: Arc<MemoryDatabase>, n: usize, until: usize) -> Self {
        Self::failing_fetch(inner, move |call, _| call % n == 0 && call <= until)
    }

    /// Fail write calls chosen by `rule` with a network error.
    pub fn failing_write<F>(inner: Arc<MemoryDatabase>, rule: F) -> Self
    where
        F: Fn(usize, &[Document]) -> bool + Send + Sync + 'static,
    {
        Self {
            write_rule: Some(Arc::new(rule)),
            ..Self::new(inner)
        }
    }

    /// Fail the first `count` calls of any kind (an offline start).
    pub fn offline_for(inner: Arc<MemoryDatabase>, count: usize) -> Self {
        Self {
            fail_first_calls: count,
            ..Self::new(inner)
        }
    }

    /// Error returned by failing fetch calls (network error by default).
    pub fn with_fetch_error(mut self, error: ReplicationError) -> Self {
        self.fetch_error = error;
        self
    }

    pub fn inner(&self) -> &Arc<MemoryDatabase> {
        &self.inner
    }

    /// Calls of any kind so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    /// Calls that were made to fail.
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    fn offline(&self, operation: &str) -> Result<(), ReplicationError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.fail_first_calls {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(ReplicationError::network(operation, "flunking you"));
        }
        Ok(())
    }
}

impl DatabaseHandle for FlakyDatabase {
    fn id(&self) -> &str {
        self.inner.name()
    }

    fn destroyed(&self) -> broadcast::Receiver<()> {
        self.inner.destroyed()
    }
}

impl ChangeSource for FlakyDatabase {
    fn changes_since(&self, since: Sequence, limit: usize) -> BoxFuture<'_, Vec<ChangeRecord>> {
        Box::pin(async move {
            self.offline("changes")?;
            self.inner.changes_since(since, limit).await
        })
    }

    fn subscribe(&self) -> watch::Receiver<Sequence> {
        self.inner.subscribe()
    }
}

impl RevisionDiffer for FlakyDatabase {
    fn diff(&self, candidates: Vec<RevisionRequest>) -> BoxFuture<'_, HashMap<String, Vec<String>>> {
        Box::pin(async move {
            self.offline("revs_diff")?;
            self.inner.diff(candidates).await
        })
    }
}

impl BulkFetch for FlakyDatabase {
    fn fetch(&self, requests: Vec<RevisionRequest>) -> BoxFuture<'_, Vec<Result<Document, ReplicationError>>> {
        Box::pin(async move {
            self.offline("bulk_get")?;
            let call = self.fetch_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(rule) = &self.fetch_rule {
                if rule(call, &requests) {
                    self.failures.fetch_add(1, Ordering::SeqCst);
                    return Err(self.fetch_error.clone());
                }
            }
            self.inner.fetch(requests).await
        })
    }
}

impl BulkWrite for FlakyDatabase {
    fn write(&self, docs: Vec<Document>) -> BoxFuture<'_, Vec<WriteOutcome>> {
        Box::pin(async move {
            self.offline("bulk_docs")?;
            let call = self.write_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(rule) = &self.write_rule {
                if rule(call, &docs) {
                    self.failures.fetch_add(1, Ordering::SeqCst);
                    return Err(ReplicationError::network("bulk_docs", "flunking you"));
                }
            }
            self.inner.write(docs).await
        })
    }
}
