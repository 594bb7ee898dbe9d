// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Batch pipeline: pull a window of changes and apply it to the target.
//!
//! # Design
//!
//! ```text
//! changes_since(seq, batch_size) ──▶ Batch
//!                                      │
//!                                      ▼
//!                          diff(candidates) ── nothing missing ──▶ done
//!                                      │
//!                                      ▼
//!               fetch chunks (fetch_chunk_size docs each)
//!               ≤ batches_limit in flight (JoinSet + Bulkhead)
//!                                      │
//!                                      ▼
//!                               write(docs) ──▶ ChangeInfo
//! ```
//!
//! # Failure Aggregation
//!
//! Every sub-request of a batch resolves before the batch is judged. A
//! batch then yields either one [`ChangeInfo`] or one error, never both.
//! When several sub-requests failed, a fatal error wins over a transient
//! one so retries are never spent on a doomed batch.
//!
//! Structural conflicts (the target already holds the revision) count as
//! applied. Documents refused for a non-transient reason are recorded in
//! [`ChangeInfo::errors`] and the batch still completes.

use crate::adapter::{ReplicationSource, ReplicationTarget, WriteOutcome};
use crate::error::{ReplicationError, Result};
use crate::model::{Batch, Document, RevisionRequest, Sequence};
use crate::resilience::Bulkhead;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

/// Configuration for batch processing.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum change records per batch.
    pub batch_size: usize,
    /// Maximum concurrent fetch sub-requests.
    pub batches_limit: usize,
    /// Maximum documents per fetch sub-request.
    pub fetch_chunk_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batches_limit: 10,
            fetch_chunk_size: 50,
        }
    }
}

impl PipelineConfig {
    /// Small batches for testing.
    pub fn testing() -> Self {
        Self {
            batch_size: 10,
            batches_limit: 4,
            fetch_chunk_size: 5,
        }
    }
}

/// A document that could not be replicated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocFailure {
    pub id: String,
    pub rev: String,
    pub reason: String,
}

/// Cumulative counters for a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplicationTotals {
    pub docs_read: usize,
    pub docs_written: usize,
    pub doc_write_failures: usize,
    pub docs_checked: usize,
    pub batches: usize,
}

impl ReplicationTotals {
    /// Fold one committed batch into the totals.
    pub fn record(&mut self, info: &ChangeInfo) {
        self.docs_read += info.docs_read;
        self.docs_written += info.docs_written;
        self.doc_write_failures += info.doc_write_failures;
        self.docs_checked += info.docs_checked;
        self.batches += 1;
    }
}

/// Payload of a `change` event: the outcome of one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeInfo {
    /// Documents fetched from the source.
    pub docs_read: usize,
    /// Documents applied to the target (conflicts included).
    pub docs_written: usize,
    /// Documents the target refused.
    pub doc_write_failures: usize,
    /// Change records examined.
    pub docs_checked: usize,
    /// Per-document failures.
    pub errors: Vec<DocFailure>,
    /// Checkpoint sequence after this batch.
    pub last_seq: Sequence,
    /// Session totals including this batch.
    pub totals: ReplicationTotals,
}

/// Pick the error a failed batch is judged by: first fatal, else first.
fn aggregate(errors: Vec<ReplicationError>) -> Option<ReplicationError> {
    let fatal = errors.iter().position(|e| !e.is_retryable());
    let mut errors = errors;
    match fatal {
        Some(pos) => Some(errors.swap_remove(pos)),
        None => errors.into_iter().next(),
    }
}

/// Moves batches of changes from a source to a target.
pub struct BatchPipeline {
    source: Arc<dyn ReplicationSource>,
    target: Arc<dyn ReplicationTarget>,
    config: PipelineConfig,
    bulkhead: Arc<Bulkhead>,
}

impl BatchPipeline {
    pub fn new(source: Arc<dyn ReplicationSource>, target: Arc<dyn ReplicationTarget>, config: PipelineConfig) -> Self {
        let bulkhead = Arc::new(Bulkhead::new(config.batches_limit));
        Self {
            source,
            target,
            config,
            bulkhead,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Next window of changes after `since`, or `None` when caught up.
    pub async fn next_batch(&self, since: Sequence) -> Result<Option<Batch>> {
        let changes = self.source.changes_since(since, self.config.batch_size.max(1)).await?;
        Ok(Batch::new(changes))
    }

    /// Apply a batch to the target.
    ///
    /// Returns `Err` if any sub-request failed in a way that must fail the
    /// whole batch. `totals` in the result is left empty for the caller.
    #[instrument(skip(self, batch), fields(start_seq = batch.start_seq, end_seq = batch.end_seq, size = batch.len()))]
    pub async fn process(&self, batch: &Batch) -> Result<ChangeInfo> {
        let started = Instant::now();
        let mut info = ChangeInfo {
            docs_checked: batch.len(),
            last_seq: batch.end_seq,
            ..Default::default()
        };

        // Phase 1: which revisions does the target lack?
        let candidates: Vec<RevisionRequest> = batch
            .changes
            .iter()
            .filter(|c| !c.revisions.is_empty())
            .map(|c| RevisionRequest::new(c.id.clone(), c.revs()))
            .collect();
        let mut missing = if candidates.is_empty() {
            HashMap::new()
        } else {
            self.target.diff(candidates).await?
        };

        // Keep feed order; a document can appear only once per batch window
        let requests: Vec<RevisionRequest> = batch
            .changes
            .iter()
            .filter_map(|c| missing.remove(&c.id).map(|revs| RevisionRequest::new(c.id.clone(), revs)))
            .collect();

        if requests.is_empty() {
            debug!(checked = info.docs_checked, "Nothing missing on target");
            crate::metrics::record_batch(&info, started.elapsed());
            return Ok(info);
        }

        // Phase 2: fetch bodies in bounded parallel chunks
        let (docs, fetch_failures) = self.fetch_all(requests).await?;
        info.docs_read = docs.len();
        info.errors.extend(fetch_failures);

        // Phase 3: write
        if !docs.is_empty() {
            let written = self.write_all(docs).await?;
            info.docs_written = written.0;
            info.errors.extend(written.1);
        }
        info.doc_write_failures = info.errors.len();

        if info.doc_write_failures > 0 {
            warn!(failures = info.doc_write_failures, "Some documents were not replicated");
        }
        debug!(
            read = info.docs_read,
            written = info.docs_written,
            failures = info.doc_write_failures,
            "Batch applied"
        );
        crate::metrics::record_batch(&info, started.elapsed());
        Ok(info)
    }

    /// Fetch every missing revision. Transient per-document failures fail
    /// the batch; other per-document failures are returned for recording.
    async fn fetch_all(&self, requests: Vec<RevisionRequest>) -> Result<(Vec<Document>, Vec<DocFailure>)> {
        let chunk_size = self.config.fetch_chunk_size.max(1);
        let mut join_set: JoinSet<(usize, Vec<(String, String)>, Result<Vec<Result<Document>>>)> = JoinSet::new();

        for (index, chunk) in requests.chunks(chunk_size).enumerate() {
            let chunk: Vec<RevisionRequest> = chunk.to_vec();
            let expected: Vec<(String, String)> = chunk
                .iter()
                .flat_map(|r| r.revs.iter().map(move |rev| (r.id.clone(), rev.clone())))
                .collect();
            let source = Arc::clone(&self.source);
            let bulkhead = Arc::clone(&self.bulkhead);

            join_set.spawn(async move {
                let result = match bulkhead.acquire().await {
                    Ok(_permit) => source.fetch(chunk).await,
                    Err(e) => Err(ReplicationError::Internal(e.to_string())),
                };
                (index, expected, result)
            });
        }

        let mut chunks = Vec::new();
        let mut errors = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, expected, Ok(results))) => {
                    if results.len() != expected.len() {
                        errors.push(ReplicationError::Internal(format!(
                            "fetch returned {} results for {} revisions",
                            results.len(),
                            expected.len()
                        )));
                    } else {
                        chunks.push((index, expected, results));
                    }
                }
                Ok((_, _, Err(e))) => errors.push(e),
                Err(e) => errors.push(ReplicationError::Internal(format!("fetch task failed: {}", e))),
            }
        }

        chunks.sort_by_key(|(index, _, _)| *index);
        let mut docs = Vec::new();
        let mut failures = Vec::new();
        for (_, expected, results) in chunks {
            for ((id, rev), result) in expected.into_iter().zip(results) {
                match result {
                    Ok(doc) => docs.push(doc),
                    Err(e) if e.is_retryable() => errors.push(e),
                    Err(e) => {
                        debug!(id = %id, rev = %rev, error = %e, "Revision could not be read");
                        failures.push(DocFailure {
                            id,
                            rev,
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }

        match aggregate(errors) {
            Some(e) => Err(e),
            None => Ok((docs, failures)),
        }
    }

    /// Write documents and count applied ones.
    async fn write_all(&self, docs: Vec<Document>) -> Result<(usize, Vec<DocFailure>)> {
        let keys: Vec<(String, String)> = docs.iter().map(|d| (d.id.clone(), d.rev.clone())).collect();
        let outcomes = self.target.write(docs).await?;
        if outcomes.len() != keys.len() {
            return Err(ReplicationError::Internal(format!(
                "write returned {} outcomes for {} documents",
                outcomes.len(),
                keys.len()
            )));
        }

        let mut applied = 0;
        let mut failures = Vec::new();
        let mut errors = Vec::new();
        for ((id, rev), outcome) in keys.into_iter().zip(outcomes) {
            match outcome {
                WriteOutcome::Written | WriteOutcome::Conflict => applied += 1,
                WriteOutcome::Rejected(reason) => {
                    debug!(id = %id, rev = %rev, reason = %reason, "Target rejected document");
                    failures.push(DocFailure { id, rev, reason });
                }
                WriteOutcome::Failed(e) => errors.push(e),
            }
        }

        match aggregate(errors) {
            Some(e) => Err(e),
            None => Ok((applied, failures)),
        }
    }
}
