// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Session lifecycle (events emitted, state)
//! - Batch processing stats
//! - Pauses and retries
//! - Checkpoint persistence
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! No recorder is installed here; the embedding application decides where
//! metrics go.

use crate::events::EventKind;
use crate::pipeline::ChangeInfo;
use crate::replicator::ReplicationState;
use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record an event dispatched to listeners.
pub fn record_event(kind: EventKind) {
    counter!("replication_events_total", "event" => kind.as_str()).increment(1);
}

/// Record a resolved batch.
pub fn record_batch(info: &ChangeInfo, duration: Duration) {
    counter!("replication_batches_total").increment(1);
    counter!("replication_docs_checked_total").increment(info.docs_checked as u64);
    counter!("replication_docs_read_total").increment(info.docs_read as u64);
    counter!("replication_docs_written_total").increment(info.docs_written as u64);

    if info.doc_write_failures > 0 {
        counter!("replication_doc_write_failures_total").increment(info.doc_write_failures as u64);
    }

    histogram!("replication_batch_duration_seconds").record(duration.as_secs_f64());
    histogram!("replication_batch_size").record(info.docs_checked as f64);
}

/// Record a pause. `reason` is `"idle"` or the error kind.
pub fn record_pause(reason: &str) {
    counter!("replication_pauses_total", "reason" => reason.to_string()).increment(1);
}

/// Record a scheduled retry after a transient failure.
pub fn record_retry(attempt: u32, delay: Duration) {
    counter!("replication_retries_total").increment(1);
    gauge!("replication_retry_attempt").set(attempt as f64);
    histogram!("replication_retry_delay_seconds").record(delay.as_secs_f64());
}

/// Record a fatal session error by kind.
pub fn record_fatal(error_kind: &str) {
    counter!("replication_fatal_errors_total", "error_type" => error_kind.to_string()).increment(1);
}

/// Record a durable checkpoint save.
pub fn record_checkpoint_saved(seq: u64) {
    counter!("replication_checkpoint_saves_total").increment(1);
    gauge!("replication_checkpoint_seq").set(seq as f64);
}

/// Record checkpoint SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn record_checkpoint_busy_retry(operation: &str) {
    counter!("replication_checkpoint_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Record a session's state, labelled by session so concurrent sessions
/// each keep their own series.
pub fn record_session_state(session_id: &str, state: ReplicationState) {
    let value = match state {
        ReplicationState::Initializing => 0.0,
        ReplicationState::Active => 1.0,
        ReplicationState::Paused => 2.0,
        ReplicationState::Complete => 3.0,
        ReplicationState::Errored => 4.0,
        ReplicationState::Cancelled => 5.0,
    };
    gauge!("replication_session_state", "session_id" => session_id.to_string()).set(value);
}

/// Record a session task starting.
pub fn record_session_started() {
    counter!("replication_sessions_started_total").increment(1);
    gauge!("replication_sessions_running").increment(1.0);
}

/// Record a session task ending, whatever the outcome.
pub fn record_session_finished() {
    gauge!("replication_sessions_running").decrement(1.0);
}

#[cfg(test)]
mod tests {
    use super::*;

    // The metrics crate uses global state. Without a recorder installed these
    // calls are no-ops; we only verify that they don't panic.

    #[test]
    fn test_record_event_every_kind() {
        for kind in EventKind::ALL {
            record_event(kind);
        }
    }

    #[test]
    fn test_record_batch() {
        record_batch(&ChangeInfo::default(), Duration::ZERO);
        record_batch(
            &ChangeInfo {
                docs_checked: 20,
                docs_read: 10,
                docs_written: 9,
                doc_write_failures: 1,
                ..Default::default()
            },
            Duration::from_millis(40),
        );
    }

    #[test]
    fn test_record_pause_and_retry() {
        record_pause("idle");
        record_pause("network");
        record_retry(1, Duration::ZERO);
        record_retry(7, Duration::from_secs(64));
    }

    #[test]
    fn test_record_checkpoint() {
        record_checkpoint_saved(0);
        record_checkpoint_saved(u64::MAX);
        record_checkpoint_busy_retry("checkpoint_save");
    }

    #[test]
    fn test_record_session_lifecycle() {
        record_session_started();
        record_session_state("a1", ReplicationState::Active);
        record_session_state("b2", ReplicationState::Paused);
        record_session_state("a1", ReplicationState::Cancelled);
        record_fatal("unauthorized");
        record_session_finished();
    }
}
