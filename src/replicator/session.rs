// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The session task: one per replication.
//!
//! The loop, in order, at every batch boundary:
//! 1. Stop if cancel was requested or a handle was destroyed
//! 2. Pull the next window of changes after the checkpoint
//! 3. Caught up: complete (one-shot) or pause idle and wait on the live feed
//! 4. Otherwise apply the batch, save the checkpoint, emit `change`
//! 5. Any failure goes to the [`RetryController`]: pause under backoff or abort
//!
//! # Cancellation
//!
//! Cancel is cooperative. It is observed at batch boundaries, during backoff
//! sleeps and during idle waits. A batch that was in flight when cancel was
//! requested runs to completion but its result is discarded.

use super::types::{CompletionStatus, ReplicationState, ReplicationSummary};
use super::Shared;
use crate::adapter::{ReplicationSource, ReplicationTarget};
use crate::checkpoint::{Checkpointer, CheckpointStore, MemoryCheckpointStore, SqliteCheckpointStore};
use crate::config::ReplicationOptions;
use crate::error::{ReplicationError, Result};
use crate::events::ReplicationEvent;
use crate::feed::{FeedWake, LiveFeed};
use crate::metrics;
use crate::pipeline::{BatchPipeline, ChangeInfo, ReplicationTotals};
use crate::retry::{RetryController, RetryDecision};
use chrono::{DateTime, Utc};
use futures::future;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::{RecvError, TryRecvError}};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// How the loop ended, before cancel precedence is applied.
#[derive(Debug)]
enum Exit {
    Completed,
    Cancelled,
    Failed(ReplicationError),
}

/// `destroyed` subscriptions for the source and target, taken once.
struct DestroyWatch {
    source_id: String,
    target_id: String,
    source: Option<broadcast::Receiver<()>>,
    target: Option<broadcast::Receiver<()>>,
}

impl DestroyWatch {
    fn new(source: &dyn ReplicationSource, target: &dyn ReplicationTarget) -> Self {
        Self {
            source_id: source.id().to_string(),
            target_id: target.id().to_string(),
            source: Some(source.destroyed()),
            target: Some(target.destroyed()),
        }
    }

    /// Non-blocking check at a batch boundary.
    fn check(&mut self) -> Option<ReplicationError> {
        if poll_destroyed(&mut self.source) {
            return Some(ReplicationError::Destroyed {
                handle: self.source_id.clone(),
            });
        }
        if poll_destroyed(&mut self.target) {
            return Some(ReplicationError::Destroyed {
                handle: self.target_id.clone(),
            });
        }
        None
    }

    /// Resolves when either handle is destroyed.
    async fn fired(&mut self) -> ReplicationError {
        tokio::select! {
            _ = wait_destroyed(&mut self.source) => ReplicationError::Destroyed { handle: self.source_id.clone() },
            _ = wait_destroyed(&mut self.target) => ReplicationError::Destroyed { handle: self.target_id.clone() },
        }
    }
}

fn poll_destroyed(rx: &mut Option<broadcast::Receiver<()>>) -> bool {
    let Some(receiver) = rx.as_mut() else {
        return false;
    };
    match receiver.try_recv() {
        Ok(()) | Err(TryRecvError::Lagged(_)) => true,
        Err(TryRecvError::Empty) => false,
        Err(TryRecvError::Closed) => {
            *rx = None;
            false
        }
    }
}

async fn wait_destroyed(rx: &mut Option<broadcast::Receiver<()>>) {
    if let Some(receiver) = rx.as_mut() {
        match receiver.recv().await {
            Ok(()) | Err(RecvError::Lagged(_)) => return,
            Err(RecvError::Closed) => *rx = None,
        }
    }
    future::pending::<()>().await
}

async fn cancel_requested(rx: &mut watch::Receiver<bool>) {
    let closed = rx.wait_for(|cancelled| *cancelled).await.is_err();
    if closed {
        future::pending::<()>().await
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Publish a failure for a session task that panicked (usually a listener).
///
/// Handles keep `Shared` alive, so without this `completion()` would never
/// resolve. A result already published is left alone.
pub(crate) fn abandon(shared: &Shared, panic: Box<dyn Any + Send>) {
    let message = panic_message(&*panic);
    error!(panic = %message, "Replication task panicked");

    shared.state_tx.send_replace(ReplicationState::Errored);
    metrics::record_session_state(&shared.session_id, ReplicationState::Errored);
    metrics::record_fatal("internal");
    shared.result_tx.send_if_modified(|result| {
        if result.is_some() {
            return false;
        }
        *result = Some(Err(ReplicationError::Internal(format!(
            "replication task panicked: {}",
            message
        ))));
        true
    });
    shared.emitter.clear();
    metrics::record_session_finished();
}

/// A single replication run from `source` to `target`.
pub(crate) struct Session {
    shared: Arc<Shared>,
    source: Arc<dyn ReplicationSource>,
    target: Arc<dyn ReplicationTarget>,
    options: ReplicationOptions,
    store: Option<Arc<dyn CheckpointStore>>,
    totals: ReplicationTotals,
    last_seq: u64,
    started_at: DateTime<Utc>,
}

impl Session {
    pub(crate) fn new(
        shared: Arc<Shared>,
        source: Arc<dyn ReplicationSource>,
        target: Arc<dyn ReplicationTarget>,
        options: ReplicationOptions,
        store: Option<Arc<dyn CheckpointStore>>,
    ) -> Self {
        Self {
            shared,
            source,
            target,
            options,
            store,
            totals: ReplicationTotals::default(),
            last_seq: 0,
            started_at: Utc::now(),
        }
    }

    /// Run to the terminal event and publish the result.
    pub(crate) async fn run(mut self) {
        metrics::record_session_started();
        info!(live = self.options.live, retry = self.options.retry, "Starting replication");

        let exit = self.drive().await;
        let result = self.finish(exit);

        self.shared.result_tx.send_replace(Some(result));
        self.shared.emitter.clear();
        metrics::record_session_finished();
    }

    fn transition(&self, state: ReplicationState) {
        self.shared.state_tx.send_replace(state);
        metrics::record_session_state(&self.shared.session_id, state);
    }

    fn state(&self) -> ReplicationState {
        *self.shared.state_tx.borrow()
    }

    fn emit(&self, event: ReplicationEvent) {
        self.shared.emitter.emit(&event);
    }

    fn is_cancelled(&self) -> bool {
        *self.shared.cancel_tx.borrow()
    }

    /// Emit `active` unless already active.
    fn ensure_active(&self) {
        if self.state() != ReplicationState::Active {
            self.transition(ReplicationState::Active);
            self.emit(ReplicationEvent::Active);
        }
    }

    async fn open_store(&self) -> Result<Arc<dyn CheckpointStore>> {
        if let Some(store) = &self.store {
            return Ok(Arc::clone(store));
        }
        match self.options.checkpoint.durable_path() {
            Some(path) => {
                let store = SqliteCheckpointStore::new(path).await?;
                Ok(Arc::new(store))
            }
            None => Ok(Arc::new(MemoryCheckpointStore::new())),
        }
    }

    async fn drive(&mut self) -> Exit {
        if let Err(e) = self.options.validate() {
            return Exit::Failed(e);
        }
        let heartbeat = match self.options.heartbeat_duration() {
            Ok(h) => h,
            Err(e) => return Exit::Failed(e),
        };
        let store = match self.open_store().await {
            Ok(store) => store,
            Err(e) => return Exit::Failed(e),
        };

        let mut checkpointer = Checkpointer::new(
            store,
            self.source.id(),
            self.target.id(),
            self.shared.session_id.clone(),
        );
        let pipeline = BatchPipeline::new(
            Arc::clone(&self.source),
            Arc::clone(&self.target),
            self.options.pipeline_config(),
        );
        let mut retry = RetryController::new(self.options.retry, self.options.max_retries, self.options.backoff_fn());

        // One subscription per handle for the whole session
        let mut destroyed = DestroyWatch::new(&*self.source, &*self.target);
        let mut feed: Option<LiveFeed> = self.options.live.then(|| self.source.watch(0, heartbeat));
        let mut cancel_rx = self.shared.cancel_tx.subscribe();

        let mut loaded = false;
        let mut resuming = true;

        loop {
            if self.is_cancelled() {
                return Exit::Cancelled;
            }
            if let Some(err) = destroyed.check() {
                return Exit::Failed(err);
            }
            if resuming {
                self.ensure_active();
                resuming = false;
            }

            // Everything announced so far is visible to the poll below
            let announced = feed.as_ref().map_or(0, LiveFeed::latest);

            let attempt = self.attempt(&pipeline, &mut checkpointer, &mut loaded).await;
            self.last_seq = checkpointer.current();

            if self.is_cancelled() {
                if let Ok(Some(info)) = &attempt {
                    debug!(last_seq = info.last_seq, "Discarding batch result after cancel");
                }
                return Exit::Cancelled;
            }

            match attempt {
                Ok(Some(mut info)) => {
                    self.totals.record(&info);
                    info.totals = self.totals.clone();
                    retry.on_success();
                    debug!(last_seq = info.last_seq, written = info.docs_written, "Batch committed");
                    self.emit(ReplicationEvent::Change(info));
                }
                Ok(None) => {
                    if !self.options.live {
                        return Exit::Completed;
                    }
                    let Some(feed) = feed.as_mut() else {
                        return Exit::Failed(ReplicationError::Internal("live session without a feed".into()));
                    };

                    if self.state() != ReplicationState::Paused {
                        info!(last_seq = checkpointer.current(), "Caught up, waiting for changes");
                        metrics::record_pause("idle");
                        self.transition(ReplicationState::Paused);
                        self.emit(ReplicationEvent::Paused(None));
                    }

                    // The source may announce sequences that never show up in
                    // its feed (purges, non-document updates)
                    feed.rebind(checkpointer.current().max(announced));
                    tokio::select! {
                        biased;
                        _ = cancel_requested(&mut cancel_rx) => return Exit::Cancelled,
                        err = destroyed.fired() => return Exit::Failed(err),
                        wake = feed.wait() => match wake {
                            FeedWake::Changed(seq) => debug!(seq, "Source changed"),
                            FeedWake::Heartbeat => debug!("Heartbeat, re-polling source"),
                            FeedWake::Closed => {
                                return Exit::Failed(ReplicationError::Destroyed {
                                    handle: self.source.id().to_string(),
                                });
                            }
                        },
                    }
                }
                Err(err) => match retry.on_failure(err) {
                    RetryDecision::Pause { delay, error } => {
                        let retry_attempt = retry.state().attempt;
                        warn!(
                            error = %error,
                            attempt = retry_attempt,
                            delay_ms = delay.as_millis() as u64,
                            "Batch failed, pausing before retry"
                        );
                        metrics::record_pause(error.kind());
                        metrics::record_retry(retry_attempt, delay);
                        self.transition(ReplicationState::Paused);
                        self.emit(ReplicationEvent::Paused(Some(error)));

                        if let Some(exit) = self.backoff(delay, &mut cancel_rx, &mut destroyed).await {
                            return exit;
                        }
                        retry.on_resume();
                        resuming = true;
                    }
                    RetryDecision::Abort(error) => return Exit::Failed(error),
                },
            }
        }
    }

    /// One batch attempt: next window, apply, save checkpoint.
    ///
    /// `Ok(None)` means caught up. The returned info has no totals yet.
    async fn attempt(
        &self,
        pipeline: &BatchPipeline,
        checkpointer: &mut Checkpointer,
        loaded: &mut bool,
    ) -> Result<Option<ChangeInfo>> {
        if !*loaded {
            let since = checkpointer.load().await?;
            info!(since, "Loaded checkpoint");
            *loaded = true;
        }

        let Some(batch) = pipeline.next_batch(checkpointer.current()).await? else {
            return Ok(None);
        };
        self.ensure_active();

        let info = pipeline.process(&batch).await?;
        if self.is_cancelled() {
            return Ok(Some(info));
        }
        checkpointer.advance(info.last_seq).await?;
        Ok(Some(info))
    }

    /// Sleep out a backoff delay. `Some` ends the session.
    async fn backoff(
        &self,
        delay: Duration,
        cancel_rx: &mut watch::Receiver<bool>,
        destroyed: &mut DestroyWatch,
    ) -> Option<Exit> {
        tokio::select! {
            biased;
            _ = cancel_requested(cancel_rx) => Some(Exit::Cancelled),
            err = destroyed.fired() => Some(Exit::Failed(err)),
            _ = tokio::time::sleep(delay) => None,
        }
    }

    /// Apply cancel precedence and dispatch the terminal event(s).
    fn finish(&mut self, exit: Exit) -> Result<ReplicationSummary> {
        let exit = match exit {
            Exit::Failed(err) if self.is_cancelled() => {
                debug!(error = %err, "Discarding error observed after cancel");
                Exit::Cancelled
            }
            Exit::Completed if self.is_cancelled() => Exit::Cancelled,
            other => other,
        };

        match exit {
            Exit::Completed => {
                self.transition(ReplicationState::Complete);
                let summary = self.summary(CompletionStatus::Completed);
                info!(
                    last_seq = summary.last_seq,
                    docs_written = summary.totals.docs_written,
                    "Replication complete"
                );
                self.emit(ReplicationEvent::Complete(summary.clone()));
                Ok(summary)
            }
            Exit::Cancelled => {
                self.transition(ReplicationState::Cancelled);
                let summary = self.summary(CompletionStatus::Cancelled);
                info!(last_seq = summary.last_seq, "Replication cancelled");
                self.emit(ReplicationEvent::Cancel);
                self.emit(ReplicationEvent::Complete(summary.clone()));
                Ok(summary)
            }
            Exit::Failed(err) => {
                self.transition(ReplicationState::Errored);
                error!(error = %err, kind = err.kind(), "Replication failed");
                metrics::record_fatal(err.kind());
                self.emit(ReplicationEvent::Error(err.clone()));
                Err(err)
            }
        }
    }

    fn summary(&self, status: CompletionStatus) -> ReplicationSummary {
        ReplicationSummary {
            status,
            session_id: self.shared.session_id.clone(),
            source_id: self.shared.source_id.clone(),
            target_id: self.shared.target_id.clone(),
            last_seq: self.last_seq,
            totals: self.totals.clone(),
            start_time: self.started_at,
            end_time: Utc::now(),
        }
    }
}
