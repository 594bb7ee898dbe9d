// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication sessions.
//!
//! The entry point that ties together:
//! - Change windows and batch transfer via [`crate::pipeline::BatchPipeline`]
//! - Checkpoint persistence via [`crate::checkpoint::CheckpointStore`]
//! - Failure classification and backoff via [`crate::retry::RetryController`]
//! - The live subscription via [`crate::feed::LiveFeed`]
//!
//! # Lifecycle
//!
//! 1. [`Replicator::new`] builds a session; listeners may be attached before it runs
//! 2. [`Replicator::start`] spawns the session task and returns a [`ReplicationHandle`]
//! 3. The handle observes events, reports state and can `cancel()`
//! 4. Awaiting the handle resolves on `complete` and fails on `error`
//!
//! ```rust,no_run
//! use doc_replication::{MemoryDatabase, ReplicationOptions, Replicator};
//! use std::sync::Arc;
//!
//! # async fn example() -> doc_replication::Result<()> {
//! let source = Arc::new(MemoryDatabase::new("source"));
//! let target = Arc::new(MemoryDatabase::new("target"));
//!
//! let handle = Replicator::new(source, target, ReplicationOptions::default()).start();
//! handle.on_change(|info| println!("wrote {} docs", info.docs_written));
//!
//! let summary = handle.await?;
//! println!("done at seq {}", summary.last_seq);
//! # Ok(())
//! # }
//! ```

mod session;
mod types;

pub use types::{CompletionStatus, ReplicationState, ReplicationSummary};

use crate::adapter::{BoxFuture, ReplicationSource, ReplicationTarget};
use crate::checkpoint::CheckpointStore;
use crate::config::ReplicationOptions;
use crate::error::{ReplicationError, Result};
use crate::events::{EventEmitter, EventKind, ListenerId, ReplicationEvent};
use crate::pipeline::ChangeInfo;
use futures::FutureExt;
use session::Session;
use std::future::IntoFuture;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, info_span, Instrument};

/// State shared between the session task and every handle clone.
pub(crate) struct Shared {
    pub(crate) session_id: String,
    pub(crate) source_id: String,
    pub(crate) target_id: String,
    pub(crate) emitter: EventEmitter,
    pub(crate) state_tx: watch::Sender<ReplicationState>,
    pub(crate) cancel_tx: watch::Sender<bool>,
    pub(crate) result_tx: watch::Sender<Option<Result<ReplicationSummary>>>,
}

/// A replication session that has not started yet.
pub struct Replicator {
    source: Arc<dyn ReplicationSource>,
    target: Arc<dyn ReplicationTarget>,
    options: ReplicationOptions,
    store: Option<Arc<dyn CheckpointStore>>,
    shared: Arc<Shared>,
}

impl Replicator {
    /// One-way replication from `source` to `target`.
    pub fn new(
        source: Arc<dyn ReplicationSource>,
        target: Arc<dyn ReplicationTarget>,
        options: ReplicationOptions,
    ) -> Self {
        let (state_tx, _) = watch::channel(ReplicationState::Initializing);
        let (cancel_tx, _) = watch::channel(false);
        let (result_tx, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            session_id: uuid::Uuid::new_v4().simple().to_string(),
            source_id: source.id().to_string(),
            target_id: target.id().to_string(),
            emitter: EventEmitter::new(),
            state_tx,
            cancel_tx,
            result_tx,
        });
        Self {
            source,
            target,
            options,
            store: None,
            shared,
        }
    }

    /// Persist checkpoints in `store` instead of the one `options.checkpoint` describes.
    ///
    /// Sessions sharing a store resume where the previous session for the
    /// same source/target pair stopped.
    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// A handle for attaching listeners before the session runs.
    pub fn handle(&self) -> ReplicationHandle {
        ReplicationHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Spawn the session task.
    ///
    /// Must be called from within a tokio runtime. A panic inside the task
    /// (a listener that panics, say) fails the session with
    /// [`ReplicationError::Internal`] instead of leaving it unresolved.
    pub fn start(self) -> ReplicationHandle {
        let handle = self.handle();
        let span = info_span!(
            "replication",
            source = %self.shared.source_id,
            target = %self.shared.target_id,
            session_id = %self.shared.session_id,
        );
        let shared = Arc::clone(&self.shared);
        let session = Session::new(self.shared, self.source, self.target, self.options, self.store);
        tokio::spawn(
            async move {
                if let Err(panic) = AssertUnwindSafe(session.run()).catch_unwind().await {
                    session::abandon(&shared, panic);
                }
            }
            .instrument(span),
        );
        handle
    }
}

/// Start a one-way replication with default wiring.
pub fn replicate(
    source: Arc<dyn ReplicationSource>,
    target: Arc<dyn ReplicationTarget>,
    options: ReplicationOptions,
) -> ReplicationHandle {
    Replicator::new(source, target, options).start()
}

/// Observer and control surface of a running session.
///
/// Cheap to clone; every clone controls the same session.
#[derive(Clone)]
pub struct ReplicationHandle {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ReplicationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationHandle")
            .field("session_id", &self.shared.session_id)
            .field("source", &self.shared.source_id)
            .field("target", &self.shared.target_id)
            .field("state", &self.state())
            .finish()
    }
}

impl ReplicationHandle {
    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    pub fn source_id(&self) -> &str {
        &self.shared.source_id
    }

    pub fn target_id(&self) -> &str {
        &self.shared.target_id
    }

    /// Listen to every event of one kind.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&ReplicationEvent) + Send + Sync + 'static,
    {
        self.shared.emitter.on(kind, Arc::new(listener))
    }

    pub fn on_active<F>(&self, listener: F) -> ListenerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on(EventKind::Active, move |_| listener())
    }

    /// `None` when caught up, `Some(error)` when backing off.
    pub fn on_paused<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(Option<&ReplicationError>) + Send + Sync + 'static,
    {
        self.on(EventKind::Paused, move |event| {
            if let ReplicationEvent::Paused(error) = event {
                listener(error.as_ref());
            }
        })
    }

    pub fn on_change<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ChangeInfo) + Send + Sync + 'static,
    {
        self.on(EventKind::Change, move |event| {
            if let ReplicationEvent::Change(info) = event {
                listener(info);
            }
        })
    }

    pub fn on_complete<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ReplicationSummary) + Send + Sync + 'static,
    {
        self.on(EventKind::Complete, move |event| {
            if let ReplicationEvent::Complete(summary) = event {
                listener(summary);
            }
        })
    }

    pub fn on_error<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ReplicationError) + Send + Sync + 'static,
    {
        self.on(EventKind::Error, move |event| {
            if let ReplicationEvent::Error(error) = event {
                listener(error);
            }
        })
    }

    pub fn on_cancel<F>(&self, listener: F) -> ListenerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on(EventKind::Cancel, move |_| listener())
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        self.shared.emitter.off(id)
    }

    /// User listeners registered for one kind.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.shared.emitter.listener_count(kind)
    }

    /// User listeners across every kind.
    pub fn total_listeners(&self) -> usize {
        self.shared.emitter.total_listeners()
    }

    /// Request cancellation. Idempotent; a no-op once the session ended.
    pub fn cancel(&self) {
        let first = !self.shared.cancel_tx.send_replace(true);
        if first && !self.state().is_terminal() {
            info!(session_id = %self.shared.session_id, "Cancel requested");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.shared.cancel_tx.borrow()
    }

    /// Current session state.
    pub fn state(&self) -> ReplicationState {
        *self.shared.state_tx.borrow()
    }

    /// Watch state transitions.
    pub fn state_receiver(&self) -> watch::Receiver<ReplicationState> {
        self.shared.state_tx.subscribe()
    }

    /// Resolves once the terminal event has been dispatched.
    ///
    /// `Ok` after `complete` (including cancellation), `Err` after `error`.
    pub async fn completion(&self) -> Result<ReplicationSummary> {
        let mut rx = self.shared.result_tx.subscribe();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(result) => result.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| Err(ReplicationError::Internal("session ended without a result".into())))
    }
}

impl IntoFuture for ReplicationHandle {
    type Output = Result<ReplicationSummary>;
    type IntoFuture = BoxFuture<'static, ReplicationSummary>;

    fn into_future(self) -> Self::IntoFuture {
        async move { self.completion().await }.boxed()
    }
}
