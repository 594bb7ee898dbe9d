//! Session state types.
//!
//! Defines the state machine for a replication session.
//!
//! # State Transitions
//!
//! ```text
//!                 first attempt
//! Initializing ─────────────────→ Active ←─────────────┐
//!      │                           │  │                │
//!      │                 caught up │  │ transient      │ new changes /
//!      │                           │  │ failure        │ backoff elapsed
//!      │                           ↓  ↓                │
//!      │        (one-shot) ←── Paused ─────────────────┘
//!      │             │
//!      │             ↓
//!      │         Complete
//!      │
//!      └──── any state ──→ Errored   (fatal failure)
//!                     └──→ Cancelled (cancel observed)
//! ```
//!
//! # State Descriptions
//!
//! - **Initializing**: Session spawned, checkpoint not yet loaded.
//! - **Active**: A batch attempt is in progress.
//! - **Paused**: Caught up and waiting for changes (live), or backing off
//!   after a transient failure.
//! - **Complete**: One-shot session replicated everything.
//! - **Errored**: Fatal failure. The `error` event was the last event.
//! - **Cancelled**: `cancel()` was observed. `cancel` then `complete` were emitted.

use crate::model::Sequence;
use crate::pipeline::ReplicationTotals;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// State of a replication session.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationState {
    /// Spawned; nothing attempted yet.
    Initializing,

    /// Moving a batch from source to target.
    Active,

    /// Idle (live, caught up) or waiting out a backoff delay.
    Paused,

    /// Finished a one-shot replication.
    Complete,

    /// Terminated by a fatal error.
    Errored,

    /// Terminated by cancellation.
    Cancelled,
}

impl ReplicationState {
    /// Whether the session has ended.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReplicationState::Complete | ReplicationState::Errored | ReplicationState::Cancelled
        )
    }
}

impl std::fmt::Display for ReplicationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicationState::Initializing => write!(f, "Initializing"),
            ReplicationState::Active => write!(f, "Active"),
            ReplicationState::Paused => write!(f, "Paused"),
            ReplicationState::Complete => write!(f, "Complete"),
            ReplicationState::Errored => write!(f, "Errored"),
            ReplicationState::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// How a session that did not fail ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionStatus {
    /// Everything replicated (one-shot).
    Completed,
    /// Stopped by `cancel()`.
    Cancelled,
}

/// Payload of the `complete` event and value of the completion future.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicationSummary {
    pub status: CompletionStatus,
    pub session_id: String,
    pub source_id: String,
    pub target_id: String,
    /// Last durable checkpoint.
    pub last_seq: Sequence,
    pub totals: ReplicationTotals,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl ReplicationSummary {
    pub fn is_cancelled(&self) -> bool {
        self.status == CompletionStatus::Cancelled
    }
}
