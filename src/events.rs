// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication events and the listener registry.
//!
//! A session announces its lifecycle through six event kinds:
//!
//! | Kind | Payload | When |
//! |------|---------|------|
//! | `active` | none | A batch attempt begins after init or a pause |
//! | `paused` | `Option<ReplicationError>` | Caught up (None) or backing off (Some) |
//! | `change` | [`ChangeInfo`] | A batch resolved and its checkpoint was saved |
//! | `complete` | [`ReplicationSummary`] | Terminal: finished or cancelled |
//! | `error` | [`ReplicationError`] | Terminal: fatal failure |
//! | `cancel` | none | Cancel was observed (always followed by `complete`) |
//!
//! Listeners are plain callbacks invoked on the session task. They may call
//! back into the handle (`cancel()`, `on()`, `off()`) or into a database
//! without deadlocking: the registry lock is released before dispatch.

use crate::error::ReplicationError;
use crate::pipeline::ChangeInfo;
use crate::replicator::ReplicationSummary;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Event kinds a listener can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Active,
    Paused,
    Change,
    Complete,
    Error,
    Cancel,
}

impl EventKind {
    /// Every kind, in a stable order.
    pub const ALL: [EventKind; 6] = [
        EventKind::Active,
        EventKind::Paused,
        EventKind::Change,
        EventKind::Complete,
        EventKind::Error,
        EventKind::Cancel,
    ];

    /// Event name as used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Active => "active",
            EventKind::Paused => "paused",
            EventKind::Change => "change",
            EventKind::Complete => "complete",
            EventKind::Error => "error",
            EventKind::Cancel => "cancel",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event emitted by a replication session.
#[derive(Debug, Clone)]
pub enum ReplicationEvent {
    Active,
    /// `None` when idle (caught up, live), `Some` when backing off after a failure.
    Paused(Option<ReplicationError>),
    Change(ChangeInfo),
    Complete(ReplicationSummary),
    Error(ReplicationError),
    Cancel,
}

impl ReplicationEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ReplicationEvent::Active => EventKind::Active,
            ReplicationEvent::Paused(_) => EventKind::Paused,
            ReplicationEvent::Change(_) => EventKind::Change,
            ReplicationEvent::Complete(_) => EventKind::Complete,
            ReplicationEvent::Error(_) => EventKind::Error,
            ReplicationEvent::Cancel => EventKind::Cancel,
        }
    }

    /// Whether this event ends the session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReplicationEvent::Complete(_) | ReplicationEvent::Error(_))
    }
}

/// Callback invoked for each matching event.
pub type Listener = Arc<dyn Fn(&ReplicationEvent) + Send + Sync>;

/// Handle returned by [`EventEmitter::on`], used to remove the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: HashMap<EventKind, Vec<(ListenerId, Listener)>>,
}

/// Listener registry with per-kind counts.
#[derive(Default)]
pub struct EventEmitter {
    registry: Mutex<Registry>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a listener for one event kind.
    pub fn on(&self, kind: EventKind, listener: Listener) -> ListenerId {
        let mut registry = self.lock();
        registry.next_id += 1;
        let id = ListenerId(registry.next_id);
        registry.listeners.entry(kind).or_default().push((id, listener));
        id
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut registry = self.lock();
        for listeners in registry.listeners.values_mut() {
            if let Some(pos) = listeners.iter().position(|(lid, _)| *lid == id) {
                listeners.remove(pos);
                return true;
            }
        }
        false
    }

    /// Number of listeners registered for a kind.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.lock().listeners.get(&kind).map(Vec::len).unwrap_or(0)
    }

    /// Number of listeners across every kind.
    pub fn total_listeners(&self) -> usize {
        self.lock().listeners.values().map(Vec::len).sum()
    }

    /// Dispatch an event to every listener of its kind.
    ///
    /// Listeners registered during dispatch first see the next event.
    pub fn emit(&self, event: &ReplicationEvent) {
        let listeners: Vec<Listener> = {
            let registry = self.lock();
            registry
                .listeners
                .get(&event.kind())
                .map(|ls| ls.iter().map(|(_, l)| Arc::clone(l)).collect())
                .unwrap_or_default()
        };
        crate::metrics::record_event(event.kind());
        for listener in listeners {
            listener(event);
        }
    }

    /// Drop every listener (after the terminal event).
    pub fn clear(&self) {
        self.lock().listeners.clear();
    }
}
