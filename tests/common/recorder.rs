//! Records every event a session emits, in order.

use doc_replication::{EventKind, ReplicationEvent, ReplicationHandle};
use std::sync::{Arc, Mutex};

/// What a test needs to know about one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    Active,
    Paused { error: bool },
    Change { docs_written: usize },
    Complete { cancelled: bool },
    Error(String),
    Cancel,
}

impl Recorded {
    fn from_event(event: &ReplicationEvent) -> Self {
        match event {
            ReplicationEvent::Active => Recorded::Active,
            ReplicationEvent::Paused(error) => Recorded::Paused { error: error.is_some() },
            ReplicationEvent::Change(info) => Recorded::Change {
                docs_written: info.docs_written,
            },
            ReplicationEvent::Complete(summary) => Recorded::Complete {
                cancelled: summary.is_cancelled(),
            },
            ReplicationEvent::Error(e) => Recorded::Error(e.kind().to_string()),
            ReplicationEvent::Cancel => Recorded::Cancel,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Recorded::Active => EventKind::Active,
            Recorded::Paused { .. } => EventKind::Paused,
            Recorded::Change { .. } => EventKind::Change,
            Recorded::Complete { .. } => EventKind::Complete,
            Recorded::Error(_) => EventKind::Error,
            Recorded::Cancel => EventKind::Cancel,
        }
    }
}

/// Listens to every event kind on a handle.
#[derive(Clone, Default)]
pub struct EventRecorder {
    events: Arc<Mutex<Vec<Recorded>>>,
}

impl EventRecorder {
    /// Attach to every event kind. Adds one listener per kind.
    pub fn attach(handle: &ReplicationHandle) -> Self {
        let recorder = Self::default();
        for kind in EventKind::ALL {
            let events = Arc::clone(&recorder.events);
            handle.on(kind, move |event| {
                events.lock().unwrap().push(Recorded::from_event(event));
            });
        }
        recorder
    }

    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events().iter().filter(|e| e.kind() == kind).count()
    }

    /// Error flags of every `paused` event, in order.
    pub fn paused_errors(&self) -> Vec<bool> {
        self.events()
            .iter()
            .filter_map(|e| match e {
                Recorded::Paused { error } => Some(*error),
                _ => None,
            })
            .collect()
    }

    pub fn docs_written(&self) -> usize {
        self.events()
            .iter()
            .map(|e| match e {
                Recorded::Change { docs_written } => *docs_written,
                _ => 0,
            })
            .sum()
    }

    /// `active` never fires twice without a `paused` in between.
    pub fn active_alternates_with_paused(&self) -> bool {
        let mut active = false;
        for event in self.events() {
            match event {
                Recorded::Active if active => return false,
                Recorded::Active => active = true,
                Recorded::Paused { .. } => active = false,
                _ => {}
            }
        }
        true
    }

    /// Exactly one terminal event, and it is the last one recorded.
    pub fn nothing_after_terminal(&self) -> bool {
        let events = self.events();
        let terminal: Vec<usize> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| matches!(e, Recorded::Complete { .. } | Recorded::Error(_)))
            .map(|(i, _)| i)
            .collect();
        terminal.len() == 1 && terminal[0] == events.len() - 1
    }
}
