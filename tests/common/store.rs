//! Checkpoint store that remembers every save.

use doc_replication::checkpoint::CheckpointFuture;
use doc_replication::{Checkpoint, CheckpointStore, MemoryCheckpointStore, Sequence};
use std::sync::{Arc, Mutex};

/// A [`MemoryCheckpointStore`] that logs the sequence of every save.
#[derive(Default)]
pub struct RecordingCheckpointStore {
    inner: MemoryCheckpointStore,
    saves: Arc<Mutex<Vec<Sequence>>>,
}

impl RecordingCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequences saved so far, in order.
    pub fn saves(&self) -> Vec<Sequence> {
        self.saves.lock().unwrap().clone()
    }

    /// Shared view of the save log, for use inside listeners.
    pub fn save_log(&self) -> Arc<Mutex<Vec<Sequence>>> {
        Arc::clone(&self.saves)
    }
}

impl CheckpointStore for RecordingCheckpointStore {
    fn load<'a>(&'a self, source_id: &'a str, target_id: &'a str) -> CheckpointFuture<'a, Option<Checkpoint>> {
        self.inner.load(source_id, target_id)
    }

    fn save<'a>(&'a self, checkpoint: &'a Checkpoint) -> CheckpointFuture<'a, ()> {
        Box::pin(async move {
            self.inner.save(checkpoint).await?;
            self.saves.lock().unwrap().push(checkpoint.seq);
            Ok(())
        })
    }
}
