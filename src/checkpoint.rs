// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Checkpoint persistence for replication progress.
//!
//! A checkpoint records the last source sequence whose changes were durably
//! applied to the target. Restarting a replication for the same
//! (source, target) pair resumes from that sequence.
//!
//! # Write-Through
//!
//! `save()` is the durability boundary: a batch's `change` event is only
//! emitted after `save()` returned `Ok`. Saves therefore go straight to disk,
//! with the in-memory cache updated only once the write succeeded.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. We handle this with:
//! - Automatic retry with exponential backoff
//! - Configurable max retries (default 5)
//!
//! A save that still fails surfaces as [`ReplicationError::Checkpoint`],
//! which is transient: the session pauses and re-runs the batch.
//!
//! ## Checkpoint Semantics
//!
//! ```text
//! write batch 41..60 → target acks → save checkpoint 60 → emit change
//!                                    (crash here = re-run 41..60, idempotent)
//! ```

use crate::error::{ReplicationError, Result};
use crate::model::{Checkpoint, Sequence};
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Length of a replication id in hex characters.
const REPLICATION_ID_LEN: usize = 32;

/// Boxed future returned by [`CheckpointStore`] methods.
pub type CheckpointFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Stable key for a (source, target) pair.
///
/// Hex SHA-256 of `source_id \0 target_id`, truncated. Direction matters:
/// A→B and B→A get different ids.
pub fn replication_id(source_id: &str, target_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(target_id.as_bytes());
    let mut id = hex::encode(hasher.finalize());
    id.truncate(REPLICATION_ID_LEN);
    id
}

/// Durable storage for checkpoints.
pub trait CheckpointStore: Send + Sync + 'static {
    /// Last saved checkpoint for the pair, if any.
    fn load<'a>(&'a self, source_id: &'a str, target_id: &'a str) -> CheckpointFuture<'a, Option<Checkpoint>>;

    /// Persist a checkpoint. Returns only once it is durable.
    fn save<'a>(&'a self, checkpoint: &'a Checkpoint) -> CheckpointFuture<'a, ()>;
}

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::record_checkpoint_busy_retry(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(operation = operation_name, attempts, "SQLite busy, max retries exceeded");
                }
                return Err(e);
            }
        }
    }
}

/// Checkpoint storage backed by SQLite.
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
    /// Replication id -> last saved checkpoint
    cache: Arc<RwLock<HashMap<String, Checkpoint>>>,
    path: String,
}

impl SqliteCheckpointStore {
    /// Open (or create) a checkpoint database at the given path.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Initializing checkpoint store");

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
            .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                replication_id TEXT PRIMARY KEY,
                source_id TEXT NOT NULL,
                target_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                session_id TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let rows: Vec<(String, String, String, i64, String)> = sqlx::query_as(
            "SELECT replication_id, source_id, target_id, seq, session_id FROM checkpoints",
        )
        .fetch_all(&pool)
        .await?;

        let mut cache = HashMap::new();
        for (rep_id, source_id, target_id, seq, session_id) in rows {
            debug!(replication_id = %rep_id, seq, "Loaded checkpoint from disk");
            cache.insert(
                rep_id,
                Checkpoint {
                    source_id,
                    target_id,
                    seq: seq.max(0) as Sequence,
                    session_id,
                },
            );
        }

        if !cache.is_empty() {
            info!(count = cache.len(), "Restored checkpoints from previous run");
        }

        Ok(Self {
            pool,
            cache: Arc::new(RwLock::new(cache)),
            path: path_str,
        })
    }

    async fn load_cached(&self, source_id: &str, target_id: &str) -> Option<Checkpoint> {
        let key = replication_id(source_id, target_id);
        self.cache.read().await.get(&key).cloned()
    }

    async fn save_durable(&self, checkpoint: &Checkpoint) -> Result<()> {
        let key = replication_id(&checkpoint.source_id, &checkpoint.target_id);
        let seq = i64::try_from(checkpoint.seq)
            .map_err(|_| ReplicationError::checkpoint("save", format!("sequence {} out of range", checkpoint.seq)))?;
        let now = chrono::Utc::now().timestamp_millis();
        let pool = &self.pool;

        execute_with_retry("checkpoint_save", || async {
            sqlx::query(
                r#"
                INSERT INTO checkpoints (replication_id, source_id, target_id, seq, session_id, updated_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(replication_id) DO UPDATE SET
                    seq = excluded.seq,
                    session_id = excluded.session_id,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&key)
            .bind(&checkpoint.source_id)
            .bind(&checkpoint.target_id)
            .bind(seq)
            .bind(&checkpoint.session_id)
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;

        self.cache.write().await.insert(key, checkpoint.clone());
        debug!(seq = checkpoint.seq, "Checkpoint persisted");
        Ok(())
    }

    /// Delete the checkpoint for a pair (forces a full re-replication).
    pub async fn delete(&self, source_id: &str, target_id: &str) -> Result<()> {
        let key = replication_id(source_id, target_id);
        self.cache.write().await.remove(&key);

        let pool = &self.pool;
        execute_with_retry("checkpoint_delete", || async {
            sqlx::query("DELETE FROM checkpoints WHERE replication_id = ?")
                .bind(&key)
                .execute(pool)
                .await
        })
        .await?;

        info!(source = %source_id, target = %target_id, "Deleted checkpoint");
        Ok(())
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to main database.
    pub async fn wal_checkpoint(&self) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("checkpoint_wal", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Checkpoint the WAL and close the pool.
    pub async fn close(&self) {
        if let Err(e) = self.wal_checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Checkpoint store closed");
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn load<'a>(&'a self, source_id: &'a str, target_id: &'a str) -> CheckpointFuture<'a, Option<Checkpoint>> {
        Box::pin(async move { Ok(self.load_cached(source_id, target_id).await) })
    }

    fn save<'a>(&'a self, checkpoint: &'a Checkpoint) -> CheckpointFuture<'a, ()> {
        Box::pin(self.save_durable(checkpoint))
    }
}

/// In-memory checkpoint store (non-durable; tests and ephemeral sessions).
#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: RwLock<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored checkpoints.
    pub async fn len(&self) -> usize {
        self.checkpoints.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.checkpoints.read().await.is_empty()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load<'a>(&'a self, source_id: &'a str, target_id: &'a str) -> CheckpointFuture<'a, Option<Checkpoint>> {
        Box::pin(async move {
            let key = replication_id(source_id, target_id);
            Ok(self.checkpoints.read().await.get(&key).cloned())
        })
    }

    fn save<'a>(&'a self, checkpoint: &'a Checkpoint) -> CheckpointFuture<'a, ()> {
        Box::pin(async move {
            let key = replication_id(&checkpoint.source_id, &checkpoint.target_id);
            self.checkpoints.write().await.insert(key, checkpoint.clone());
            Ok(())
        })
    }
}

/// Session-scoped view of a checkpoint store.
///
/// Stamps every save with the session id and never moves the checkpoint
/// backwards. Saving the current sequence again is a successful no-op.
pub struct Checkpointer {
    store: Arc<dyn CheckpointStore>,
    source_id: String,
    target_id: String,
    session_id: String,
    current: Sequence,
}

impl Checkpointer {
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            source_id: source_id.into(),
            target_id: target_id.into(),
            session_id: session_id.into(),
            current: 0,
        }
    }

    /// Load the starting sequence for this pair (`0` if never replicated).
    pub async fn load(&mut self) -> Result<Sequence> {
        let seq = self
            .store
            .load(&self.source_id, &self.target_id)
            .await?
            .map(|c| c.seq)
            .unwrap_or(0);
        self.current = self.current.max(seq);
        Ok(self.current)
    }

    /// Last sequence known to be durable.
    pub fn current(&self) -> Sequence {
        self.current
    }

    /// Advance the checkpoint to `seq`.
    ///
    /// Returns `Ok(false)` when `seq` is not ahead of the current checkpoint.
    pub async fn advance(&mut self, seq: Sequence) -> Result<bool> {
        if seq <= self.current {
            return Ok(false);
        }
        let checkpoint = Checkpoint {
            source_id: self.source_id.clone(),
            target_id: self.target_id.clone(),
            seq,
            session_id: self.session_id.clone(),
        };
        self.store.save(&checkpoint).await?;
        self.current = seq;
        crate::metrics::record_checkpoint_saved(seq);
        Ok(true)
    }
}
