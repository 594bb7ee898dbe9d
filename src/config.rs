//! Configuration for a replication session.
//!
//! Options are passed to [`Replicator::new()`](crate::Replicator::new) and can
//! be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use doc_replication::config::ReplicationOptions;
//!
//! let options = ReplicationOptions {
//!     live: true,
//!     retry: true,
//!     batch_size: 20,
//!     ..Default::default()
//! };
//! assert!(options.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationOptions
//! ├── live / retry                 # Keep following changes / retry transient failures
//! ├── batch_size, batches_limit    # Pipeline sizing
//! ├── fetch_chunk_size             # Docs per fetch sub-request
//! ├── heartbeat: "10s"             # Idle re-poll interval
//! ├── max_retries                  # Optional cap on consecutive retries
//! ├── back_off: BackoffSettings    # Default exponential schedule
//! ├── checkpoint: CheckpointConfig # Where progress is persisted
//! └── back_off_function            # Programmatic override (not serialized)
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! live: true
//! retry: true
//! batch_size: 20
//! batches_limit: 10
//! heartbeat: "5s"
//! back_off:
//!   initial_delay_ms: 500
//!   max_delay_ms: 60000
//! checkpoint:
//!   sqlite_path: "/var/lib/app/checkpoints.db"
//! ```

use crate::error::{ReplicationError, Result};
use crate::pipeline::PipelineConfig;
use crate::resilience::{BackoffConfig, BackoffFn};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicationOptions: one per session
// ═══════════════════════════════════════════════════════════════════════════════

/// Options for one replication session.
#[derive(Clone, Serialize, Deserialize)]
pub struct ReplicationOptions {
    /// Keep following the source after catching up.
    #[serde(default)]
    pub live: bool,

    /// Pause and retry on transient failures instead of terminating.
    #[serde(default)]
    pub retry: bool,

    /// Maximum change records per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum concurrent fetch sub-requests within a batch.
    #[serde(default = "default_batches_limit")]
    pub batches_limit: usize,

    /// Maximum documents per fetch sub-request.
    #[serde(default = "default_fetch_chunk_size")]
    pub fetch_chunk_size: usize,

    /// How often an idle live session re-polls the source (humantime).
    #[serde(default = "default_heartbeat")]
    pub heartbeat: String,

    /// Consecutive transient failures tolerated before giving up.
    /// `None` retries forever.
    #[serde(default)]
    pub max_retries: Option<u32>,

    /// Default backoff schedule, used unless `back_off_function` is set.
    #[serde(default)]
    pub back_off: BackoffSettings,

    /// Checkpoint persistence.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Programmatic backoff override: attempt number (1-based) to delay.
    #[serde(skip)]
    pub back_off_function: Option<BackoffFn>,
}

fn default_batch_size() -> usize {
    100
}

fn default_batches_limit() -> usize {
    10
}

fn default_fetch_chunk_size() -> usize {
    50
}

fn default_heartbeat() -> String {
    "10s".to_string()
}

impl Default for ReplicationOptions {
    fn default() -> Self {
        Self {
            live: false,
            retry: false,
            batch_size: default_batch_size(),
            batches_limit: default_batches_limit(),
            fetch_chunk_size: default_fetch_chunk_size(),
            heartbeat: default_heartbeat(),
            max_retries: None,
            back_off: BackoffSettings::default(),
            checkpoint: CheckpointConfig::default(),
            back_off_function: None,
        }
    }
}

impl std::fmt::Debug for ReplicationOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationOptions")
            .field("live", &self.live)
            .field("retry", &self.retry)
            .field("batch_size", &self.batch_size)
            .field("batches_limit", &self.batches_limit)
            .field("fetch_chunk_size", &self.fetch_chunk_size)
            .field("heartbeat", &self.heartbeat)
            .field("max_retries", &self.max_retries)
            .field("back_off", &self.back_off)
            .field("checkpoint", &self.checkpoint)
            .field("back_off_function", &self.back_off_function.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl ReplicationOptions {
    /// Small batches, fast deterministic backoff, in-memory checkpoints.
    pub fn for_testing() -> Self {
        let pipeline = PipelineConfig::testing();
        Self {
            batch_size: pipeline.batch_size,
            batches_limit: pipeline.batches_limit,
            fetch_chunk_size: pipeline.fetch_chunk_size,
            heartbeat: "50ms".to_string(),
            back_off: BackoffSettings::testing(),
            checkpoint: CheckpointConfig::in_memory(),
            ..Default::default()
        }
    }

    /// Builder-style override for the backoff schedule.
    pub fn with_back_off_function<F>(mut self, f: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        self.back_off_function = Some(std::sync::Arc::new(f));
        self
    }

    /// Parse the heartbeat interval.
    pub fn heartbeat_duration(&self) -> Result<Duration> {
        humantime::parse_duration(&self.heartbeat)
            .map_err(|e| ReplicationError::Config(format!("invalid heartbeat {:?}: {}", self.heartbeat, e)))
    }

    /// Reject options a session cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(ReplicationError::Config("batch_size must be > 0".into()));
        }
        if self.batches_limit == 0 {
            return Err(ReplicationError::Config("batches_limit must be > 0".into()));
        }
        if self.fetch_chunk_size == 0 {
            return Err(ReplicationError::Config("fetch_chunk_size must be > 0".into()));
        }
        if self.heartbeat_duration()?.is_zero() {
            return Err(ReplicationError::Config("heartbeat must be non-zero".into()));
        }
        self.back_off.validate()
    }

    /// The backoff function this session uses.
    pub fn backoff_fn(&self) -> BackoffFn {
        match &self.back_off_function {
            Some(f) => f.clone(),
            None => self.back_off.to_backoff_config().into_fn(),
        }
    }

    /// Pipeline sizing derived from these options.
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            batch_size: self.batch_size,
            batches_limit: self.batches_limit,
            fetch_chunk_size: self.fetch_chunk_size,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BackoffSettings: serializable form of BackoffConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Default exponential backoff schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffSettings {
    /// Delay before the first retry.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Ceiling for the exponential schedule.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Multiplier per consecutive failure.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Fraction of each delay that may be shaved off at random.
    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: f64,
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    600_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_jitter_fraction() -> f64 {
    0.5
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
            jitter_fraction: default_jitter_fraction(),
        }
    }
}

impl BackoffSettings {
    /// Matches [`BackoffConfig::testing`].
    pub fn testing() -> Self {
        Self {
            initial_delay_ms: 10,
            max_delay_ms: 100,
            backoff_factor: 2.0,
            jitter_fraction: 0.0,
        }
    }

    pub fn to_backoff_config(&self) -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_factor: self.backoff_factor,
            jitter_fraction: self.jitter_fraction,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(ReplicationError::Config(format!(
                "back_off.max_delay_ms ({}) is below initial_delay_ms ({})",
                self.max_delay_ms, self.initial_delay_ms
            )));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(ReplicationError::Config("back_off.backoff_factor must be >= 1.0".into()));
        }
        if !(0.0..=1.0).contains(&self.jitter_fraction) {
            return Err(ReplicationError::Config("back_off.jitter_fraction must be within [0, 1]".into()));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CheckpointConfig: SQLite checkpoint persistence
// ═══════════════════════════════════════════════════════════════════════════════

/// Where checkpoints live.
///
/// With `sqlite_path` unset (or `enabled = false`) the session keeps its
/// checkpoint in memory and starts from sequence 0 on every run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub sqlite_path: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sqlite_path: None,
        }
    }
}

impl CheckpointConfig {
    /// In-memory only (tests).
    pub fn in_memory() -> Self {
        Self {
            enabled: false,
            sqlite_path: None,
        }
    }

    /// SQLite file at `path`.
    pub fn sqlite(path: impl Into<String>) -> Self {
        Self {
            enabled: true,
            sqlite_path: Some(path.into()),
        }
    }

    /// The path to persist to, if persistence is on.
    pub fn durable_path(&self) -> Option<&str> {
        if self.enabled {
            self.sqlite_path.as_deref()
        } else {
            None
        }
    }
}
