// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resilience utilities: backoff schedules and bulkheads.
//!
//! - [`BackoffConfig`]: Exponential backoff with jitter and a cap, for
//!   transient replication failures
//! - [`BackoffFn`]: The pluggable schedule a session actually calls
//! - [`Bulkhead`]: Semaphore to limit concurrent fetch sub-requests
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), doc_replication::resilience::BulkheadFull> {
//! use doc_replication::resilience::{BackoffConfig, Bulkhead};
//! use std::time::Duration;
//!
//! let backoff = BackoffConfig::default().into_fn();
//! let first = backoff(1);
//! assert!(first <= Duration::from_secs(600));
//!
//! // Bulkhead: max 10 concurrent fetches
//! let bulkhead = Bulkhead::new(10);
//! let _permit = bulkhead.acquire().await?;
//! // permit dropped = slot released
//! # Ok(())
//! # }
//! ```

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A backoff schedule: consecutive-failure attempt (1-indexed) to delay.
///
/// Only ever invoked for error pauses, never while a live session idles.
pub type BackoffFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Configuration for the default backoff schedule.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry (before jitter).
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,

    /// Fraction of the computed delay that may be shaved off at random
    /// (0.0 = deterministic, 0.5 = anywhere in [delay/2, delay]).
    pub jitter_fraction: f64,
}

impl Default for BackoffConfig {
    /// Default: 1s doubling up to 10 minutes, half-delay jitter.
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(600),
            backoff_factor: 2.0,
            jitter_fraction: 0.5,
        }
    }
}

impl BackoffConfig {
    /// Long-running live replication: never faster than 1s, capped at 5 minutes.
    ///
    /// # Backoff Schedule (before jitter)
    ///
    /// ```text
    /// Attempt  Delay
    /// -------  -----
    /// 1        1s
    /// 2        2s
    /// 3        4s
    /// ...
    /// 9        256s
    /// 10+      300s
    /// ```
    pub fn daemon() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_factor: 2.0,
            jitter_fraction: 0.5,
        }
    }

    /// Fast, deterministic schedule for tests.
    pub fn testing() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            jitter_fraction: 0.0,
        }
    }

    /// Delay for an attempt before jitter (1-indexed, capped).
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return self.initial_delay.min(self.max_delay);
        }

        let exponent = (attempt - 1).min(i32::MAX as u32) as i32;
        let multiplier = self.backoff_factor.max(1.0).powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let max_secs = self.max_delay.as_secs_f64();

        if !delay_secs.is_finite() || delay_secs >= max_secs {
            self.max_delay
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }

    /// Delay for an attempt with jitter applied.
    ///
    /// Always within `[base * (1 - jitter_fraction), base]`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_for_attempt(attempt);
        let fraction = self.jitter_fraction.clamp(0.0, 1.0);
        if fraction == 0.0 || base.is_zero() {
            return base;
        }
        let shave = rand::thread_rng().gen_range(0.0..=fraction);
        base.mul_f64(1.0 - shave)
    }

    /// Turn this configuration into a [`BackoffFn`].
    pub fn into_fn(self) -> BackoffFn {
        Arc::new(move |attempt| self.delay_for_attempt(attempt))
    }
}

/// A schedule that always returns the same delay.
pub fn constant_backoff(delay: Duration) -> BackoffFn {
    Arc::new(move |_| delay)
}

// =============================================================================
// Bulkhead (Concurrency Limiter)
// =============================================================================

/// Error when bulkhead is closed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("bulkhead full: max {max_concurrent} concurrent operations")]
pub struct BulkheadFull {
    /// Maximum concurrent operations allowed.
    pub max_concurrent: usize,
}

/// Bulkhead pattern: limits concurrent operations to prevent resource exhaustion.
///
/// The batch pipeline uses one per session to keep at most `batches_limit`
/// fetch sub-requests in flight.
#[derive(Debug)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Bulkhead {
    /// Create a new bulkhead with the given concurrency limit (at least 1).
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Acquire a permit, waiting if necessary.
    ///
    /// Returns a permit that releases the slot when dropped.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, BulkheadFull> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BulkheadFull {
                max_concurrent: self.max_concurrent,
            })
    }

}
