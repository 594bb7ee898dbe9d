// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry controller: decides between pausing under backoff and aborting.
//!
//! ```text
//!   batch failed ──► class()? ── Fatal ──────────────► Abort(error)
//!                        │
//!                   Transient ── retry off ──────────► Abort(error)
//!                        │      max_retries hit ─────► Abort(error)
//!                        │
//!                        └──► attempt += 1
//!                             delay = back_off_function(attempt)
//!                             Pause { delay, error }
//!
//!   batch succeeded ──► attempt = 0
//! ```
//!
//! Idle pauses (a live session that caught up) never reach this module, so
//! the backoff function is only ever called for real failures.

use crate::error::{ErrorClass, ReplicationError};
use crate::resilience::BackoffFn;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Per-session backoff bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackoffState {
    /// Consecutive transient failures since the last successful batch.
    pub attempt: u32,
    /// When the current error pause is scheduled to end.
    pub scheduled_resume_at: Option<Instant>,
}

/// What the session should do after a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Emit `paused(error)`, wait `delay`, then re-attempt the same range.
    Pause { delay: Duration, error: ReplicationError },
    /// Terminate the session with this error.
    Abort(ReplicationError),
}

/// Classifies failures and applies the backoff schedule for one session.
pub struct RetryController {
    retry: bool,
    max_retries: Option<u32>,
    backoff: BackoffFn,
    state: BackoffState,
}

impl RetryController {
    pub fn new(retry: bool, max_retries: Option<u32>, backoff: BackoffFn) -> Self {
        Self {
            retry,
            max_retries,
            backoff,
            state: BackoffState::default(),
        }
    }

    /// Current backoff state.
    pub fn state(&self) -> &BackoffState {
        &self.state
    }

    /// Decide what to do about a failed batch.
    pub fn on_failure(&mut self, error: ReplicationError) -> RetryDecision {
        match error.class() {
            ErrorClass::Transient if self.retry => {
                if let Some(max) = self.max_retries {
                    if self.state.attempt >= max {
                        warn!(attempts = self.state.attempt, max_retries = max, error = %error, "Retries exhausted");
                        return RetryDecision::Abort(error);
                    }
                }
                self.state.attempt = self.state.attempt.saturating_add(1);
                let delay = (self.backoff)(self.state.attempt);
                self.state.scheduled_resume_at = Some(Instant::now() + delay);
                RetryDecision::Pause { delay, error }
            }
            _ => RetryDecision::Abort(error),
        }
    }

    /// The error pause ended; the next batch attempt is starting.
    pub fn on_resume(&mut self) {
        self.state.scheduled_resume_at = None;
    }

    /// A batch resolved fully: reset the failure streak.
    pub fn on_success(&mut self) {
        self.state = BackoffState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn counting_backoff() -> (BackoffFn, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let f: BackoffFn = Arc::new(move |attempt| {
            c.fetch_add(1, Ordering::SeqCst);
            Duration::from_millis(attempt as u64 * 10)
        });
        (f, calls)
    }

    #[test]
    fn test_transient_pauses_with_growing_attempt() {
        let (backoff, calls) = counting_backoff();
        let mut controller = RetryController::new(true, None, backoff);

        let first = controller.on_failure(ReplicationError::network("fetch", "reset"));
        assert!(matches!(first, RetryDecision::Pause { delay, .. } if delay == Duration::from_millis(10)));
        let second = controller.on_failure(ReplicationError::timeout("write"));
        assert!(matches!(second, RetryDecision::Pause { delay, .. } if delay == Duration::from_millis(20)));

        assert_eq!(controller.state().attempt, 2);
        assert!(controller.state().scheduled_resume_at.is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_success_resets_attempt() {
        let (backoff, _) = counting_backoff();
        let mut controller = RetryController::new(true, None, backoff);
        controller.on_failure(ReplicationError::network("fetch", "reset"));
        controller.on_success();
        assert_eq!(controller.state(), &BackoffState::default());

        let next = controller.on_failure(ReplicationError::network("fetch", "reset"));
        assert!(matches!(next, RetryDecision::Pause { delay, .. } if delay == Duration::from_millis(10)));
    }

    #[test]
    fn test_fatal_aborts_without_backoff() {
        let (backoff, calls) = counting_backoff();
        let mut controller = RetryController::new(true, None, backoff);
        let decision = controller.on_failure(ReplicationError::Unauthorized("nope".into()));
        assert!(matches!(decision, RetryDecision::Abort(ReplicationError::Unauthorized(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_retry_disabled_makes_transient_fatal() {
        let (backoff, calls) = counting_backoff();
        let mut controller = RetryController::new(false, None, backoff);
        let decision = controller.on_failure(ReplicationError::network("fetch", "reset"));
        assert!(matches!(decision, RetryDecision::Abort(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_max_retries_cap() {
        let (backoff, _) = counting_backoff();
        let mut controller = RetryController::new(true, Some(2), backoff);
        let err = || ReplicationError::network("fetch", "reset");

        assert!(matches!(controller.on_failure(err()), RetryDecision::Pause { .. }));
        assert!(matches!(controller.on_failure(err()), RetryDecision::Pause { .. }));
        assert!(matches!(controller.on_failure(err()), RetryDecision::Abort(_)));
    }

    #[test]
    fn test_on_resume_clears_schedule() {
        let (backoff, _) = counting_backoff();
        let mut controller = RetryController::new(true, None, backoff);
        controller.on_failure(ReplicationError::network("fetch", "reset"));
        controller.on_resume();
        assert!(controller.state().scheduled_resume_at.is_none());
        assert_eq!(controller.state().attempt, 1);
    }
}
