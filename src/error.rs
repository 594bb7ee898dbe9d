// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication engine.
//!
//! Every failure a session can hit is a [`ReplicationError`]. The retry
//! controller only cares about one question: is this transient (pause and
//! try again later) or fatal (end the session with `error`)?
//!
//! # Error Categories
//!
//! | Error Type | Class | Description |
//! |------------|-------|-------------|
//! | `Network` | Transient | Connection refused/reset, transport failure |
//! | `Timeout` | Transient | Request exceeded its deadline |
//! | `ServerBusy` | Transient | 5xx / 429 equivalents |
//! | `Checkpoint` | Transient | Checkpoint load/save failed (re-saving is idempotent) |
//! | `Unauthorized` | Fatal | Authentication or authorization failure |
//! | `BadRequest` | Fatal | Malformed request rejected by a collaborator |
//! | `Config` | Fatal | Replication options are invalid |
//! | `Destroyed` | Fatal | Source or target handle was destroyed |
//! | `InvalidState` | Fatal | State machine violation |
//! | `Cancelled` | Cancel | Session was cancelled; never emitted as `error` |
//! | `Internal` | Fatal | Unexpected internal error |
//!
//! Structural conflicts (the target already holds an equal or newer
//! revision) are not errors at all; see
//! [`WriteOutcome::Conflict`](crate::adapter::WriteOutcome::Conflict).

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// How the retry controller treats an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried under backoff, surfaced only through `paused`.
    Transient,
    /// Aborts the session with a single `error` event.
    Fatal,
    /// Cooperative cancellation; a distinct terminal path.
    Cancellation,
}

/// Errors that can occur during replication.
///
/// Errors are `Clone` so the same value can be handed to every `paused` /
/// `error` listener and to the completion future.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplicationError {
    /// Transport-level failure talking to the source or target.
    #[error("Network error ({operation}): {message}")]
    Network { operation: String, message: String },

    /// A request did not complete in time.
    #[error("Timeout during {operation}")]
    Timeout { operation: String },

    /// The remote side is overloaded (HTTP 5xx/429 equivalents).
    #[error("Server busy ({status}): {message}")]
    ServerBusy { status: u16, message: String },

    /// Checkpoint persistence failed.
    ///
    /// Transient: re-saving the same sequence is idempotent.
    #[error("Checkpoint error ({operation}): {message}")]
    Checkpoint { operation: String, message: String },

    /// Authentication or authorization failure.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// A collaborator rejected a malformed request.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Invalid replication options.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The source or target handle was destroyed mid-session.
    #[error("Database destroyed: {handle}")]
    Destroyed { handle: String },

    /// Engine state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// The session was cancelled.
    #[error("Replication cancelled")]
    Cancelled,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a network error.
    pub fn network(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Network {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Create a checkpoint error.
    pub fn checkpoint(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Checkpoint {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Map an HTTP-style status code onto the taxonomy.
    ///
    /// 401/403 are fatal auth failures, 408 is a timeout, 429 and 5xx are
    /// server-busy, and every other 4xx is a malformed request.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => Self::Unauthorized(message),
            408 => Self::Timeout { operation: message },
            429 | 500..=599 => Self::ServerBusy { status, message },
            _ => Self::BadRequest(format!("status {}: {}", status, message)),
        }
    }

    /// Classify this error for the retry controller.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Network { .. } => ErrorClass::Transient,
            Self::Timeout { .. } => ErrorClass::Transient,
            Self::ServerBusy { .. } => ErrorClass::Transient,
            Self::Checkpoint { .. } => ErrorClass::Transient,
            Self::Unauthorized(_) => ErrorClass::Fatal,
            Self::BadRequest(_) => ErrorClass::Fatal,
            Self::Config(_) => ErrorClass::Fatal,
            Self::Destroyed { .. } => ErrorClass::Fatal,
            Self::InvalidState { .. } => ErrorClass::Fatal,
            Self::Cancelled => ErrorClass::Cancellation,
            Self::Internal(_) => ErrorClass::Fatal,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network { .. } => "network",
            Self::Timeout { .. } => "timeout",
            Self::ServerBusy { .. } => "server_busy",
            Self::Checkpoint { .. } => "checkpoint",
            Self::Unauthorized(_) => "unauthorized",
            Self::BadRequest(_) => "bad_request",
            Self::Config(_) => "config",
            Self::Destroyed { .. } => "destroyed",
            Self::InvalidState { .. } => "invalid_state",
            Self::Cancelled => "cancelled",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<sqlx::Error> for ReplicationError {
    fn from(e: sqlx::Error) -> Self {
        Self::checkpoint("sqlite", e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_is_transient() {
        let err = ReplicationError::network("changes_since", "connection reset");
        assert!(err.is_retryable());
        assert_eq!(err.class(), ErrorClass::Transient);
        assert!(err.to_string().contains("changes_since"));
    }

    #[test]
    fn test_timeout_is_transient() {
        let err = ReplicationError::timeout("bulk_write");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("bulk_write"));
    }

    #[test]
    fn test_checkpoint_is_transient() {
        let err = ReplicationError::checkpoint("save", "disk full");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_sqlx_error_maps_to_checkpoint() {
        let err: ReplicationError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, ReplicationError::Checkpoint { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_fatal_classes() {
        let fatal = [
            ReplicationError::Unauthorized("bad password".into()),
            ReplicationError::BadRequest("missing id".into()),
            ReplicationError::Config("batch_size must be > 0".into()),
            ReplicationError::Destroyed {
                handle: "target".into(),
            },
            ReplicationError::Internal("boom".into()),
        ];
        for err in fatal {
            assert_eq!(err.class(), ErrorClass::Fatal, "{}", err);
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn test_cancelled_is_its_own_class() {
        let err = ReplicationError::Cancelled;
        assert_eq!(err.class(), ErrorClass::Cancellation);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_from_status() {
        assert!(matches!(
            ReplicationError::from_status(401, "nope"),
            ReplicationError::Unauthorized(_)
        ));
        assert!(matches!(
            ReplicationError::from_status(403, "nope"),
            ReplicationError::Unauthorized(_)
        ));
        assert!(ReplicationError::from_status(429, "slow down").is_retryable());
        assert!(ReplicationError::from_status(503, "unavailable").is_retryable());
        assert!(ReplicationError::from_status(408, "timeout").is_retryable());
        assert!(!ReplicationError::from_status(400, "bad json").is_retryable());
    }

    #[test]
    fn test_invalid_state_formatting() {
        let err = ReplicationError::InvalidState {
            expected: "Initializing".to_string(),
            actual: "Complete".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("Initializing"));
        assert!(msg.contains("Complete"));
    }

    #[test]
    fn test_errors_are_clone_and_eq() {
        let err = ReplicationError::network("fetch", "reset");
        assert_eq!(err.clone(), err);
        assert_eq!(err.kind(), "network");
    }
}
