//! Error taxonomy
//!
//! Errors are split along retry boundaries: validation and contract
//! violations are never retried, transient network failures are retried
//! with backoff inside the stream consumer, and store failures are fatal
//! to the operation that hit them (no progress can be recorded without
//! the store).

use thiserror::Error;

use crate::session::Status;

/// Errors produced by the orchestrator core.
#[derive(Debug, Error)]
pub enum ResearchError {
    /// Malformed request: bad parent reference, invalid depth/breadth.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Session id does not exist in the store.
    #[error("session {0} not found")]
    NotFound(i64),

    /// Out-of-order status update. A programming-contract violation,
    /// fatal to the operation attempting it.
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: Status, to: Status },

    /// Recoverable stream interruption. Retried with bounded backoff.
    #[error("transient network failure: {0}")]
    TransientNetwork(String),

    /// Retry budget spent without reaching the completion marker.
    #[error("stream exhausted after {attempts} reconnect attempts")]
    StreamExhausted { attempts: u32 },

    /// The stream dropped before the service announced an interaction
    /// id. There is no cursor to resume from, and reopening could start
    /// a second background interaction, so this is not retried.
    #[error("stream dropped before an interaction id was announced")]
    InteractionNotStarted,

    /// Structural rejection from the research service. Never retried.
    #[error("research service rejected the request: {0}")]
    ServiceRejected(String),

    /// A detached background process died without reaching a terminal
    /// status. Detected by liveness reconciliation.
    #[error("background process {0} terminated unexpectedly")]
    ProcessCrash(i32),

    #[error("session store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ResearchError {
    /// Transient errors are the only ones the stream consumer retries.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientNetwork(_))
    }
}

pub type Result<T> = std::result::Result<T, ResearchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ResearchError::TransientNetwork("reset".into()).is_transient());
        assert!(!ResearchError::Validation("bad".into()).is_transient());
        assert!(!ResearchError::ServiceRejected("400".into()).is_transient());
    }

    #[test]
    fn test_display_includes_reason() {
        let err = ResearchError::InvalidTransition {
            from: Status::Done,
            to: Status::Streaming,
        };
        assert!(err.to_string().contains("done"));
        assert!(err.to_string().contains("streaming"));
    }
}
