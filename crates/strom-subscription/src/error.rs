use crate::coordination::CoordinationError;
use crate::storage::StorageError;
use std::time::Duration;
use strom_core::{Cursor, PartitionKey};
use thiserror::Error;

/// Terminal conditions of a streaming session.
///
/// Every unhandled task error is routed into `Closing` with one of these
/// attached; the loop itself never propagates errors upward.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("coordination store unavailable: {0}")]
    CoordinationUnavailable(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("no commit received for partition {partition} within {elapsed:?}")]
    CommitTimeout {
        partition: PartitionKey,
        elapsed: Duration,
    },

    #[error("unprocessable event at {0}")]
    Unprocessable(Cursor),

    #[error("output write failed: {0}")]
    Output(#[from] std::io::Error),

    #[error("event storage failed: {0}")]
    Storage(#[from] StorageError),

    #[error("{0}")]
    Internal(String),
}

impl StreamError {
    /// Stable label for the close-reason metric.
    pub fn reason_label(&self) -> &'static str {
        match self {
            StreamError::AccessDenied(_) => "access_denied",
            StreamError::CoordinationUnavailable(_) => "coordination_unavailable",
            StreamError::SessionNotFound(_) => "session_not_found",
            StreamError::InvalidCursor(_) => "invalid_cursor",
            StreamError::CommitTimeout { .. } => "commit_timeout",
            StreamError::Unprocessable(_) => "unprocessable_event",
            StreamError::Output(_) => "output_failure",
            StreamError::Storage(_) => "storage_failure",
            StreamError::Internal(_) => "internal",
        }
    }
}

impl From<CoordinationError> for StreamError {
    fn from(err: CoordinationError) -> Self {
        match err {
            CoordinationError::Unavailable(msg) => StreamError::CoordinationUnavailable(msg),
            CoordinationError::SessionNotFound(id) => StreamError::SessionNotFound(id),
            CoordinationError::Conflict(msg) => StreamError::Internal(msg),
        }
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(err: serde_json::Error) -> Self {
        StreamError::Internal(format!("serialization failed: {err}"))
    }
}

impl From<strom_core::Error> for StreamError {
    fn from(err: strom_core::Error) -> Self {
        match err {
            strom_core::Error::AccessDenied(msg) => StreamError::AccessDenied(msg),
            strom_core::Error::InvalidCursor(msg) => StreamError::InvalidCursor(msg),
            other => StreamError::Internal(other.to_string()),
        }
    }
}

/// Errors surfaced synchronously to the commit API caller.
///
/// These never reach the streaming loop: a bad commit request is the
/// client's problem, not a reason to tear the session down.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid stream id: {0}")]
    InvalidStreamId(String),

    #[error("cursor partition {0} is not assigned to this stream")]
    PartitionNotOwned(PartitionKey),

    #[error("event type does not belong to subscription: {0}")]
    WrongEventType(String),

    #[error(transparent)]
    Coordination(#[from] CoordinationError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordination_error_mapping() {
        let err: StreamError = CoordinationError::Unavailable("zk down".into()).into();
        assert!(matches!(err, StreamError::CoordinationUnavailable(_)));
        assert_eq!(err.reason_label(), "coordination_unavailable");

        let err: StreamError = CoordinationError::SessionNotFound("s1".into()).into();
        assert!(matches!(err, StreamError::SessionNotFound(_)));
    }

    #[test]
    fn test_reason_labels_are_stable() {
        let err = StreamError::CommitTimeout {
            partition: PartitionKey::new("orders", "0"),
            elapsed: Duration::from_secs(61),
        };
        assert_eq!(err.reason_label(), "commit_timeout");
    }
}
