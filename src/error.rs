//! Error types for the key-value engine.

use crate::types::{Revision, WatchId};
use thiserror::Error;

/// Main error type for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The storage layer failed an I/O operation. Safe to retry only if the
    /// caller knows the operation is idempotent.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(#[from] std::io::Error),

    #[error("revision allocation failed: {0}")]
    RevisionAllocation(String),

    #[error("required revision {requested} has been compacted (compacted at {compacted})")]
    Compacted {
        requested: Revision,
        compacted: Revision,
    },

    #[error("required revision {requested} is a future revision (current is {current})")]
    FutureRevision {
        requested: Revision,
        current: Revision,
    },

    #[error("watch {watch_id} was evicted because it fell behind")]
    SubscriptionLagging { watch_id: WatchId },

    #[error("watch {watch_id} was canceled")]
    WatchCanceled { watch_id: WatchId },

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unknown storage backend: {0}")]
    UnknownBackend(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Invalid data directory format: {0}")]
    InvalidFormat(String),

    #[error("Data directory is locked by another process")]
    Locked,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

impl EngineError {
    /// Whether the caller may retry the failed request.
    ///
    /// The engine never retries internally.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::BackendUnavailable(_) | EngineError::SubscriptionLagging { .. }
        )
    }
}

impl From<rmp_serde::encode::Error> for EngineError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for EngineError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        EngineError::Deserialization(e.to_string())
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(e: config::ConfigError) -> Self {
        EngineError::Config(e.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        assert!(EngineError::BackendUnavailable(io).is_retryable());
        assert!(EngineError::SubscriptionLagging { watch_id: 1 }.is_retryable());
        assert!(!EngineError::Unsupported("Txn").is_retryable());
        assert!(!EngineError::RevisionAllocation("full".into()).is_retryable());
    }

    #[test]
    fn test_unsupported_message_names_operation() {
        let err = EngineError::Unsupported("LeaseRevoke");
        assert_eq!(err.to_string(), "unsupported operation: LeaseRevoke");
    }
}
