//! Error types for the broker and its log adapters.

use crate::types::EntryId;
use thiserror::Error;

/// Main error type for broker and log operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Log unavailable: {0}")]
    LogUnavailable(String),

    #[error("Malformed entry {id}: {reason}")]
    MalformedEntry { id: EntryId, reason: String },

    #[error("Publish failed: {0}")]
    PublishFailed(String),

    #[error("Entry id {id} is not greater than the log tail {last}")]
    IdNotIncreasing { id: EntryId, last: EntryId },

    #[error("Invalid entry id: {0}")]
    InvalidId(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Invalid log format: {0}")]
    InvalidFormat(String),

    #[error("Log is locked by another process")]
    Locked,

    #[error("Broker is stopped")]
    AlreadyStopped,

    #[error("Broadcast loop panicked")]
    LoopPanicked,
}

impl BrokerError {
    /// Short stable label for log fields.
    pub fn as_label(&self) -> &'static str {
        match self {
            BrokerError::Io(_) => "io",
            BrokerError::LogUnavailable(_) => "log_unavailable",
            BrokerError::MalformedEntry { .. } => "malformed_entry",
            BrokerError::PublishFailed(_) => "publish_failed",
            BrokerError::IdNotIncreasing { .. } => "id_not_increasing",
            BrokerError::InvalidId(_) => "invalid_id",
            BrokerError::Serialization(_) => "serialization",
            BrokerError::Deserialization(_) => "deserialization",
            BrokerError::Corruption(_) => "corruption",
            BrokerError::ChecksumMismatch { .. } => "checksum_mismatch",
            BrokerError::InvalidFormat(_) => "invalid_format",
            BrokerError::Locked => "locked",
            BrokerError::AlreadyStopped => "already_stopped",
            BrokerError::LoopPanicked => "loop_panicked",
        }
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(e: serde_json::Error) -> Self {
        BrokerError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for BrokerError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        BrokerError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for BrokerError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        BrokerError::Deserialization(e.to_string())
    }
}

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_entry_display() {
        let err = BrokerError::MalformedEntry {
            id: EntryId::new(3, 0),
            reason: "missing field".into(),
        };
        assert_eq!(err.as_label(), "malformed_entry");
        assert_eq!(err.to_string(), "Malformed entry 3-0: missing field");
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err = BrokerError::from(io);
        assert_eq!(err.as_label(), "io");
        assert_eq!(
            BrokerError::LogUnavailable("gone".into()).as_label(),
            "log_unavailable"
        );
    }
}
