//! Error types for the change feed.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Main error type for feed operations.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("{component} unavailable: {message}")]
    SourceUnavailable {
        component: &'static str,
        message: String,
    },

    #[error("Cursor commit failed for {consumer}: {message}")]
    CommitFailure { consumer: String, message: String },

    #[error("Failed to persist {artifact}: {message}")]
    PersistFailure { artifact: String, message: String },

    #[error("{phase} timed out after {elapsed:?}")]
    Timeout {
        phase: &'static str,
        elapsed: Duration,
    },

    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("Invalid artifact name: {0}")]
    InvalidArtifactName(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Cursor store is locked by another process")]
    Locked,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Record handler failed: {0}")]
    Handler(String),
}

/// Coarse classification of a [`FeedError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Change source or cursor store unreachable.
    SourceUnavailable,
    /// A single record could not be written.
    PersistFailure,
    /// The cursor write failed after persistence.
    CommitFailure,
    /// A bounded step ran past its deadline.
    Timeout,
    NotFound,
    Invalid,
    Internal,
}

impl FeedError {
    pub fn source_unavailable(message: impl Into<String>) -> Self {
        FeedError::SourceUnavailable {
            component: "change source",
            message: message.into(),
        }
    }

    pub fn cursor_unavailable(message: impl Into<String>) -> Self {
        FeedError::SourceUnavailable {
            component: "cursor store",
            message: message.into(),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FeedError::SourceUnavailable { .. } | FeedError::Locked => ErrorKind::SourceUnavailable,
            FeedError::CommitFailure { .. } => ErrorKind::CommitFailure,
            FeedError::PersistFailure { .. } => ErrorKind::PersistFailure,
            FeedError::Timeout { .. } => ErrorKind::Timeout,
            FeedError::ArtifactNotFound(_) => ErrorKind::NotFound,
            FeedError::InvalidArtifactName(_)
            | FeedError::InvalidConfig(_)
            | FeedError::InvalidFormat(_)
            | FeedError::ChecksumMismatch { .. } => ErrorKind::Invalid,
            FeedError::Io(_)
            | FeedError::Serialization(_)
            | FeedError::Deserialization(_)
            | FeedError::Handler(_) => ErrorKind::Internal,
        }
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(e: serde_json::Error) -> Self {
        FeedError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for FeedError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        FeedError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for FeedError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        FeedError::Deserialization(e.to_string())
    }
}

/// Result type for feed operations.
pub type Result<T> = std::result::Result<T, FeedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            FeedError::source_unavailable("down").kind(),
            ErrorKind::SourceUnavailable
        );
        assert_eq!(
            FeedError::cursor_unavailable("down").kind(),
            ErrorKind::SourceUnavailable
        );
        assert_eq!(
            FeedError::CommitFailure {
                consumer: "x".into(),
                message: "disk full".into(),
            }
            .kind(),
            ErrorKind::CommitFailure
        );
        assert_eq!(
            FeedError::ArtifactNotFound("a".into()).kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_display_names_component() {
        let err = FeedError::cursor_unavailable("connection refused");
        assert_eq!(err.to_string(), "cursor store unavailable: connection refused");
    }
}
