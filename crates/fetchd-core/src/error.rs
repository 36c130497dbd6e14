//! Error types for fetchd core

use fetchd_types::{DownloadId, DownloadStatus, ErrorKind};
use std::path::PathBuf;
use thiserror::Error;

/// Failure of the persistence layer
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

/// Errors that can occur in fetchd core
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Destination already used by another download: {}", .0.display())]
    DuplicateDestination(PathBuf),

    #[error("Download not found: {0}")]
    NotFound(DownloadId),

    #[error("Download already exists: {0}")]
    AlreadyExists(DownloadId),

    #[error("Cannot {command} download {id} while it is {status}")]
    InvalidTransition {
        id: DownloadId,
        status: DownloadStatus,
        command: &'static str,
    },

    #[error("Storage failure: {0}")]
    Storage(#[from] StorageError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Engine halted: {0}")]
    Halted(String),

    #[error("Engine is not running")]
    EngineStopped,
}

impl EngineError {
    /// Whether the engine itself can no longer be trusted
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Storage(_) | EngineError::Halted(_))
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(error: sqlx::Error) -> Self {
        EngineError::Storage(StorageError::Database(error))
    }
}

// Allow converting to String for host glue
impl From<EngineError> for String {
    fn from(error: EngineError) -> Self {
        error.to_string()
    }
}

/// Terminal failure reported by a transfer executor
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct TransferError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TransferError {
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::NetworkUnavailable,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::TransferFailed,
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for TransferError {
    fn from(error: std::io::Error) -> Self {
        TransferError::failed(format!("IO error: {}", error))
    }
}

impl From<reqwest::Error> for TransferError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_connect() || error.is_timeout() {
            TransferError::network(error.to_string())
        } else {
            TransferError::failed(error.to_string())
        }
    }
}

/// Result alias used across the engine
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_fatal_classification() {
        let id = DownloadId::derive("https://example.com/a", Path::new("a"));
        assert!(!EngineError::NotFound(id).is_fatal());
        assert!(!EngineError::InvalidRequest("bad".into()).is_fatal());
        assert!(EngineError::Halted("disk gone".into()).is_fatal());
        let storage = EngineError::from(StorageError::Corrupt {
            id: "x".into(),
            reason: "bad status".into(),
        });
        assert!(storage.is_fatal());
    }

    #[test]
    fn test_invalid_transition_message() {
        let id = DownloadId::derive("https://example.com/a", Path::new("a"));
        let err = EngineError::InvalidTransition {
            id,
            status: DownloadStatus::Queued,
            command: "retry",
        };
        let msg = err.to_string();
        assert!(msg.contains("retry"));
        assert!(msg.contains("queued"));
    }

    #[test]
    fn test_transfer_error_constructors() {
        assert_eq!(TransferError::network("down").kind, ErrorKind::NetworkUnavailable);
        assert_eq!(TransferError::failed("500").kind, ErrorKind::TransferFailed);
        let io = TransferError::from(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert_eq!(io.kind, ErrorKind::TransferFailed);
    }
}
