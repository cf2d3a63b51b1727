//! Error taxonomy shared by the pool, the native store and the indexes.
//!
//! Propagation rules:
//! - `PermissionDenied` and `ReadOnly` abort an operation before any mutation
//! - `Transaction` forces the enclosing transaction to abort
//! - `Locking` and `Storage` are recoverable: the caller may retry, and index
//!   damage is healed by the next reindex
//!
//! `ReadOnly` is reported to callers as a permission failure.

use thiserror::Error;

use crate::observability::Severity;

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage core errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Permission denied: database is read-only ({0})")]
    ReadOnly(String),

    #[error("Lock error: {0}")]
    Locking(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Terminated: {0}")]
    Terminated(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl StorageError {
    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }

    pub fn read_only(msg: impl Into<String>) -> Self {
        Self::ReadOnly(msg.into())
    }

    pub fn locking(msg: impl Into<String>) -> Self {
        Self::Locking(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn transaction(msg: impl Into<String>) -> Self {
        Self::Transaction(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Stable error code
    pub fn code(&self) -> &'static str {
        match self {
            Self::PermissionDenied(_) => "XMLSTORE_PERMISSION_DENIED",
            Self::ReadOnly(_) => "XMLSTORE_READ_ONLY",
            Self::Locking(_) => "XMLSTORE_LOCKING",
            Self::Storage(_) => "XMLSTORE_STORAGE",
            Self::Transaction(_) => "XMLSTORE_TRANSACTION",
            Self::NotFound(_) => "XMLSTORE_NOT_FOUND",
            Self::InvalidArgument(_) => "XMLSTORE_INVALID_ARGUMENT",
            Self::Terminated(_) => "XMLSTORE_TERMINATED",
            Self::Io(_) => "XMLSTORE_IO",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::Transaction(_) => Severity::Fatal,
            Self::Terminated(_) | Self::NotFound(_) => Severity::Warn,
            _ => Severity::Error,
        }
    }

    /// True for authorization failures, including writes against a read-only instance.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied(_) | Self::ReadOnly(_))
    }

    /// Locking and storage failures may be retried or repaired by a reindex.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Locking(_) | Self::Storage(_) | Self::Io(_))
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage(format!("record encoding: {}", e))
    }
}
