//! Error types for durafile
//!
//! This module defines the error taxonomy shared by the storage-element
//! core. Anything crossing a component boundary is returned as one of
//! these variants; [`Error::failure_class`] tells the caller whether to
//! retry or escalate.

use crate::types::{FileId, TransactionId};
use thiserror::Error;

/// Common result type for durafile operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for durafile
#[derive(Debug, Error)]
pub enum Error {
    // Taxonomy errors
    #[error("transient I/O failure: {0}")]
    TransientIo(String),

    #[error("lock busy: {key}")]
    LockContention { key: String },

    #[error("consistency violation for {file_id}: {detail}")]
    ConsistencyViolation { file_id: FileId, detail: String },

    #[error("leadership lost for {key}")]
    LeadershipLost { key: String },

    #[error("commit of transaction {txn_id} (file {file_id}) failed after {attempts} attempts")]
    PartialCommitFailure {
        txn_id: TransactionId,
        file_id: FileId,
        attempts: u32,
    },

    // Lookup / state errors
    #[error("not found: {0}")]
    NotFound(String),

    #[error("transaction {txn_id} cannot move from {from} to {to}")]
    InvalidTransition {
        txn_id: TransactionId,
        from: String,
        to: String,
    },

    #[error("file {file_id} has an in-flight finalize transaction {txn_id}")]
    InFlight {
        file_id: FileId,
        txn_id: TransactionId,
    },

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("capacity unavailable: {0}")]
    CapacityUnavailable(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // Internal errors
    #[error("storage error: {0}")]
    Storage(String),

    #[error("metadata store error: {0}")]
    MetaStore(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// How a caller should treat a failed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Back off and try again
    Retryable,
    /// Needs operator attention or a different request
    Fatal,
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a transient I/O error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientIo(msg.into())
    }

    /// Create a not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a lock contention error
    pub fn busy(key: impl Into<String>) -> Self {
        Self::LockContention { key: key.into() }
    }

    /// Check if this is a retryable error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientIo(_) | Self::LockContention { .. } | Self::CapacityUnavailable(_)
        )
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Classify for the retry or alerting path above the core
    #[must_use]
    pub fn failure_class(&self) -> FailureClass {
        if self.is_retryable() {
            FailureClass::Retryable
        } else {
            FailureClass::Fatal
        }
    }

    /// Stable short code for logs and metrics labels
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::TransientIo(_) => "transient_io",
            Self::LockContention { .. } => "lock_contention",
            Self::ConsistencyViolation { .. } => "consistency_violation",
            Self::LeadershipLost { .. } => "leadership_lost",
            Self::PartialCommitFailure { .. } => "partial_commit_failure",
            Self::NotFound(_) => "not_found",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::InFlight { .. } => "in_flight",
            Self::AccessDenied(_) => "access_denied",
            Self::CapacityUnavailable(_) => "capacity_unavailable",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Storage(_) => "storage",
            Self::MetaStore(_) => "meta_store",
            Self::Configuration(_) => "configuration",
            Self::Serialization(_) => "serialization",
            Self::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(Error::transient("backend offline").is_retryable());
        assert!(Error::busy("cache/rebuild").is_retryable());
        assert!(!Error::AccessDenied("x".into()).is_retryable());
    }

    #[test]
    fn test_failure_class() {
        let fatal = Error::PartialCommitFailure {
            txn_id: TransactionId::new(),
            file_id: FileId::new(),
            attempts: 3,
        };
        assert_eq!(fatal.failure_class(), FailureClass::Fatal);
        assert_eq!(fatal.code(), "partial_commit_failure");
        assert_eq!(
            Error::transient("x").failure_class(),
            FailureClass::Retryable
        );
    }

    #[test]
    fn test_error_not_found() {
        assert!(Error::not_found("edit/f1").is_not_found());
        assert!(!Error::internal("boom").is_not_found());
    }
}
