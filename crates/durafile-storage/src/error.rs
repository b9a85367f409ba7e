//! Descriptor store error types.

use thiserror::Error;

/// Descriptor store operation errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("invalid location: {0}")]
    InvalidLocation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed descriptor at {location}: {source}")]
    Descriptor {
        location: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("quota exceeded: need {required} bytes, {available} available")]
    QuotaExceeded { required: u64, available: u64 },
}

impl StorageError {
    /// Whether the error is the distinguished not-found outcome
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result type for descriptor store operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

impl From<StorageError> for durafile_common::Error {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(location) => Self::NotFound(location),
            StorageError::InvalidLocation(msg) => Self::InvalidArgument(msg),
            StorageError::Io(e) => Self::TransientIo(e.to_string()),
            StorageError::Unavailable(msg) => Self::TransientIo(msg),
            e @ StorageError::Descriptor { .. } => Self::Serialization(e.to_string()),
            e @ StorageError::QuotaExceeded { .. } => Self::Storage(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use durafile_common::Error;

    #[test]
    fn test_conversion_keeps_taxonomy() {
        let not_found: Error = StorageError::NotFound("ro/f1".into()).into();
        assert!(not_found.is_not_found());

        let transient: Error = StorageError::Unavailable("bucket throttled".into()).into();
        assert!(transient.is_retryable());

        let io: Error = StorageError::Io(std::io::Error::other("disk gone")).into();
        assert!(io.is_retryable());
    }
}
