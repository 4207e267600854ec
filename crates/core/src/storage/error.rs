//! Storage error types.

use thiserror::Error;

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Object not found in storage.
    #[error("object not found: {key}")]
    NotFound {
        /// Storage key that was not found.
        key: String,
    },

    /// A store definition names a kind with no backend.
    #[error("unknown storage kind '{kind}'")]
    UnknownBackendKind {
        /// The kind that was requested.
        kind: String,
    },

    /// Storage provider configuration error.
    #[error("storage configuration error: {0}")]
    Configuration(String),

    /// Backend operation error.
    #[error("storage operation failed: {0}")]
    Operation(String),

    /// Operation the backend does not offer, such as reading from a cold archive.
    #[error("operation not supported by {backend} storage: {operation}")]
    Unsupported {
        /// Backend kind.
        backend: &'static str,
        /// Operation that was attempted.
        operation: &'static str,
    },

    /// Local file I/O failed.
    #[error("local I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// A replication worker panicked or was cancelled.
    #[error("replication worker for '{store}' did not complete: {reason}")]
    Join {
        /// Store the worker was writing to.
        store: String,
        /// Panic or cancellation message.
        reason: String,
    },
}

impl StorageError {
    /// Create a not found error.
    #[must_use]
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Create an unknown backend kind error.
    #[must_use]
    pub fn unknown_kind(kind: impl Into<String>) -> Self {
        Self::UnknownBackendKind { kind: kind.into() }
    }

    /// Create a configuration error.
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create an operation error.
    #[must_use]
    pub fn operation(msg: impl Into<String>) -> Self {
        Self::Operation(msg.into())
    }

    /// Whether the error means the object is absent.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<opendal::Error> for StorageError {
    fn from(err: opendal::Error) -> Self {
        match err.kind() {
            opendal::ErrorKind::NotFound => Self::NotFound {
                key: err.to_string(),
            },
            opendal::ErrorKind::ConfigInvalid => Self::Configuration(err.to_string()),
            _ => Self::Operation(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opendal_not_found_maps_to_not_found() {
        let err = opendal::Error::new(opendal::ErrorKind::NotFound, "missing");
        assert!(StorageError::from(err).is_not_found());
    }

    #[test]
    fn test_opendal_other_errors_map_to_operation() {
        let err = opendal::Error::new(opendal::ErrorKind::Unexpected, "boom");
        assert!(matches!(StorageError::from(err), StorageError::Operation(_)));
    }

    #[test]
    fn test_unknown_kind_message_names_kind() {
        let err = StorageError::unknown_kind("ftp");
        assert_eq!(err.to_string(), "unknown storage kind 'ftp'");
    }
}
