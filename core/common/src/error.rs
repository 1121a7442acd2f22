//! Common error types for Driftwood.

use thiserror::Error;

/// Top-level error type for Driftwood operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The local persistence layer cannot be opened or used (corrupted file,
    /// permission denied). Fatal until the store is reset.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A local storage operation failed; the transaction was rolled back.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Transient network failure talking to the remote store.
    #[error("Network error: {0}")]
    Network(String),

    /// The remote store refused the payload (e.g. validation failure).
    #[error("Remote rejected: {0}")]
    RemoteRejected(String),

    /// The remote store refused the credentials for every write.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The remote holds a newer version than the one the write was based on.
    #[error("Version mismatch: {0}")]
    VersionMismatch(String),

    /// A conflict is open for the record; it must be resolved first.
    #[error("Conflict detected: {0}")]
    ConflictDetected(String),

    /// The remote write of a conflict resolution failed; the conflict stays open.
    #[error("Resolution failed: {0}")]
    ResolutionFailed(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether retrying the same call later may succeed without any change.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_))
    }

    /// Whether the error makes every further remote write pointless.
    pub fn is_fatal_for_sync(&self) -> bool {
        matches!(self, Error::Unauthorized(_) | Error::StorageUnavailable(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_network_is_transient() {
        assert!(Error::Network("reset".into()).is_transient());
        assert!(!Error::RemoteRejected("bad".into()).is_transient());
        assert!(!Error::VersionMismatch("a1".into()).is_transient());
    }

    #[test]
    fn test_fatal_for_sync() {
        assert!(Error::Unauthorized("token".into()).is_fatal_for_sync());
        assert!(Error::StorageUnavailable("corrupt".into()).is_fatal_for_sync());
        assert!(!Error::Network("down".into()).is_fatal_for_sync());
    }
}
