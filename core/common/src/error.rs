//! Common error types for keepsake.

use thiserror::Error;

/// Top-level error type for collection and restore operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The destination already holds an item or container with that name.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The item was deleted remotely while we were working on it.
    #[error("Deleted in flight: {0}")]
    DeletedInFlight(String),

    /// Transient network failure.
    #[error("Network error: {0}")]
    Network(String),

    /// The remote asked us to back off.
    #[error("Throttled: {0}")]
    Throttled(String),

    /// A folder showed up where only leaf items are expected.
    #[error("Unexpected folder: {0}")]
    UnexpectedFolder(String),

    /// A URL cache refresh failed; shared with every caller waiting on it.
    #[error("Refreshing url cache for {container}: {reason}")]
    CacheRefresh { container: String, reason: String },

    /// Any other failure reported by a remote collaborator.
    #[error("Remote error: {0}")]
    Remote(String),

    /// The operation cannot complete successfully.
    #[error("Fatal: {0}")]
    Fatal(String),
}

impl Error {
    /// True for the destination's "name already exists" condition.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists(_))
    }

    /// True for the remote's "deleted concurrently / already gone" condition.
    pub fn is_deleted_in_flight(&self) -> bool {
        matches!(self, Error::DeletedInFlight(_))
    }

    /// True for failures worth retrying after a back-off.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Throttled(_) | Error::Io(_))
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
