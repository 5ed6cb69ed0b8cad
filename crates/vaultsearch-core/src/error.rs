//! Error types for the indexing core.

use thiserror::Error;

use crate::UserId;
use crate::index::KeyError;

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Key material could not be loaded or stored.
    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    /// Sealing or opening an index row failed.
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// A storage limit of zero bytes was requested.
    #[error("Invalid storage limit: {0} bytes")]
    InvalidLimit(u64),

    /// No indexing worker is registered for the user.
    #[error("Unknown user: {0}")]
    UnknownUser(UserId),

    /// The per-user worker stopped before answering a command.
    #[error("Indexing worker for {0} is no longer running")]
    WorkerGone(UserId),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
