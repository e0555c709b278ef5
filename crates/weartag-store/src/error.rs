//! Error types for weartag-store.

use std::path::PathBuf;

/// Result type for weartag-store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in weartag-store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Database error from SQLite.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Failed to create database directory.
    #[error("Failed to create database directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Tag not found in database.
    #[error("Tag not found: {0}")]
    TagNotFound(String),

    /// A stored row no longer forms a valid identity.
    #[error("Invalid stored identity: {0}")]
    InvalidIdentity(#[from] weartag_types::ParseError),
}

impl From<Error> for weartag_core::Error {
    fn from(error: Error) -> Self {
        weartag_core::Error::registry(error)
    }
}
