//! Error types for identity parsing in weartag-types.

use thiserror::Error;

/// Errors that can occur when building tag identities from raw data.
///
/// This error type is platform-agnostic and does not include
/// BLE-specific errors (those belong in weartag-core).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// The stable identifier was empty.
    #[error("Tag identifier must not be empty")]
    EmptyIdentifier,

    /// The serial number did not contain enough characters for a pairing code.
    #[error("Serial '{serial}' is too short to derive a pairing code (need {required} alphanumeric characters)")]
    SerialTooShort {
        /// The serial that was rejected.
        serial: String,
        /// Number of alphanumeric characters required.
        required: usize,
    },
}

/// Result type alias using weartag-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
