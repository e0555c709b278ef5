//! Error types for weartag-core.
//!
//! Errors are split by blast radius, so each failure is reported through
//! exactly one channel:
//!
//! | Error | Scope | Effect |
//! |-------|-------|--------|
//! | [`TransportError`] | Link | Fatal to the current session, surfaces as `Disconnected` on the state stream |
//! | [`DecodeError`] | One frame | Logged and counted, the frame is dropped, the session stays up |
//! | [`CommandError::Timeout`] | One command | The session survives; the caller decides whether to resend |
//! | [`CommandError::SessionInvalidated`] | All pending work of a session | Delivered synchronously when the session dies |
//! | [`Error`] | Everything else | Configuration, registry, scanning, lifecycle misuse |
//!
//! A frame for a kind nobody subscribed to is not an error to anyone; it is
//! dropped and counted in the session metrics.
//!
//! ## Retry guidance
//!
//! The engine never resends a command. Some commands are not idempotent
//! against a rebooting tag (a rename acknowledged just before the link
//! dropped must not be applied twice), so retries are a caller decision:
//!
//! ```ignore
//! use std::time::Duration;
//! use weartag_core::CommandError;
//!
//! match session.battery(Duration::from_secs(2)).await {
//!     Err(CommandError::Timeout { .. }) => {
//!         // Safe to resend: reading the battery has no side effect.
//!         session.battery(Duration::from_secs(2)).await?;
//!     }
//!     Err(CommandError::SessionInvalidated) => {
//!         // Wait for the next `Connected` event and use the new session.
//!     }
//!     other => { other?; }
//! }
//! ```

use std::time::Duration;

use thiserror::Error;

use weartag_types::KindId;

/// Errors that can occur in the engine outside the per-command path.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth Low Energy error.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Link-level failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A frame could not be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// A command failed.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// No tag matched the identifier during a scan.
    #[error("Tag not found: {identifier}")]
    TagNotFound {
        /// The identifier that was searched for.
        identifier: String,
    },

    /// No Bluetooth adapter is available.
    #[error("No Bluetooth adapter available")]
    NoAdapter,

    /// A connection is already in progress or established for this tag.
    #[error("Tag {identifier} already has an active connection")]
    SessionActive {
        /// Identifier of the busy tag.
        identifier: String,
    },

    /// The tag is not connected.
    #[error("Tag is not connected")]
    NotConnected,

    /// The persisted registry failed.
    #[error("Registry error: {0}")]
    Registry(String),

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Identity data could not be parsed.
    #[error(transparent)]
    Parse(#[from] weartag_types::ParseError),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a tag not found error for a specific identifier.
    pub fn tag_not_found(identifier: impl Into<String>) -> Self {
        Self::TagNotFound {
            identifier: identifier.into(),
        }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Create a registry error from any displayable cause.
    pub fn registry(cause: impl std::fmt::Display) -> Self {
        Self::Registry(cause.to_string())
    }
}

/// Link-level errors reported by a [`Transport`](crate::transport::Transport).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// Bluetooth stack error.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// The link is not established.
    #[error("Link is not connected")]
    NotConnected,

    /// The peripheral could not be located.
    #[error("Tag '{0}' not found")]
    TagNotFound(String),

    /// The link could not be established.
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    /// A required GATT characteristic is missing.
    #[error("Characteristic not found: {uuid} (searched in {service_count} services)")]
    CharacteristicNotFound {
        /// The UUID that was not found.
        uuid: String,
        /// Number of services that were searched.
        service_count: usize,
    },

    /// A write could not be delivered.
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// The link closed underneath the caller.
    #[error("Link closed")]
    Closed,
}

/// Per-frame decode failures. Never fatal to a session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum DecodeError {
    /// The length prefix is not a valid varint.
    #[error("Malformed length prefix")]
    MalformedLength,

    /// The declared frame length exceeds the configured maximum.
    #[error("Frame of {declared} bytes exceeds maximum of {max}")]
    FrameTooLarge {
        /// Declared body length.
        declared: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The declared length does not match the bytes present.
    #[error("Length mismatch: declared {declared} bytes, got {actual}")]
    LengthMismatch {
        /// Declared body length.
        declared: usize,
        /// Bytes actually present after the prefix.
        actual: usize,
    },

    /// The envelope could not be decoded.
    #[error("Malformed envelope: {0}")]
    Envelope(String),

    /// The kind is not in the kind table.
    #[error("Unknown kind {0}")]
    UnknownKind(KindId),

    /// The payload does not match the kind's schema.
    #[error("Payload for {kind} does not match schema {schema}: {reason}")]
    SchemaMismatch {
        /// Frame kind.
        kind: KindId,
        /// Registered schema name.
        schema: &'static str,
        /// Decoder message.
        reason: String,
    },
}

/// Failures of a single command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum CommandError {
    /// No response arrived before the caller's deadline.
    #[error("Command {kind} timed out after {duration:?}")]
    Timeout {
        /// Request kind.
        kind: KindId,
        /// The timeout the caller supplied.
        duration: Duration,
    },

    /// The session this command belongs to is gone.
    ///
    /// Returned both for commands issued on a handle that is already invalid
    /// and for commands that were pending when the session died.
    #[error("Session invalidated")]
    SessionInvalidated,

    /// The tag answered the token with an unexpected kind.
    #[error("Expected response {expected}, got {actual}")]
    UnexpectedResponse {
        /// Kind the correlator was waiting for.
        expected: KindId,
        /// Kind that arrived.
        actual: KindId,
    },

    /// The request kind is not in the kind table.
    #[error("Kind {0} is not registered")]
    UnregisteredKind(KindId),

    /// The response payload could not be decoded into the expected message.
    #[error("Malformed response for {kind}: {reason}")]
    MalformedResponse {
        /// Response kind.
        kind: KindId,
        /// Decoder message.
        reason: String,
    },

    /// The firmware acknowledged the command with a failure status.
    #[error("Command {kind} rejected by tag: {message}")]
    Rejected {
        /// Request kind.
        kind: KindId,
        /// Message reported by the firmware.
        message: String,
    },
}

impl CommandError {
    /// Create a timeout error for a request kind.
    pub fn timeout(kind: KindId, duration: Duration) -> Self {
        Self::Timeout { kind, duration }
    }

    /// Whether resending the same command on the same session can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Result type alias using weartag-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::tag_not_found("AA:BB");
        assert!(err.to_string().contains("AA:BB"));

        let err = Error::NotConnected;
        assert_eq!(err.to_string(), "Tag is not connected");

        let err = Error::invalid_config("notification_buffer must be > 0");
        assert!(err.to_string().contains("notification_buffer"));
    }

    #[test]
    fn test_command_timeout_display() {
        let err = CommandError::timeout(KindId(0x120), Duration::from_secs(2));
        assert!(err.to_string().contains("0x0120"));
        assert!(err.to_string().contains("2s"));
        assert!(err.is_transient());
        assert!(!CommandError::SessionInvalidated.is_transient());
    }

    #[test]
    fn test_decode_error_display() {
        let err = DecodeError::FrameTooLarge {
            declared: 9000,
            max: 4096,
        };
        assert!(err.to_string().contains("9000"));
        assert!(err.to_string().contains("4096"));
    }

    #[test]
    fn test_nested_conversions() {
        let err: Error = CommandError::SessionInvalidated.into();
        assert!(matches!(err, Error::Command(CommandError::SessionInvalidated)));

        let err: Error = TransportError::Closed.into();
        assert_eq!(err.to_string(), "Link closed");

        let err: Error = DecodeError::UnknownKind(KindId(9)).into();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn test_btleplug_error_conversion() {
        fn _assert_from_impl<T: From<btleplug::Error>>() {}
        _assert_from_impl::<Error>();
        _assert_from_impl::<TransportError>();
    }
}
