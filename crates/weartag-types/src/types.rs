//! Core types for wearable tags.

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{ParseError, ParseResult};

/// Number of trailing serial characters that make up a pairing code.
pub const PAIRING_CODE_LEN: usize = 4;

/// Identity of a physical tag.
///
/// The identifier is stable across sessions: a radio address on Linux and
/// Windows, a platform-assigned UUID on macOS. The display name is the only
/// field the firmware can change (a rename refreshes it). A pairing code is
/// only present for tags that have not been paired yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TagIdentity {
    identifier: String,
    display_name: String,
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pairing_code: Option<String>,
}

impl TagIdentity {
    /// Create an identity for a tag that is already paired.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::EmptyIdentifier`] if `identifier` is blank.
    pub fn new(identifier: impl Into<String>, display_name: impl Into<String>) -> ParseResult<Self> {
        let identifier = identifier.into();
        if identifier.trim().is_empty() {
            return Err(ParseError::EmptyIdentifier);
        }
        Ok(Self {
            identifier,
            display_name: display_name.into(),
            pairing_code: None,
        })
    }

    /// Create an identity for an advertising, not-yet-paired tag.
    pub fn unpaired(
        identifier: impl Into<String>,
        display_name: impl Into<String>,
        pairing_code: impl Into<String>,
    ) -> ParseResult<Self> {
        let mut identity = Self::new(identifier, display_name)?;
        identity.pairing_code = Some(pairing_code.into());
        Ok(identity)
    }

    /// Stable opaque identifier.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Human-readable name.
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Pairing code, only for tags that were never paired.
    pub fn pairing_code(&self) -> Option<&str> {
        self.pairing_code.as_deref()
    }

    /// Return a copy carrying a refreshed display name.
    #[must_use]
    pub fn with_display_name(&self, display_name: impl Into<String>) -> Self {
        Self {
            identifier: self.identifier.clone(),
            display_name: display_name.into(),
            pairing_code: self.pairing_code.clone(),
        }
    }

    /// Return a copy without the pairing code (the tag has been paired).
    #[must_use]
    pub fn paired(&self) -> Self {
        Self {
            identifier: self.identifier.clone(),
            display_name: self.display_name.clone(),
            pairing_code: None,
        }
    }
}

impl fmt::Display for TagIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.display_name.is_empty() {
            write!(f, "{}", self.identifier)
        } else {
            write!(f, "{} ({})", self.display_name, self.identifier)
        }
    }
}

/// Derive the short pairing code from a tag serial number.
///
/// Non-alphanumeric characters are ignored and the last
/// [`PAIRING_CODE_LEN`] remaining characters are returned upper-cased.
///
/// # Examples
///
/// ```
/// use weartag_types::pairing_code_from_serial;
///
/// assert_eq!(pairing_code_from_serial("1a2b3c4d").unwrap(), "3C4D");
/// assert!(pairing_code_from_serial("ab").is_err());
/// ```
pub fn pairing_code_from_serial(serial: &str) -> ParseResult<String> {
    let chars: Vec<char> = serial
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_uppercase())
        .collect();

    if chars.len() < PAIRING_CODE_LEN {
        return Err(ParseError::SerialTooShort {
            serial: serial.to_string(),
            required: PAIRING_CODE_LEN,
        });
    }

    Ok(chars[chars.len() - PAIRING_CODE_LEN..].iter().collect())
}

/// Discriminator of a protocol message kind.
///
/// Every frame carries one. The engine keeps a runtime table mapping kinds
/// to payload schemas, so new kinds can be added without touching the
/// session machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct KindId(pub u32);

impl KindId {
    /// Raw numeric value.
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl From<u32> for KindId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Display for KindId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// Reason a tag left the connected state.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new reasons
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "type", content = "detail", rename_all = "snake_case"))]
#[non_exhaustive]
pub enum DisconnectReason {
    /// The caller disconnected or cancelled a pending connection.
    UserRequested,
    /// The radio link dropped (out of range, powered off).
    LinkLost,
    /// The tag rebooted after a command that requires it (rename, reboot).
    RemoteReboot,
    /// The transport failed; fatal to the session.
    Transport(String),
    /// Unknown reason.
    Unknown,
}

impl DisconnectReason {
    /// Whether the caller asked for this disconnection.
    pub fn is_user_requested(&self) -> bool {
        matches!(self, Self::UserRequested)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UserRequested => write!(f, "disconnected by user"),
            Self::LinkLost => write!(f, "link lost"),
            Self::RemoteReboot => write!(f, "tag rebooted"),
            Self::Transport(msg) => write!(f, "transport error: {}", msg),
            Self::Unknown => write!(f, "unknown reason"),
        }
    }
}
