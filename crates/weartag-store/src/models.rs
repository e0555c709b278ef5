//! Data models for stored tags.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use weartag_types::{ParseResult, TagIdentity};

/// A tag stored in the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTag {
    /// Tag identifier (address or peripheral UUID).
    pub identifier: String,
    /// Last known display name. Empty if the tag never reported one.
    pub display_name: String,
    /// Serial number, once device info has been read.
    pub serial: Option<String>,
    /// Firmware version, once device info has been read.
    pub firmware: Option<String>,
    /// First time this tag connected.
    #[serde(with = "time::serde::rfc3339")]
    pub first_seen: OffsetDateTime,
    /// Last time this tag connected or was renamed.
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
}

impl StoredTag {
    /// Identity of the stored tag. Always paired.
    pub fn identity(&self) -> ParseResult<TagIdentity> {
        TagIdentity::new(self.identifier.clone(), self.display_name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_is_paired() {
        let tag = StoredTag {
            identifier: "AA:01".into(),
            display_name: "Jacket".into(),
            serial: None,
            firmware: None,
            first_seen: OffsetDateTime::UNIX_EPOCH,
            last_seen: OffsetDateTime::UNIX_EPOCH,
        };
        let identity = tag.identity().unwrap();
        assert_eq!(identity.identifier(), "AA:01");
        assert_eq!(identity.display_name(), "Jacket");
        assert_eq!(identity.pairing_code(), None);
    }

    #[test]
    fn test_serializes_timestamps_as_rfc3339() {
        let tag = StoredTag {
            identifier: "AA:01".into(),
            display_name: String::new(),
            serial: Some("WT00AB12".into()),
            firmware: None,
            first_seen: OffsetDateTime::UNIX_EPOCH,
            last_seen: OffsetDateTime::UNIX_EPOCH,
        };
        let json = serde_json::to_string(&tag).unwrap();
        assert!(json.contains("1970-01-01T00:00:00Z"));
        let back: StoredTag = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tag);
    }
}
