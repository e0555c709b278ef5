//! Tag protocol messages and the kind table.
//!
//! Every frame on the wire is an [`Envelope`] whose `kind_id` selects the
//! schema of its `payload`. The engine itself only needs the mapping from
//! kind to schema, which lives in a [`KindRegistry`] built at runtime: new
//! firmware messages are added by registering them, without touching the
//! session or router code.
//!
//! # Well-known kinds
//!
//! | Kind | Direction | Message |
//! |------|-----------|---------|
//! | [`kinds::ACK`] | tag → app | [`Ack`] |
//! | [`kinds::DEVICE_INFO_REQUEST`] | app → tag | [`DeviceInfoRequest`] |
//! | [`kinds::DEVICE_INFO`] | tag → app | [`DeviceInfo`] |
//! | [`kinds::BATTERY_REQUEST`] | app → tag | [`BatteryRequest`] |
//! | [`kinds::BATTERY_STATUS`] | tag → app (response and notification) | [`BatteryStatus`] |
//! | [`kinds::RENAME`] | app → tag | [`RenameRequest`] (answered by [`Ack`], then the tag reboots) |
//! | [`kinds::REBOOT`] | app → tag | [`RebootRequest`] (answered by [`Ack`], then the tag reboots) |
//! | [`kinds::GESTURE`] | tag → app | [`GestureEvent`] |
//! | [`kinds::ATTACH`] | tag → app | [`AttachEvent`] |

use std::collections::HashMap;

use bytes::Bytes;
use prost::Message;

use weartag_types::KindId;

use crate::error::DecodeError;

/// Outer frame carried on the wire after the length prefix.
#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    /// Present only on commands and their responses.
    #[prost(uint32, optional, tag = "1")]
    pub correlation_token: Option<u32>,
    #[prost(uint32, tag = "2")]
    pub kind_id: u32,
    #[prost(bytes = "bytes", tag = "3")]
    pub payload: Bytes,
}

/// Status carried by [`Ack`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum AckStatus {
    Ok = 0,
    Rejected = 1,
    Busy = 2,
    Unsupported = 3,
}

/// Generic acknowledgement for commands without a data response.
#[derive(Clone, PartialEq, Message)]
pub struct Ack {
    #[prost(enumeration = "AckStatus", tag = "1")]
    pub status: i32,
    #[prost(string, tag = "2")]
    pub message: String,
}

impl Ack {
    /// Successful acknowledgement.
    pub fn ok() -> Self {
        Self {
            status: AckStatus::Ok as i32,
            message: String::new(),
        }
    }

    /// Whether the tag accepted the command.
    pub fn is_ok(&self) -> bool {
        self.status() == AckStatus::Ok
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct DeviceInfoRequest {}

/// Identity and firmware details reported by the tag.
#[derive(Clone, PartialEq, Message)]
pub struct DeviceInfo {
    #[prost(string, tag = "1")]
    pub serial: String,
    #[prost(string, tag = "2")]
    pub display_name: String,
    #[prost(string, tag = "3")]
    pub firmware_version: String,
    #[prost(uint32, tag = "4")]
    pub vendor_id: u32,
    #[prost(uint32, tag = "5")]
    pub product_id: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct BatteryRequest {}

#[derive(Clone, PartialEq, Message)]
pub struct BatteryStatus {
    /// Charge level, 0-100.
    #[prost(uint32, tag = "1")]
    pub level: u32,
    #[prost(bool, tag = "2")]
    pub charging: bool,
}

/// Set a new advertised name. The tag reboots after acknowledging.
#[derive(Clone, PartialEq, Message)]
pub struct RenameRequest {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct RebootRequest {}

/// Gestures recognised by the tag firmware.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum Gesture {
    Unknown = 0,
    DoubleTap = 1,
    BrushIn = 2,
    BrushOut = 3,
    Cover = 4,
    Scratch = 5,
}

#[derive(Clone, PartialEq, Message)]
pub struct GestureEvent {
    #[prost(enumeration = "Gesture", tag = "1")]
    pub gesture: i32,
    /// Milliseconds since tag boot.
    #[prost(uint64, tag = "2")]
    pub uptime_ms: u64,
}

/// Gear attach/detach notification.
#[derive(Clone, PartialEq, Message)]
pub struct AttachEvent {
    #[prost(bool, tag = "1")]
    pub attached: bool,
    #[prost(uint32, tag = "2")]
    pub product_id: u32,
}

/// Well-known kind identifiers.
pub mod kinds {
    use weartag_types::KindId;

    pub const ACK: KindId = KindId(0x0001);
    pub const DEVICE_INFO_REQUEST: KindId = KindId(0x0110);
    pub const DEVICE_INFO: KindId = KindId(0x0111);
    pub const BATTERY_REQUEST: KindId = KindId(0x0120);
    pub const BATTERY_STATUS: KindId = KindId(0x0121);
    pub const RENAME: KindId = KindId(0x0130);
    pub const REBOOT: KindId = KindId(0x0140);
    pub const GESTURE: KindId = KindId(0x0200);
    pub const ATTACH: KindId = KindId(0x0201);
}

type Validator = fn(&[u8]) -> Result<(), prost::DecodeError>;

fn validate_as<M: Message + Default>(payload: &[u8]) -> Result<(), prost::DecodeError> {
    M::decode(payload).map(|_| ())
}

/// One entry of the kind table.
#[derive(Debug, Clone, Copy)]
pub struct KindEntry {
    /// The kind this entry describes.
    pub kind: KindId,
    /// Short human-readable name, used in logs.
    pub name: &'static str,
    /// Schema (message type) name; `"opaque"` when unchecked.
    pub schema: &'static str,
    /// Kind the tag answers this request with, if it is a request.
    pub response: Option<KindId>,
    validator: Option<Validator>,
}

impl KindEntry {
    /// Check a payload against this kind's schema.
    pub fn validate(&self, payload: &[u8]) -> Result<(), DecodeError> {
        match self.validator {
            Some(validate) => validate(payload).map_err(|e| DecodeError::SchemaMismatch {
                kind: self.kind,
                schema: self.schema,
                reason: e.to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// Runtime table mapping kinds to payload schemas.
///
/// ```
/// use weartag_core::protocol::{KindRegistry, BatteryStatus};
/// use weartag_types::KindId;
///
/// let kinds = KindRegistry::with_defaults()
///     .with_message::<BatteryStatus>(KindId(0x0900), "battery-mirror")
///     .with_opaque(KindId(0x0901), "debug-blob");
/// assert!(kinds.contains(KindId(0x0900)));
/// ```
#[derive(Debug, Clone, Default)]
pub struct KindRegistry {
    kinds: HashMap<KindId, KindEntry>,
}

impl KindRegistry {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with every well-known tag kind.
    pub fn with_defaults() -> Self {
        Self::new()
            .with_message::<Ack>(kinds::ACK, "ack")
            .with_command::<DeviceInfoRequest, DeviceInfo>(
                kinds::DEVICE_INFO_REQUEST,
                kinds::DEVICE_INFO,
                "device-info",
            )
            .with_command::<BatteryRequest, BatteryStatus>(
                kinds::BATTERY_REQUEST,
                kinds::BATTERY_STATUS,
                "battery",
            )
            .with_command::<RenameRequest, Ack>(kinds::RENAME, kinds::ACK, "rename")
            .with_command::<RebootRequest, Ack>(kinds::REBOOT, kinds::ACK, "reboot")
            .with_message::<GestureEvent>(kinds::GESTURE, "gesture")
            .with_message::<AttachEvent>(kinds::ATTACH, "attach")
    }

    /// Register a message kind whose payload must decode as `M`.
    #[must_use]
    pub fn with_message<M: Message + Default>(mut self, kind: KindId, name: &'static str) -> Self {
        self.kinds.insert(
            kind,
            KindEntry {
                kind,
                name,
                schema: short_type_name::<M>(),
                response: None,
                validator: Some(validate_as::<M>),
            },
        );
        self
    }

    /// Register a request kind and the kind it is answered with.
    ///
    /// The response kind is registered too unless already present, so
    /// several requests can share one response kind (e.g. [`kinds::ACK`]).
    #[must_use]
    pub fn with_command<Req, Resp>(
        mut self,
        request: KindId,
        response: KindId,
        name: &'static str,
    ) -> Self
    where
        Req: Message + Default,
        Resp: Message + Default,
    {
        if !self.kinds.contains_key(&response) {
            self = self.with_message::<Resp>(response, name);
        }
        self = self.with_message::<Req>(request, name);
        if let Some(entry) = self.kinds.get_mut(&request) {
            entry.response = Some(response);
        }
        self
    }

    /// Register a kind whose payload is passed through unchecked.
    #[must_use]
    pub fn with_opaque(mut self, kind: KindId, name: &'static str) -> Self {
        self.kinds.insert(
            kind,
            KindEntry {
                kind,
                name,
                schema: "opaque",
                response: None,
                validator: None,
            },
        );
        self
    }

    /// Look up a kind.
    pub fn get(&self, kind: KindId) -> Option<&KindEntry> {
        self.kinds.get(&kind)
    }

    /// Whether the kind is registered.
    pub fn contains(&self, kind: KindId) -> bool {
        self.kinds.contains_key(&kind)
    }

    /// Kind a request is answered with; a request without a declared
    /// response is answered with its own kind.
    pub fn response_kind(&self, request: KindId) -> KindId {
        self.kinds
            .get(&request)
            .and_then(|entry| entry.response)
            .unwrap_or(request)
    }

    /// Name used in logs, `"unknown"` for unregistered kinds.
    pub fn name_of(&self, kind: KindId) -> &'static str {
        self.kinds.get(&kind).map_or("unknown", |entry| entry.name)
    }

    /// Validate a payload against the registered schema.
    pub fn validate(&self, kind: KindId, payload: &[u8]) -> Result<(), DecodeError> {
        self.kinds
            .get(&kind)
            .ok_or(DecodeError::UnknownKind(kind))?
            .validate(payload)
    }

    /// Number of registered kinds.
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

fn short_type_name<M>() -> &'static str {
    let full = std::any::type_name::<M>();
    full.rsplit("::").next().unwrap_or(full)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_link_requests_to_responses() {
        let kinds = KindRegistry::with_defaults();
        assert_eq!(kinds.response_kind(kinds::RENAME), kinds::ACK);
        assert_eq!(kinds.response_kind(kinds::REBOOT), kinds::ACK);
        assert_eq!(kinds.response_kind(kinds::BATTERY_REQUEST), kinds::BATTERY_STATUS);
        assert_eq!(kinds.response_kind(kinds::DEVICE_INFO_REQUEST), kinds::DEVICE_INFO);
    }

    #[test]
    fn test_shared_ack_keeps_its_own_name() {
        let kinds = KindRegistry::with_defaults();
        assert_eq!(kinds.name_of(kinds::ACK), "ack");
        assert_eq!(kinds.get(kinds::ACK).map(|s| s.schema), Some("Ack"));
    }

    #[test]
    fn test_unregistered_request_answers_with_itself() {
        let kinds = KindRegistry::new();
        assert_eq!(kinds.response_kind(KindId(0x7777)), KindId(0x7777));
        assert_eq!(kinds.name_of(KindId(0x7777)), "unknown");
    }

    #[test]
    fn test_validate_rejects_wrong_schema() {
        let kinds = KindRegistry::with_defaults();
        // Field 1 as length-delimited, but BatteryStatus.level is a varint.
        let garbage = [0x0A, 0x02, 0x41, 0x42];
        let err = kinds.validate(kinds::BATTERY_STATUS, &garbage).unwrap_err();
        assert!(matches!(err, DecodeError::SchemaMismatch { schema: "BatteryStatus", .. }));
    }

    #[test]
    fn test_validate_unknown_kind() {
        let kinds = KindRegistry::with_defaults();
        assert_eq!(
            kinds.validate(KindId(0xFFFF), &[]),
            Err(DecodeError::UnknownKind(KindId(0xFFFF)))
        );
    }

    #[test]
    fn test_opaque_accepts_anything() {
        let kinds = KindRegistry::new().with_opaque(KindId(9), "blob");
        assert!(kinds.validate(KindId(9), &[0xFF, 0xFF, 0xFF]).is_ok());
    }

    #[test]
    fn test_ack_status() {
        assert!(Ack::ok().is_ok());
        let rejected = Ack {
            status: AckStatus::Rejected as i32,
            message: "name too long".into(),
        };
        assert!(!rejected.is_ok());
    }
}
