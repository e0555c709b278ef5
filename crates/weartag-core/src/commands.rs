//! Typed tag commands.
//!
//! A command is a protobuf request message tied to its request kind and the
//! message the tag answers with. [`Session::execute`](crate::Session::execute)
//! handles tokens, decoding and rejection checks for any [`TagCommand`].
//!
//! # Example
//!
//! ```ignore
//! use weartag_core::commands::TagCommand;
//! use weartag_core::protocol::BatteryRequest;
//! use std::time::Duration;
//!
//! let status = session.execute(&BatteryRequest {}, Duration::from_secs(2)).await?;
//! println!("battery at {}%", status.level);
//! ```

use prost::Message;

use weartag_types::KindId;

use crate::protocol::{
    Ack, AckStatus, BatteryRequest, BatteryStatus, DeviceInfo, DeviceInfoRequest, RebootRequest,
    RenameRequest, kinds,
};

/// A request the tag answers with exactly one response frame.
pub trait TagCommand: Message + Default {
    /// Message the tag answers with.
    type Response: Message + Default;

    /// Request kind on the wire.
    const KIND: KindId;

    /// The tag reboots after accepting this command.
    ///
    /// The session resolves such a command on acknowledgement; the link
    /// loss that follows is reported as a remote reboot.
    const REBOOTS_TAG: bool = false;

    /// Failure message if the response is a refusal.
    fn rejection(_response: &Self::Response) -> Option<String> {
        None
    }
}

/// Turn a non-ok [`Ack`] into a rejection message.
fn ack_rejection(ack: &Ack) -> Option<String> {
    if ack.is_ok() {
        return None;
    }
    if ack.message.is_empty() {
        let status = AckStatus::try_from(ack.status)
            .map_or_else(|_| format!("status {}", ack.status), |s| format!("{s:?}"));
        Some(status)
    } else {
        Some(ack.message.clone())
    }
}

impl TagCommand for DeviceInfoRequest {
    type Response = DeviceInfo;
    const KIND: KindId = kinds::DEVICE_INFO_REQUEST;
}

impl TagCommand for BatteryRequest {
    type Response = BatteryStatus;
    const KIND: KindId = kinds::BATTERY_REQUEST;
}

impl TagCommand for RenameRequest {
    type Response = Ack;
    const KIND: KindId = kinds::RENAME;
    const REBOOTS_TAG: bool = true;

    fn rejection(response: &Ack) -> Option<String> {
        ack_rejection(response)
    }
}

impl TagCommand for RebootRequest {
    type Response = Ack;
    const KIND: KindId = kinds::REBOOT;
    const REBOOTS_TAG: bool = true;

    fn rejection(response: &Ack) -> Option<String> {
        ack_rejection(response)
    }
}

/// Whether an encoded response accepts command `C`.
pub(crate) fn accepts<C: TagCommand>(payload: &[u8]) -> bool {
    C::Response::decode(payload).is_ok_and(|response| C::rejection(&response).is_none())
}
