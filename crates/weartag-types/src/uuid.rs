//! Bluetooth UUIDs for wearable tags.
//!
//! The tag exposes a single protocol service with one write characteristic
//! for outbound command frames and two notify characteristics: one for
//! command responses, one for unsolicited notifications. Both notify
//! characteristics feed the same inbound frame stream.

use uuid::{Uuid, uuid};

// --- Tag protocol service ---

/// Protocol service advertised by tags.
pub const TAG_SERVICE: Uuid = uuid!("d45c2000-4270-a125-a25d-ee458c085001");

/// Company identifier used in the tag's manufacturer data.
pub const MANUFACTURER_ID: u16 = 0x00e0;

/// Command characteristic (write).
pub const COMMAND: Uuid = uuid!("d45c2010-4270-a125-a25d-ee458c085001");

/// Response characteristic (notify).
pub const RESPONSE: Uuid = uuid!("d45c2030-4270-a125-a25d-ee458c085001");

/// Notification characteristic (notify).
pub const NOTIFICATION: Uuid = uuid!("d45c2040-4270-a125-a25d-ee458c085001");

// --- Standard BLE services ---

/// Generic Access Profile (GAP) service.
pub const GAP_SERVICE: Uuid = uuid!("00001800-0000-1000-8000-00805f9b34fb");

/// Device name characteristic.
pub const DEVICE_NAME: Uuid = uuid!("00002a00-0000-1000-8000-00805f9b34fb");
