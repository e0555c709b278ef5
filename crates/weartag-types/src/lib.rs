//! Platform-agnostic types for wearable BLE tags.
//!
//! This crate provides the identity, lifecycle and protocol-discriminator
//! types shared by the protocol engine (weartag-core) and the persistent
//! registry (weartag-store).
//!
//! # Example
//!
//! ```
//! use weartag_types::{TagIdentity, pairing_code_from_serial};
//!
//! let identity = TagIdentity::new("AA:BB", "Jacket tag").unwrap();
//! assert_eq!(identity.display_name(), "Jacket tag");
//! assert_eq!(pairing_code_from_serial("0A1B-2C3D").unwrap(), "2C3D");
//! ```

pub mod error;
pub mod types;
pub mod uuid;

pub use error::{ParseError, ParseResult};
pub use types::{DisconnectReason, KindId, TagIdentity, pairing_code_from_serial};
pub use uuid as uuids;
