//! Protocol engine for wearable BLE tags.
//!
//! This crate drives the client side of a tag: it connects over Bluetooth
//! Low Energy, frames and correlates protobuf commands, routes unsolicited
//! notifications to subscribers, and tracks the tag through its lifecycle.
//!
//! # Features
//!
//! - **Lifecycle**: `Advertised`/`PreConnected` → `Connecting` → `Connected` → `Disconnected`
//! - **Generations**: every connection mints a new [`SessionHandle`]; work tied
//!   to an older generation fails with [`CommandError::SessionInvalidated`]
//! - **Commands**: many in flight at once, matched by correlation token,
//!   each with its own timeout
//! - **Notifications**: typed per-kind subscriptions with bounded buffers
//! - **Reboot handling**: a tag that reboots after a rename or reboot
//!   command is reconnected automatically
//! - **Multi-tag**: [`TagManager`] keeps independent tags side by side
//! - **Testing**: [`MockTransport`] with a scripted firmware simulator
//!
//! # Data flow
//!
//! ```text
//! transport bytes ─► FrameAssembler ─► FrameCodec ─► generation gate
//!                                                      ├─► Correlator (token set)
//!                                                      └─► Router     (no token)
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use futures::StreamExt;
//! use weartag_core::{BleTransport, ConnectionEvent, EngineConfig, Tag, TagIdentity};
//! use weartag_core::protocol::{GestureEvent, kinds};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::default();
//!     let identity = TagIdentity::new("AA:BB:CC:DD:EE:01", "Jacket")?;
//!     let transport = Arc::new(BleTransport::new(identity.identifier(), config.ble.clone()));
//!     let tag = Tag::builder(identity, transport).config(config).build();
//!
//!     let mut events = tag.connect().await?;
//!     while let Some(event) = events.next().await {
//!         let ConnectionEvent::Connected(session) = event else {
//!             continue;
//!         };
//!         let battery = session.battery(Duration::from_secs(2)).await?;
//!         println!("Battery: {}%", battery.level);
//!
//!         let mut gestures = session.subscribe(kinds::GESTURE)?;
//!         while let Some(notification) = gestures.next().await {
//!             let gesture: GestureEvent = notification.decode()?;
//!             println!("Gesture: {:?}", gesture.gesture());
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod ble;
pub mod codec;
pub mod commands;
pub mod config;
mod correlator;
pub mod error;
pub mod events;
pub mod manager;
pub mod metrics;
pub mod mock;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod scan;
pub mod session;
pub mod tag;
pub mod transport;
pub mod util;

pub use ble::{BleTransport, BleTransportFactory};
pub use codec::{DEFAULT_MAX_FRAME_LEN, Frame, FrameAssembler, FrameCodec};
pub use commands::TagCommand;
pub use config::{BleConfig, EngineConfig, OverflowPolicy, ReconnectPolicy};
pub use error::{CommandError, DecodeError, Error, Result, TransportError};
pub use events::{ConnectionEvent, ConnectionEvents, StateDispatcher, StateReceiver};
pub use manager::TagManager;
pub use metrics::{LatencySummary, MetricsSnapshot, SessionMetrics};
pub use mock::{ConnectBehavior, MockAction, MockTransport, TagFirmware};
pub use protocol::KindRegistry;
pub use registry::{MemoryRegistry, TagRegistry, merge_identity};
pub use router::{Notification, Subscription, SubscriptionHandle};
pub use scan::{DiscoveredTag, ScanOptions};
pub use session::{Session, SessionHandle, TagState};
pub use tag::{Tag, TagBuilder};
pub use transport::{ByteStream, LinkEvent, LinkEventStream, Transport, TransportFactory};
pub use util::{create_identifier, format_peripheral_id};

pub use weartag_types::uuids;
pub use weartag_types::{DisconnectReason, KindId, TagIdentity, pairing_code_from_serial};
