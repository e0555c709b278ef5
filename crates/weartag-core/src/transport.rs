//! Transport adapter contract.
//!
//! The engine never touches radio APIs directly. Everything it needs from
//! the link is behind [`Transport`]: [`BleTransport`](crate::ble::BleTransport)
//! implements it over btleplug, [`MockTransport`](crate::mock::MockTransport)
//! in-process for tests.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use weartag_types::{DisconnectReason, TagIdentity};

use crate::error::TransportError;

/// Raw inbound bytes, in arrival order. Chunk boundaries carry no meaning.
pub type ByteStream = BoxStream<'static, Bytes>;

/// Link-level connection events.
pub type LinkEventStream = BoxStream<'static, LinkEvent>;

/// Link-level event reported by the radio stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The radio link came up.
    Connected,
    /// The radio link went down.
    Disconnected(DisconnectReason),
}

/// Physical link to one tag.
///
/// Implementations must be safe to share between the session driver and
/// command callers. The engine serializes writes itself, so `write` is
/// never called concurrently for the same tag.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the link.
    ///
    /// There is no timeout: the call either succeeds, fails with a terminal
    /// error, or stays pending until the caller drops it.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Tear the link down.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Write one encoded frame.
    async fn write(&self, bytes: Bytes) -> Result<(), TransportError>;

    /// Inbound bytes for the current link. Ends when the link closes.
    async fn byte_stream(&self) -> Result<ByteStream, TransportError>;

    /// Link events for the current link.
    async fn link_events(&self) -> Result<LinkEventStream, TransportError>;
}

/// Creates transports for tags managed by a [`TagManager`](crate::manager::TagManager).
pub trait TransportFactory: Send + Sync {
    /// Transport for the given tag. Must not perform I/O.
    fn transport_for(&self, identity: &TagIdentity) -> Arc<dyn Transport>;
}

impl<F> TransportFactory for F
where
    F: Fn(&TagIdentity) -> Arc<dyn Transport> + Send + Sync,
{
    fn transport_for(&self, identity: &TagIdentity) -> Arc<dyn Transport> {
        self(identity)
    }
}
