//! btleplug transport.
//!
//! A tag exposes one GATT service with three characteristics: commands
//! are written to [`COMMAND`], command responses arrive as notifications
//! on [`RESPONSE`] and unsolicited events on [`NOTIFICATION`]. Both
//! notification characteristics feed one [`ByteStream`] in arrival order.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Characteristic, Peripheral as _, WriteType};
use btleplug::platform::{Adapter, Peripheral};
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use weartag_types::uuids::{COMMAND, NOTIFICATION, RESPONSE};
use weartag_types::{DisconnectReason, TagIdentity};

use crate::config::BleConfig;
use crate::error::{Error, TransportError};
use crate::scan::{ScanOptions, find_tag, get_adapter};
use crate::transport::{ByteStream, LinkEvent, LinkEventStream, Transport, TransportFactory};
use crate::util::format_peripheral_id;

/// An established GATT link.
struct Link {
    adapter: Adapter,
    peripheral: Peripheral,
    command: Characteristic,
    subscribed: Vec<Characteristic>,
}

/// [`Transport`] over a btleplug peripheral.
///
/// The peripheral is located on every [`connect`](Transport::connect), so
/// one transport survives tag reboots and address caches going stale.
pub struct BleTransport {
    identifier: String,
    config: BleConfig,
    link: Mutex<Option<Link>>,
}

impl std::fmt::Debug for BleTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleTransport")
            .field("identifier", &self.identifier)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BleTransport {
    /// Transport for the tag with the given address or peripheral ID.
    pub fn new(identifier: impl Into<String>, config: BleConfig) -> Self {
        Self {
            identifier: identifier.into(),
            config,
            link: Mutex::new(None),
        }
    }

    /// Identifier this transport connects to.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn locate(&self) -> Result<(Adapter, Peripheral), TransportError> {
        let adapter = get_adapter().await.map_err(link_error)?;
        let options = ScanOptions::from_config(&self.config);
        let peripheral = find_tag(&adapter, &self.identifier, &options)
            .await
            .map_err(link_error)?;
        Ok((adapter, peripheral))
    }

    async fn peripheral(&self) -> Result<(Adapter, Peripheral), TransportError> {
        let link = self.link.lock().await;
        let link = link.as_ref().ok_or(TransportError::NotConnected)?;
        Ok((link.adapter.clone(), link.peripheral.clone()))
    }
}

#[async_trait]
impl Transport for BleTransport {
    #[tracing::instrument(level = "info", skip(self), fields(tag = %self.identifier))]
    async fn connect(&self) -> Result<(), TransportError> {
        let (adapter, peripheral) = self.locate().await?;

        info!("Connecting to tag...");
        peripheral.connect().await?;
        info!("Connected, discovering services...");
        peripheral.discover_services().await?;

        let characteristics = characteristic_table(&peripheral);
        let service_count = peripheral.services().len();
        let lookup = |uuid: Uuid| {
            characteristics.get(&uuid).cloned().ok_or_else(|| {
                TransportError::CharacteristicNotFound {
                    uuid: uuid.to_string(),
                    service_count,
                }
            })
        };

        let setup = async {
            let command = lookup(COMMAND)?;
            let mut subscribed = Vec::with_capacity(2);
            for uuid in [RESPONSE, NOTIFICATION] {
                let characteristic = lookup(uuid)?;
                peripheral.subscribe(&characteristic).await?;
                subscribed.push(characteristic);
            }
            Ok::<_, TransportError>((command, subscribed))
        };
        let (command, subscribed) = match setup.await {
            Ok(found) => found,
            Err(error) => {
                let _ = peripheral.disconnect().await;
                return Err(error);
            }
        };

        debug!(
            "Cached {} characteristics, subscribed to {}",
            characteristics.len(),
            subscribed.len()
        );
        *self.link.lock().await = Some(Link {
            adapter,
            peripheral,
            command,
            subscribed,
        });
        Ok(())
    }

    #[tracing::instrument(level = "info", skip(self), fields(tag = %self.identifier))]
    async fn disconnect(&self) -> Result<(), TransportError> {
        let Some(link) = self.link.lock().await.take() else {
            return Ok(());
        };
        info!("Disconnecting from tag...");
        for characteristic in &link.subscribed {
            if let Err(e) = link.peripheral.unsubscribe(characteristic).await {
                debug!("Unsubscribe from {} failed: {}", characteristic.uuid, e);
            }
        }
        link.peripheral.disconnect().await?;
        Ok(())
    }

    async fn write(&self, bytes: Bytes) -> Result<(), TransportError> {
        let link = self.link.lock().await;
        let link = link.as_ref().ok_or(TransportError::NotConnected)?;
        let write_type = if self.config.write_with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        for chunk in bytes.chunks(self.config.write_chunk_len.max(1)) {
            link.peripheral
                .write(&link.command, chunk, write_type)
                .await
                .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        }
        Ok(())
    }

    async fn byte_stream(&self) -> Result<ByteStream, TransportError> {
        let (_, peripheral) = self.peripheral().await?;
        let notifications = peripheral.notifications().await?;
        Ok(notifications
            .filter_map(|notification| async move {
                (notification.uuid == RESPONSE || notification.uuid == NOTIFICATION)
                    .then(|| Bytes::from(notification.value))
            })
            .boxed())
    }

    async fn link_events(&self) -> Result<LinkEventStream, TransportError> {
        let (adapter, peripheral) = self.peripheral().await?;
        let id = peripheral.id();
        let events = adapter.events().await?;
        Ok(events
            .filter_map(move |event| {
                let id = id.clone();
                async move {
                    match event {
                        CentralEvent::DeviceConnected(peer) if peer == id => {
                            Some(LinkEvent::Connected)
                        }
                        CentralEvent::DeviceDisconnected(peer) if peer == id => {
                            Some(LinkEvent::Disconnected(DisconnectReason::LinkLost))
                        }
                        _ => None,
                    }
                }
            })
            .boxed())
    }
}

impl Drop for BleTransport {
    fn drop(&mut self) {
        let Ok(mut link) = self.link.try_lock() else {
            return;
        };
        let Some(link) = link.take() else {
            return;
        };
        let peripheral = link.peripheral;
        let address = format_peripheral_id(&peripheral.id());
        warn!(
            tag = %self.identifier,
            "Transport dropped while connected, performing best-effort disconnect"
        );
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = peripheral.disconnect().await {
                    debug!(peripheral = %address, error = %e, "Best-effort disconnect failed");
                }
            });
        }
    }
}

/// Every discovered characteristic by UUID.
fn characteristic_table(peripheral: &Peripheral) -> HashMap<Uuid, Characteristic> {
    let mut table = HashMap::new();
    for service in peripheral.services() {
        debug!("  Service: {}", service.uuid);
        for characteristic in service.characteristics {
            table.insert(characteristic.uuid, characteristic);
        }
    }
    table
}

/// Map a discovery failure onto the link error it causes.
fn link_error(error: Error) -> TransportError {
    match error {
        Error::Bluetooth(e) => TransportError::Bluetooth(e),
        Error::Transport(e) => e,
        Error::TagNotFound { identifier } => TransportError::TagNotFound(identifier),
        other => TransportError::ConnectFailed(other.to_string()),
    }
}

/// Creates a [`BleTransport`] per tag.
#[derive(Debug, Clone, Default)]
pub struct BleTransportFactory {
    config: BleConfig,
}

impl BleTransportFactory {
    pub fn new(config: BleConfig) -> Self {
        Self { config }
    }
}

impl TransportFactory for BleTransportFactory {
    fn transport_for(&self, identity: &TagIdentity) -> Arc<dyn Transport> {
        Arc::new(BleTransport::new(identity.identifier(), self.config.clone()))
    }
}
