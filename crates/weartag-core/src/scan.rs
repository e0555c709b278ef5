//! Tag discovery.
//!
//! Tags advertise the tag service and a manufacturer data record whose
//! payload is the ASCII serial number. A scan turns every such
//! advertisement into a [`DiscoveredTag`] whose [`TagState`] is either
//! `Advertised` (a new tag, showing its pairing code) or `PreConnected`
//! (already in the registry).

use std::time::Duration;

use btleplug::api::{Central, Manager as _, Peripheral as _, PeripheralProperties, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use weartag_types::uuids::{MANUFACTURER_ID, TAG_SERVICE};
use weartag_types::{TagIdentity, pairing_code_from_serial};

use crate::config::BleConfig;
use crate::error::{Error, Result};
use crate::registry::TagRegistry;
use crate::session::TagState;
use crate::util::{create_identifier, format_peripheral_id, normalize_address};

/// Scan attempts made by [`find_tag`] before giving up.
const FIND_ATTEMPTS: u32 = 3;

/// A tag seen during a scan.
#[derive(Debug, Clone)]
pub struct DiscoveredTag {
    /// Identity to connect with. Carries a pairing code for new tags.
    pub identity: TagIdentity,
    /// Peripheral ID for connecting.
    pub id: PeripheralId,
    /// RSSI signal strength.
    pub rssi: Option<i16>,
    /// Serial number from the manufacturer data, if advertised.
    pub serial: Option<String>,
    /// Whether the registry already knows this tag.
    pub known: bool,
}

impl DiscoveredTag {
    /// Initial lifecycle state for this tag.
    pub fn state(&self) -> TagState {
        TagState::initial(self.identity.clone())
    }
}

/// Options for scanning.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// How long to listen for advertisements.
    pub duration: Duration,
    /// Drop advertisements that do not look like a tag.
    pub tags_only: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            duration: BleConfig::default().scan_duration(),
            tags_only: true,
        }
    }
}

impl ScanOptions {
    /// Scan options taken from the BLE configuration.
    pub fn from_config(config: &BleConfig) -> Self {
        Self {
            duration: config.scan_duration(),
            ..Self::default()
        }
    }

    /// Set the scan duration.
    #[must_use]
    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Report every BLE peripheral, not just tags.
    #[must_use]
    pub fn all_devices(mut self) -> Self {
        self.tags_only = false;
        self
    }
}

/// Get the first available Bluetooth adapter.
pub async fn get_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    adapters.into_iter().next().ok_or(Error::NoAdapter)
}

/// Scan for tags on the first adapter.
pub async fn scan_with_options(
    options: ScanOptions,
    registry: &dyn TagRegistry,
) -> Result<Vec<DiscoveredTag>> {
    let adapter = get_adapter().await?;
    scan_with_adapter(&adapter, options, registry).await
}

/// Scan for tags using a specific adapter.
///
/// An empty list means nothing was in range; it is not an error.
#[tracing::instrument(level = "info", skip_all, fields(duration = ?options.duration))]
pub async fn scan_with_adapter(
    adapter: &Adapter,
    options: ScanOptions,
    registry: &dyn TagRegistry,
) -> Result<Vec<DiscoveredTag>> {
    info!("Starting BLE scan");
    adapter.start_scan(ScanFilter::default()).await?;
    sleep(options.duration).await;
    adapter.stop_scan().await?;

    let mut discovered = Vec::new();
    for peripheral in adapter.peripherals().await? {
        let properties = match peripheral.properties().await {
            Ok(Some(properties)) => properties,
            Ok(None) => continue,
            Err(e) => {
                debug!("Error reading peripheral properties: {}", e);
                continue;
            }
        };
        if options.tags_only && !is_tag(&properties) {
            continue;
        }
        let id = peripheral.id();
        let identifier = create_identifier(&properties.address.to_string(), &id);
        match classify(identifier, &properties, registry) {
            Ok((identity, known)) => {
                info!(tag = %identity.identifier(), known, "Found tag");
                discovered.push(DiscoveredTag {
                    identity,
                    id,
                    rssi: properties.rssi,
                    serial: advertised_serial(&properties),
                    known,
                });
            }
            Err(e) => debug!("Skipping peripheral: {}", e),
        }
    }

    info!("Scan complete. Found {} tag(s)", discovered.len());
    Ok(discovered)
}

/// Locate the peripheral for `identifier`.
///
/// Peripherals the adapter already knows are checked first. Otherwise up
/// to three scans of growing length are made, since advertisements are
/// easily missed.
pub async fn find_tag(
    adapter: &Adapter,
    identifier: &str,
    options: &ScanOptions,
) -> Result<Peripheral> {
    let wanted = identifier.to_lowercase();
    info!("Looking for tag: {}", identifier);

    if let Some(peripheral) = find_known_peripheral(adapter, &wanted).await? {
        debug!("Tag already known to the adapter");
        return Ok(peripheral);
    }

    let base = (options.duration / 2).max(Duration::from_secs(2));
    for attempt in 1..=FIND_ATTEMPTS {
        let duration = base * attempt;
        info!("Scan attempt {}/{} ({:?})", attempt, FIND_ATTEMPTS, duration);

        adapter.start_scan(ScanFilter::default()).await?;
        sleep(duration).await;
        adapter.stop_scan().await?;

        if let Some(peripheral) = find_known_peripheral(adapter, &wanted).await? {
            info!("Found tag on attempt {}", attempt);
            return Ok(peripheral);
        }
    }

    warn!("Tag not found after {} attempts: {}", FIND_ATTEMPTS, identifier);
    Err(Error::tag_not_found(identifier))
}

/// Search peripherals the adapter has already seen.
async fn find_known_peripheral(adapter: &Adapter, wanted: &str) -> Result<Option<Peripheral>> {
    for peripheral in adapter.peripherals().await? {
        let Ok(Some(properties)) = peripheral.properties().await else {
            continue;
        };
        if format_peripheral_id(&peripheral.id()).to_lowercase() == wanted {
            return Ok(Some(peripheral));
        }
        if let Some(address) = normalize_address(&properties.address.to_string())
            && address.to_lowercase() == wanted
        {
            return Ok(Some(peripheral));
        }
    }
    Ok(None)
}

/// Whether the advertisement belongs to a tag.
fn is_tag(properties: &PeripheralProperties) -> bool {
    properties.manufacturer_data.contains_key(&MANUFACTURER_ID)
        || properties.services.contains(&TAG_SERVICE)
        || properties.service_data.contains_key(&TAG_SERVICE)
}

/// Serial number carried in the manufacturer data, if any.
fn advertised_serial(properties: &PeripheralProperties) -> Option<String> {
    let data = properties.manufacturer_data.get(&MANUFACTURER_ID)?;
    let serial = String::from_utf8_lossy(data)
        .trim_matches(char::from(0))
        .trim()
        .to_string();
    (!serial.is_empty()).then_some(serial)
}

/// Identity for an advertisement, and whether the registry knows it.
fn classify(
    identifier: String,
    properties: &PeripheralProperties,
    registry: &dyn TagRegistry,
) -> Result<(TagIdentity, bool)> {
    let name = properties.local_name.clone().unwrap_or_default();
    let serial = advertised_serial(properties);

    Ok(match registry.get(&identifier)? {
        Some(known) if name.is_empty() => (known, true),
        Some(known) => (known.with_display_name(name), true),
        None => {
            // Without a serial the pairing code falls back to the identifier.
            let code = pairing_code_from_serial(serial.as_deref().unwrap_or(&identifier))?;
            (TagIdentity::unpaired(identifier, name, code)?, false)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRegistry;

    fn properties(address: &str, name: &str, serial: Option<&str>) -> PeripheralProperties {
        let mut properties = PeripheralProperties {
            address: address.parse().unwrap(),
            local_name: Some(name.to_string()),
            ..Default::default()
        };
        if let Some(serial) = serial {
            properties
                .manufacturer_data
                .insert(MANUFACTURER_ID, serial.as_bytes().to_vec());
        }
        properties
    }

    #[test]
    fn test_scan_options() {
        let options = ScanOptions::from_config(&BleConfig {
            scan_duration_secs: 9,
            ..BleConfig::default()
        });
        assert_eq!(options.duration, Duration::from_secs(9));
        assert!(options.tags_only);
        assert!(!options.all_devices().tags_only);
    }

    #[test]
    fn test_is_tag() {
        assert!(is_tag(&properties("AA:BB:CC:DD:EE:01", "x", Some("WT0001"))));
        assert!(!is_tag(&properties("AA:BB:CC:DD:EE:01", "Headphones", None)));

        let mut props = properties("AA:BB:CC:DD:EE:01", "x", None);
        props.services.push(TAG_SERVICE);
        assert!(is_tag(&props));
    }

    #[test]
    fn test_advertised_serial_trims_padding() {
        let props = properties("AA:BB:CC:DD:EE:01", "x", Some("WT00AB12\0\0"));
        assert_eq!(advertised_serial(&props).as_deref(), Some("WT00AB12"));
        assert_eq!(advertised_serial(&properties("AA:BB:CC:DD:EE:01", "x", None)), None);
    }

    #[test]
    fn test_new_tag_is_advertised_with_pairing_code() {
        let registry = MemoryRegistry::new();
        let (identity, known) = classify(
            "AA:BB:CC:DD:EE:01".to_string(),
            &properties("aa:bb:cc:dd:ee:01", "Tag", Some("WT00AB12")),
            &registry,
        )
        .unwrap();

        assert!(!known);
        assert!(matches!(
            TagState::initial(identity),
            TagState::Advertised { pairing_code, .. } if pairing_code == "AB12"
        ));
    }

    #[test]
    fn test_known_tag_is_pre_connected() {
        let registry = MemoryRegistry::new();
        registry
            .upsert(&TagIdentity::new("AA:BB:CC:DD:EE:01", "Jacket").unwrap())
            .unwrap();

        let (identity, known) = classify(
            "AA:BB:CC:DD:EE:01".to_string(),
            &properties("AA:BB:CC:DD:EE:01", "", Some("WT00AB12")),
            &registry,
        )
        .unwrap();

        assert!(known);
        assert_eq!(identity.display_name(), "Jacket");
        assert!(matches!(TagState::initial(identity), TagState::PreConnected { .. }));
    }

    #[test]
    fn test_pairing_code_falls_back_to_identifier() {
        let registry = MemoryRegistry::new();
        let (identity, _) = classify(
            "AA:BB:CC:DD:EE:01".to_string(),
            &properties("AA:BB:CC:DD:EE:01", "Tag", None),
            &registry,
        )
        .unwrap();
        assert_eq!(identity.pairing_code(), Some("EE01"));
    }
}
