//! Engine configuration.
//!
//! Every field has a default, so an empty TOML document is a valid
//! configuration:
//!
//! ```toml
//! max_frame_len = 4096
//! notification_buffer = 32
//! overflow = "drop_newest"
//!
//! [reconnect]
//! after_remote_reboot = true
//! after_link_loss = false
//! delay_ms = 1000
//!
//! [ble]
//! write_chunk_len = 180
//! write_with_response = true
//! scan_duration_secs = 5
//! ```
//!
//! There is no connection timeout and no global command timeout. A pending
//! connect is cancelled by the caller; command timeouts are passed per call.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use weartag_types::DisconnectReason;

use crate::codec::DEFAULT_MAX_FRAME_LEN;
use crate::error::{Error, Result};

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Largest accepted frame body in bytes.
    pub max_frame_len: usize,
    /// Queue depth of each notification subscriber.
    pub notification_buffer: usize,
    /// What happens when a subscriber queue is full.
    pub overflow: OverflowPolicy,
    /// Capacity of the per-tag state broadcast channel.
    pub state_event_capacity: usize,
    /// When the engine re-enters `Connecting` on its own.
    pub reconnect: ReconnectPolicy,
    /// btleplug transport settings.
    pub ble: BleConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            notification_buffer: 32,
            overflow: OverflowPolicy::default(),
            state_event_capacity: 64,
            reconnect: ReconnectPolicy::default(),
            ble: BleConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::invalid_config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Serialize to pretty TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::invalid_config(e.to_string()))
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.max_frame_len == 0 {
            return Err(Error::invalid_config("max_frame_len must be > 0"));
        }
        if self.notification_buffer == 0 {
            return Err(Error::invalid_config("notification_buffer must be > 0"));
        }
        if self.state_event_capacity == 0 {
            return Err(Error::invalid_config("state_event_capacity must be > 0"));
        }
        if self.ble.write_chunk_len == 0 {
            return Err(Error::invalid_config("ble.write_chunk_len must be > 0"));
        }
        Ok(())
    }
}

/// Policy for a subscriber whose queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Drop the new notification for that subscriber only.
    #[default]
    DropNewest,
    /// Terminate the subscriber's stream.
    Unsubscribe,
}

/// Automatic re-entry into `Connecting` after the link goes down.
///
/// A failed connect attempt is never retried, whatever the policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Reconnect after a reboot the tag announced by acknowledging a
    /// reboot-inducing command.
    pub after_remote_reboot: bool,
    /// Reconnect after an unexplained link loss.
    pub after_link_loss: bool,
    /// Pause before reconnecting, in milliseconds.
    pub delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            after_remote_reboot: true,
            after_link_loss: false,
            delay_ms: 1000,
        }
    }
}

impl ReconnectPolicy {
    /// Never reconnect automatically.
    pub fn never() -> Self {
        Self {
            after_remote_reboot: false,
            after_link_loss: false,
            delay_ms: 0,
        }
    }

    /// Pause before reconnecting.
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Whether the driver re-enters `Connecting` after a session ended
    /// with `reason`.
    pub fn allows(&self, reason: &DisconnectReason) -> bool {
        match reason {
            DisconnectReason::RemoteReboot => self.after_remote_reboot,
            DisconnectReason::LinkLost => self.after_link_loss,
            _ => false,
        }
    }
}

/// Settings for the btleplug transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    /// Largest write sent in one GATT operation.
    pub write_chunk_len: usize,
    /// Use acknowledged writes on the command characteristic.
    pub write_with_response: bool,
    /// How long a scan listens for advertisements.
    pub scan_duration_secs: u64,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            write_chunk_len: 180,
            write_with_response: true,
            scan_duration_secs: 5,
        }
    }
}

impl BleConfig {
    /// Scan duration as a [`Duration`].
    pub fn scan_duration(&self) -> Duration {
        Duration::from_secs(self.scan_duration_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.max_frame_len, 4096);
        assert!(config.reconnect.after_remote_reboot);
        assert!(!config.reconnect.after_link_loss);
    }

    #[test]
    fn test_partial_document() {
        let config = EngineConfig::from_toml_str(
            r#"
            notification_buffer = 4
            overflow = "unsubscribe"

            [reconnect]
            after_link_loss = true
            "#,
        )
        .unwrap();
        assert_eq!(config.notification_buffer, 4);
        assert_eq!(config.overflow, OverflowPolicy::Unsubscribe);
        assert!(config.reconnect.after_link_loss);
        assert_eq!(config.reconnect.delay_ms, 1000);
        assert_eq!(config.ble, BleConfig::default());
    }

    #[test]
    fn test_zero_buffer_rejected() {
        let err = EngineConfig::from_toml_str("notification_buffer = 0").unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_bad_toml_rejected() {
        let err = EngineConfig::from_toml_str("overflow = \"block\"").unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_round_trip_through_file() {
        let mut config = EngineConfig::default();
        config.ble.write_chunk_len = 20;
        config.reconnect = ReconnectPolicy::never();

        let dir = std::env::temp_dir().join(format!("weartag-config-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("engine.toml");
        fs::write(&path, config.to_toml_string().unwrap()).unwrap();

        assert_eq!(EngineConfig::load(&path).unwrap(), config);
        fs::remove_dir_all(&dir).unwrap();
    }
}
