//! Protocol timing and sizing configuration.
//!
//! Every constant the link protocol depends on lives here so that a deployment
//! can tune it without touching code. Defaults match the target firmware.
//! Configuration files are YAML; durations are written in milliseconds.
//!
//! ```yaml
//! drill:
//!   ack_timeout: 10000
//!   end_timeout: 30000
//!   grace_period: 3000
//! transfer:
//!   chunk_size: 200
//!   master_device: ET02
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{LinkError, Result};

/// Outbound write segmentation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
#[serde(default)]
pub struct FramingConfig {
    /// Largest single write handed to the transport.
    pub max_write_segment: usize,
    /// Pause between consecutive segments of one message.
    #[serde(with = "millis")]
    #[cfg_attr(feature = "tauri", specta(type = u64))]
    pub segment_pacing: Duration,
    /// Terminator appended to every outbound JSON message.
    pub line_terminator: String,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            max_write_segment: 100,
            segment_pacing: Duration::from_millis(100),
            line_terminator: "\r\n".to_string(),
        }
    }
}

/// Drill execution deadlines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
#[serde(default)]
pub struct DrillConfig {
    /// How long the readiness check waits for every target to ack.
    #[serde(with = "millis")]
    #[cfg_attr(feature = "tauri", specta(type = u64))]
    pub ack_timeout: Duration,
    /// How long an executing repeat waits for the last target's end signal.
    #[serde(with = "millis")]
    #[cfg_attr(feature = "tauri", specta(type = u64))]
    pub end_timeout: Duration,
    /// Window after a manual stop during which shots are still collected.
    #[serde(with = "millis")]
    #[cfg_attr(feature = "tauri", specta(type = u64))]
    pub grace_period: Duration,
}

impl Default for DrillConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(10),
            end_timeout: Duration::from_secs(30),
            grace_period: Duration::from_secs(3),
        }
    }
}

/// Chunked image transfer timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
#[serde(default)]
pub struct TransferConfig {
    /// Raw bytes per chunk before base64 encoding.
    pub chunk_size: usize,
    /// Deadline for the `image_transfer_ready` ack.
    #[serde(with = "millis")]
    #[cfg_attr(feature = "tauri", specta(type = u64))]
    pub ready_timeout: Duration,
    /// Pause between the ready ack and the start descriptor.
    #[serde(with = "millis")]
    #[cfg_attr(feature = "tauri", specta(type = u64))]
    pub handshake_settle: Duration,
    /// Pause between the start descriptor and the first chunk.
    #[serde(with = "millis")]
    #[cfg_attr(feature = "tauri", specta(type = u64))]
    pub start_settle: Duration,
    /// Pause between chunks.
    #[serde(with = "millis")]
    #[cfg_attr(feature = "tauri", specta(type = u64))]
    pub chunk_pacing: Duration,
    /// Inactivity deadline while receiving an image, re-armed on every chunk.
    #[serde(with = "millis")]
    #[cfg_attr(feature = "tauri", specta(type = u64))]
    pub receive_timeout: Duration,
    /// Wait for stragglers after the device reports completion early.
    #[serde(with = "millis")]
    #[cfg_attr(feature = "tauri", specta(type = u64))]
    pub completion_grace: Duration,
    /// Device that images are forwarded to.
    pub master_device: String,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 200,
            ready_timeout: Duration::from_secs(5),
            handshake_settle: Duration::from_millis(200),
            start_settle: Duration::from_millis(500),
            chunk_pacing: Duration::from_millis(200),
            receive_timeout: Duration::from_secs(10),
            completion_grace: Duration::from_millis(1500),
            master_device: "ET02".to_string(),
        }
    }
}

/// Top-level link configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
#[serde(default)]
pub struct LinkConfig {
    pub framing: FramingConfig,
    pub drill: DrillConfig,
    pub transfer: TransferConfig,
    /// Capacity of the inbound event bus.
    pub event_capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            framing: FramingConfig::default(),
            drill: DrillConfig::default(),
            transfer: TransferConfig::default(),
            event_capacity: 256,
        }
    }
}

impl LinkConfig {
    /// Parse and validate a YAML configuration document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: LinkConfig = serde_yaml_ng::from_str(yaml)
            .map_err(|e| LinkError::config("<inline>", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading link configuration");
        let yaml = std::fs::read_to_string(path)?;
        let config: LinkConfig = serde_yaml_ng::from_str(&yaml)
            .map_err(|e| LinkError::config(path, e.to_string()))?;
        config.validate().map_err(|e| match e {
            LinkError::Config { details, .. } => LinkError::config(path, details),
            other => other,
        })?;
        Ok(config)
    }

    /// Render the configuration as YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml_ng::to_string(self).map_err(|e| LinkError::config("<inline>", e.to_string()))
    }

    /// Reject values the protocol cannot run with.
    pub fn validate(&self) -> Result<()> {
        let fail = |details: &str| Err(LinkError::config("<inline>", details));
        if self.framing.max_write_segment == 0 {
            return fail("framing.max_write_segment must be positive");
        }
        if self.transfer.chunk_size == 0 {
            return fail("transfer.chunk_size must be positive");
        }
        if self.event_capacity == 0 {
            return fail("event_capacity must be positive");
        }
        if self.transfer.master_device.trim().is_empty() {
            return fail("transfer.master_device must not be empty");
        }
        Ok(())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
