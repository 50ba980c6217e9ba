//! Outbound wire messages.
//!
//! Every request is a JSON object tagged by `action`. Commands for a target
//! travel inside a `netlink_forward` envelope and are themselves tagged by
//! `command`:
//!
//! ```json
//! {"action":"netlink_forward","dest":"T-A","content":{"command":"ready",...}}
//! ```

use serde::{Deserialize, Serialize};

use super::DrillMode;
use crate::{LinkError, Result};

/// Recipient of a forwarded command.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Destination {
    All,
    Device(String),
}

impl From<String> for Destination {
    fn from(value: String) -> Self {
        if value == "all" { Destination::All } else { Destination::Device(value) }
    }
}

impl From<Destination> for String {
    fn from(value: Destination) -> Self {
        match value {
            Destination::All => "all".to_string(),
            Destination::Device(name) => name,
        }
    }
}

impl From<&str> for Destination {
    fn from(value: &str) -> Self {
        Destination::from(value.to_string())
    }
}

/// Top-level request written to the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Request {
    NetlinkForward { dest: Destination, content: Command },
    NetlinkQueryDeviceList,
    PrepareGameDiskOta,
    FinishGameDiskOta,
    RecoveryGameDiskOta,
    ReloadUi,
    RequestImage { request_type: String },
}

impl Request {
    pub fn forward(dest: impl Into<Destination>, content: Command) -> Self {
        Request::NetlinkForward { dest: dest.into(), content }
    }

    pub fn broadcast(content: Command) -> Self {
        Request::NetlinkForward { dest: Destination::All, content }
    }

    pub fn request_screenshot() -> Self {
        Request::RequestImage { request_type: "screenshot".to_string() }
    }

    /// Short label for logs and error context.
    pub fn name(&self) -> &'static str {
        match self {
            Request::NetlinkForward { content, .. } => content.name(),
            Request::NetlinkQueryDeviceList => "netlink_query_device_list",
            Request::PrepareGameDiskOta => "prepare_game_disk_ota",
            Request::FinishGameDiskOta => "finish_game_disk_ota",
            Request::RecoveryGameDiskOta => "recovery_game_disk_ota",
            Request::ReloadUi => "reload_ui",
            Request::RequestImage { .. } => "request_image",
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| LinkError::serialization(self.name(), e))
    }
}

/// A request serialized ahead of transmission.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub request: Request,
    pub json: String,
}

impl Outbound {
    pub fn new(request: Request) -> Result<Self> {
        let json = request.to_json()?;
        Ok(Self { request, json })
    }

    pub fn name(&self) -> &'static str {
        self.request.name()
    }
}

/// Command carried in a `netlink_forward` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Ready(ReadyCommand),
    Start {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delay_time: Option<String>,
    },
    End,
    AnimationConfig {
        action: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration: Option<f64>,
    },
    ImageTransferReady,
    ImageTransferStart { chunk_size: usize, image_name: String, total_chunks: usize, total_size: usize },
    ImageChunk { chunk_index: usize, data: String },
    ImageTransferComplete { status: String },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Ready(_) => "ready",
            Command::Start { .. } => "start",
            Command::End => "end",
            Command::AnimationConfig { .. } => "animation_config",
            Command::ImageTransferReady => "image_transfer_ready",
            Command::ImageTransferStart { .. } => "image_transfer_start",
            Command::ImageChunk { .. } => "image_chunk",
            Command::ImageTransferComplete { .. } => "image_transfer_complete",
        }
    }
}

/// Content of a `ready` command.
///
/// Disguised-enemy targets receive only `mode` and `targetType`; all other
/// fields are then omitted from the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyCommand {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<f64>,
    pub target_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counted_shots: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_first: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_last: Option<bool>,
    pub mode: DrillMode,
}

impl ReadyCommand {
    pub fn disguised_enemy() -> Self {
        Self {
            delay: None,
            target_type: "disguised_enemy".to_string(),
            timeout: None,
            counted_shots: None,
            repeat: None,
            is_first: None,
            is_last: None,
            mode: DrillMode::Cqb,
        }
    }
}

/// Round to two decimals, the precision targets expect for delays.
pub fn round_delay(delay: f64) -> f64 {
    (delay * 100.0).round() / 100.0
}
