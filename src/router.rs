//! Decoding of complete messages into typed [`Event`]s.
//!
//! The hub speaks loosely structured JSON. Dispatch looks at the top-level
//! `type`/`action` pair first and then at the forwarded `content` object,
//! whose `command`, `ack` or `notification` key decides the event. One
//! message may produce several events: a forwarded shot yields both the raw
//! [`Event::NetlinkForward`] and the decoded [`Event::Shot`].
//!
//! Routing never fails. Invalid JSON is logged and dropped; valid JSON with an
//! unknown shape becomes [`Event::Unrecognized`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, trace, warn};

use crate::types::{ShotData, lenient_f64};

/// Device announced in a netlink device list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
pub struct NetworkDevice {
    pub name: String,
    pub mode: String,
}

/// What a target acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckKind {
    Ready,
    End,
    ImageTransferReady,
    Other(String),
}

impl AckKind {
    fn parse(raw: &str) -> Self {
        match raw {
            "ready" => AckKind::Ready,
            "end" => AckKind::End,
            "image_transfer_ready" => AckKind::ImageTransferReady,
            other => AckKind::Other(other.to_string()),
        }
    }
}

/// Acknowledgment from a target.
#[derive(Debug, Clone, PartialEq)]
pub struct Ack {
    pub device: Option<String>,
    pub kind: AckKind,
    /// Delay the target will apply before its beep, as reported.
    pub delay_time: Option<String>,
    /// Seconds the target measured for the repeat, carried by `end` acks.
    pub drill_duration: Option<f64>,
}

/// Why the hub could not enter game-disk OTA mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtaFailure {
    GameDiskNotFound,
    Other { reason: String, message: String },
}

/// Over-the-air update lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtaEvent {
    GameDiskReady,
    GameDiskFailed(OtaFailure),
    ReadyToDownload,
    DownloadComplete { version: String },
    /// Version reported by a forwarding target.
    DeviceVersion(String),
    /// Version reported by the hub itself.
    HubVersion(String),
}

/// Typed view of one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    DeviceList(Vec<NetworkDevice>),
    /// Any forwarded message, with its reporting device and raw content.
    NetlinkForward { device: Option<String>, content: Map<String, Value> },
    Shot(ShotData),
    Ack(Ack),
    ImageTransferStart { total_chunks: Option<usize> },
    ImageChunk { chunk_index: usize, data: String },
    /// A chunk message without a usable index or payload.
    MalformedChunk { reason: String },
    ImageTransferComplete { chunks_sent: Option<usize> },
    AuthData(String),
    Ota(OtaEvent),
    /// Netlink is not enabled on the hub.
    NetlinkFailure(String),
    State(i64),
    Unrecognized(Value),
    /// The transport dropped; emitted by the link, never by [`route`].
    Disconnected,
}

/// Route one complete message string.
pub fn route(message: &str) -> Vec<Event> {
    match serde_json::from_str::<Value>(message) {
        Ok(value) => route_value(value),
        Err(e) => {
            warn!(len = message.len(), "Dropping unparseable message: {}", e);
            Vec::new()
        }
    }
}

/// Route an already parsed message.
pub fn route_value(value: Value) -> Vec<Event> {
    let Value::Object(json) = value else {
        return vec![Event::Unrecognized(value)];
    };

    let kind = str_field(&json, "type");
    let action = str_field(&json, "action");
    trace!(?kind, ?action, "Routing message");

    let events = match (kind, action) {
        (Some("auth_data"), _) => match json.get("content") {
            Some(Value::String(data)) => vec![Event::AuthData(data.clone())],
            Some(other) => vec![Event::AuthData(other.to_string())],
            None => Vec::new(),
        },
        (Some("notice"), Some("netlink_query_device_list")) if is_state(&json, "failure") => {
            let message = str_field(&json, "message").unwrap_or("Unknown error");
            vec![Event::NetlinkFailure(message.to_string())]
        }
        (Some("netlink"), Some("device_list")) => device_list(&json).into_iter().collect(),
        (Some("netlink"), Some("forward")) => forward(&json),
        (Some("notice"), Some("prepare_game_disk_ota")) if is_state(&json, "success") => {
            vec![Event::Ota(OtaEvent::GameDiskReady)]
        }
        (Some("notice"), Some("prepare_game_disk_ota")) if is_state(&json, "failure") => {
            vec![Event::Ota(OtaEvent::GameDiskFailed(ota_failure(&json)))]
        }
        (Some("forward"), _) if json.get("content").is_some_and(Value::is_object) => {
            forwarded_notification(&json).into_iter().collect()
        }
        _ if str_field(&json, "notification") == Some("download_complete") => {
            let version = str_field(&json, "version").unwrap_or_default().to_string();
            vec![Event::Ota(OtaEvent::DownloadComplete { version })]
        }
        (Some("version"), _) if json.contains_key("version") => {
            let version = str_field(&json, "version").unwrap_or_default().to_string();
            vec![Event::Ota(OtaEvent::HubVersion(version))]
        }
        (Some("state"), _) => match json.get("state_code").and_then(Value::as_i64) {
            Some(code) => vec![Event::State(code)],
            None => Vec::new(),
        },
        _ => top_level(&json).into_iter().collect(),
    };

    if events.is_empty() {
        debug!(?kind, ?action, "Unrecognized message shape");
        return vec![Event::Unrecognized(Value::Object(json))];
    }
    events
}

fn forward(json: &Map<String, Value>) -> Vec<Event> {
    let device = str_field(json, "device").map(str::to_string);
    let Some(content) = json.get("content").and_then(Value::as_object) else {
        return vec![Event::NetlinkForward { device, content: Map::new() }];
    };

    let mut events = vec![Event::NetlinkForward { device: device.clone(), content: content.clone() }];

    if let Some(ack) = str_field(content, "ack") {
        events.push(Event::Ack(Ack {
            device: device.or_else(|| str_field(content, "device").map(str::to_string)),
            kind: AckKind::parse(ack),
            delay_time: content.get("delay_time").and_then(value_to_string),
            drill_duration: content.get("drill_duration").and_then(lenient_f64),
        }));
        return events;
    }

    match command(content) {
        Some("shot") => match ShotData::from_message(json) {
            Ok(shot) => events.push(Event::Shot(shot)),
            Err(e) => warn!("Dropping shot: {}", e),
        },
        Some(cmd) => events.extend(image_event(cmd, content, json)),
        None => {}
    }
    events
}

/// Image transfer messages may arrive forwarded or bare.
fn top_level(json: &Map<String, Value>) -> Option<Event> {
    if let Some(ack) = str_field(json, "ack") {
        return Some(Event::Ack(Ack {
            device: str_field(json, "device").map(str::to_string),
            kind: AckKind::parse(ack),
            delay_time: json.get("delay_time").and_then(value_to_string),
            drill_duration: json.get("drill_duration").and_then(lenient_f64),
        }));
    }
    if let Some(content) = json.get("content").and_then(Value::as_object) {
        if let Some(ack) = str_field(content, "ack") {
            return Some(Event::Ack(Ack {
                device: str_field(json, "device").map(str::to_string),
                kind: AckKind::parse(ack),
                delay_time: content.get("delay_time").and_then(value_to_string),
                drill_duration: content.get("drill_duration").and_then(lenient_f64),
            }));
        }
        if let Some(cmd) = command(content) {
            return image_event(cmd, content, json);
        }
    }
    command(json).and_then(|cmd| image_event(cmd, json, json))
}

fn image_event(cmd: &str, content: &Map<String, Value>, outer: &Map<String, Value>) -> Option<Event> {
    match cmd {
        "image_transfer_start" => Some(Event::ImageTransferStart { total_chunks: usize_field(content, "total_chunks") }),
        "image_transfer_complete" => {
            Some(Event::ImageTransferComplete { chunks_sent: usize_field(content, "chunks_sent") })
        }
        "image_chunk" => {
            let index = usize_field(content, "chunk_index").or_else(|| usize_field(outer, "chunk_index"));
            let data = str_field(content, "data").or_else(|| str_field(outer, "data"));
            Some(match (index, data) {
                (Some(chunk_index), Some(data)) => Event::ImageChunk { chunk_index, data: data.to_string() },
                (None, _) => Event::MalformedChunk { reason: "missing chunk_index".to_string() },
                (_, None) => Event::MalformedChunk { reason: "missing data".to_string() },
            })
        }
        _ => None,
    }
}

fn device_list(json: &Map<String, Value>) -> Option<Event> {
    let data = json.get("data")?.as_array()?;
    let devices = data
        .iter()
        .filter_map(Value::as_object)
        .map(|device| NetworkDevice {
            name: str_field(device, "name").unwrap_or("Unknown").to_string(),
            mode: str_field(device, "mode").unwrap_or_default().to_string(),
        })
        .collect();
    Some(Event::DeviceList(devices))
}

fn ota_failure(json: &Map<String, Value>) -> OtaFailure {
    let reason = str_field(json, "failure_reason").unwrap_or("Unknown error");
    let message = str_field(json, "message").unwrap_or("Device failed to enter OTA mode");
    let not_found = |s: &str| s.to_lowercase().contains("game disk not found");
    if not_found(reason) || not_found(message) {
        OtaFailure::GameDiskNotFound
    } else {
        OtaFailure::Other { reason: reason.to_string(), message: message.to_string() }
    }
}

fn forwarded_notification(json: &Map<String, Value>) -> Option<Event> {
    let content = json.get("content")?.as_object()?;
    match str_field(content, "notification") {
        Some("ready_to_download") => Some(Event::Ota(OtaEvent::ReadyToDownload)),
        Some("download_complete") => Some(Event::Ota(OtaEvent::DownloadComplete {
            version: str_field(content, "version").unwrap_or_default().to_string(),
        })),
        _ if content.contains_key("version") => Some(Event::Ota(OtaEvent::DeviceVersion(
            str_field(content, "version").unwrap_or_default().to_string(),
        ))),
        _ => None,
    }
}

/// Same key precedence as [`ShotData::from_message`]: `cmd` wins.
fn command(obj: &Map<String, Value>) -> Option<&str> {
    str_field(obj, "cmd").or_else(|| str_field(obj, "command"))
}

fn str_field<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str)
}

fn usize_field(obj: &Map<String, Value>, key: &str) -> Option<usize> {
    obj.get(key).and_then(Value::as_u64).and_then(|n| usize::try_from(n).ok())
}

fn is_state(obj: &Map<String, Value>, state: &str) -> bool {
    str_field(obj, "state") == Some(state)
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
