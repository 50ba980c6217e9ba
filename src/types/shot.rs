//! Shot telemetry reported by targets

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::Instant;

use crate::{LinkError, Result};

/// Region of the target that registered a hit.
///
/// Parsing is case-insensitive and ignores surrounding whitespace; unknown
/// names are kept verbatim in [`HitArea::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HitArea {
    AZone,
    CZone,
    DZone,
    Miss,
    WhiteZone,
    BlackZone,
    CircleArea,
    PopperZone,
    Other(String),
}

impl HitArea {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "azone" => HitArea::AZone,
            "czone" => HitArea::CZone,
            "dzone" => HitArea::DZone,
            "miss" => HitArea::Miss,
            "whitezone" => HitArea::WhiteZone,
            "blackzone" => HitArea::BlackZone,
            "circlearea" => HitArea::CircleArea,
            "popperzone" => HitArea::PopperZone,
            _ => HitArea::Other(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            HitArea::AZone => "azone",
            HitArea::CZone => "czone",
            HitArea::DZone => "dzone",
            HitArea::Miss => "miss",
            HitArea::WhiteZone => "whitezone",
            HitArea::BlackZone => "blackzone",
            HitArea::CircleArea => "circlearea",
            HitArea::PopperZone => "popperzone",
            HitArea::Other(raw) => raw,
        }
    }

    /// No-shoot zones always penalize and are never subject to the best-two cap.
    pub fn is_no_shoot(&self) -> bool {
        matches!(self, HitArea::WhiteZone | HitArea::BlackZone)
    }
}

impl std::fmt::Display for HitArea {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for HitArea {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for HitArea {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(|raw| HitArea::parse(&raw))
    }
}

/// Point on the target face.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        Some(Self { x: lenient_f64(obj.get("x")?)?, y: lenient_f64(obj.get("y")?)? })
    }
}

/// One decoded shot notification.
///
/// Targets use both long (`hit_area`) and abbreviated (`ha`) keys depending on
/// firmware; abbreviated keys take precedence when both are present.
/// Serialization always uses the long keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
pub struct ShotData {
    /// Reporting device, from the envelope or the content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    /// Legacy target name used when `device` is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub command: String,
    #[cfg_attr(feature = "tauri", specta(type = String))]
    pub hit_area: HitArea,
    pub hit_position: Position,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_angle: Option<f64>,
    pub target_type: String,
    /// Seconds; device-relative when received, split time once finalized.
    pub time_diff: f64,
    #[serde(rename = "targetPos", default, skip_serializing_if = "Option::is_none")]
    pub target_pos: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat: Option<u32>,
}

impl ShotData {
    /// Decode a shot from a forwarded message (`{"device":..,"content":{..}}`).
    pub fn from_message(message: &Map<String, Value>) -> Result<Self> {
        let content = message
            .get("content")
            .and_then(Value::as_object)
            .ok_or_else(|| LinkError::malformed("shot message has no content object"))?;

        let command = first_str(content, &["cmd", "command"])
            .ok_or_else(|| LinkError::malformed("shot content has no command"))?
            .to_string();
        let hit_area = first_str(content, &["ha", "hitArea", "hit_area"])
            .map(HitArea::parse)
            .ok_or_else(|| LinkError::malformed("shot content has no hit area"))?;
        let hit_position = first(content, &["hp", "hit_position"])
            .and_then(Position::from_value)
            .ok_or_else(|| LinkError::malformed("shot content has no hit position"))?;
        let target_type =
            first_str(content, &["tt", "targetType", "target_type"]).unwrap_or_default().to_string();
        let time_diff =
            first(content, &["td", "timeDiff", "time_diff"]).and_then(lenient_f64).unwrap_or(0.0);
        let rotation_angle = first(content, &["rot", "rotation_angle"]).and_then(lenient_f64);
        let target_pos = first(content, &["tgt_pos", "targetPos"]).and_then(Position::from_value);
        let repeat = first(content, &["rep", "repeat"])
            .and_then(Value::as_u64)
            .and_then(|r| u32::try_from(r).ok());

        let device = message
            .get("device")
            .and_then(Value::as_str)
            .or_else(|| content.get("device").and_then(Value::as_str))
            .map(str::to_string);
        let target = message.get("target").and_then(Value::as_str).map(str::to_string);

        Ok(Self {
            device,
            target,
            command,
            hit_area,
            hit_position,
            rotation_angle,
            target_type,
            time_diff,
            target_pos,
            repeat,
        })
    }

    /// Identity used for grouping: the device, falling back to the target name.
    pub fn source(&self) -> Option<&str> {
        self.device.as_deref().or(self.target.as_deref())
    }
}

/// A shot together with the phone-side arrival time.
#[derive(Debug, Clone)]
pub struct ShotEvent {
    pub shot: ShotData,
    pub received_at: Instant,
}

impl ShotEvent {
    pub fn new(shot: ShotData, received_at: Instant) -> Self {
        Self { shot, received_at }
    }
}

fn first<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| obj.get(*key).filter(|v| !v.is_null()))
}

fn first_str<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| obj.get(*key).and_then(Value::as_str))
}

/// Numbers sometimes arrive as strings.
pub(crate) fn lenient_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
