//! Test doubles and fixtures for the link.
//!
//! [`MockSink`] records every write and republishes each complete outbound
//! message; [`scripted_source`] returns a [`NotifySource`] fed from a handle
//! the test controls. The fixture builders produce the JSON that targets send.

#![cfg(any(test, feature = "benchmark"))]

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use crate::channel::{ByteSink, NotifySource};
use crate::types::{DrillSetup, HitArea, Position, Request, ShotData, ShotEvent, TargetConfig};
use crate::{LinkError, Result};

const TERMINATOR: &[u8] = b"\r\n";

/// Recording [`ByteSink`].
pub struct MockSink {
    writes: Mutex<Vec<Vec<u8>>>,
    pending: Mutex<Vec<u8>>,
    connected: AtomicBool,
    attempts: AtomicUsize,
    fail_at: Mutex<Option<usize>>,
    sent: broadcast::Sender<Value>,
}

impl Default for MockSink {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSink {
    pub fn new() -> Self {
        let (sent, _) = broadcast::channel(1024);
        Self {
            writes: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
            attempts: AtomicUsize::new(0),
            fail_at: Mutex::new(None),
            sent,
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Fail the write attempt with this zero-based index.
    pub fn fail_write_at(&self, attempt: usize) {
        *self.fail_at.lock().unwrap() = Some(attempt);
    }

    /// Successful raw writes, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    /// Every complete message written so far, as JSON.
    pub fn messages(&self) -> Vec<Value> {
        let bytes = self.writes().concat();
        split_messages(&bytes).iter().filter_map(|m| serde_json::from_slice(m).ok()).collect()
    }

    /// Every complete message written so far, as requests.
    pub fn requests(&self) -> Vec<Request> {
        self.messages().into_iter().filter_map(|v| serde_json::from_value(v).ok()).collect()
    }

    /// Commands (`content.command`) of forwarded messages, in order.
    pub fn commands(&self) -> Vec<String> {
        self.messages().iter().filter_map(|m| m["content"]["command"].as_str().map(str::to_string)).collect()
    }

    /// Complete messages written after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.sent.subscribe()
    }
}

#[async_trait::async_trait]
impl ByteSink for MockSink {
    async fn write(&self, bytes: &[u8]) -> Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if *self.fail_at.lock().unwrap() == Some(attempt) {
            return Err(LinkError::write_failed(format!("mock failure on write {attempt}")));
        }
        if !self.is_connected() {
            return Err(LinkError::disconnected("mock write"));
        }
        self.writes.lock().unwrap().push(bytes.to_vec());

        let complete = {
            let mut pending = self.pending.lock().unwrap();
            pending.extend_from_slice(bytes);
            let mut complete = Vec::new();
            while let Some(pos) = pending.windows(2).position(|w| w == TERMINATOR) {
                let rest = pending.split_off(pos + 2);
                let mut message = std::mem::replace(&mut *pending, rest);
                message.truncate(pos);
                complete.push(message);
            }
            complete
        };
        for message in complete {
            if let Ok(value) = serde_json::from_slice(&message) {
                let _ = self.sent.send(value);
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

fn split_messages(bytes: &[u8]) -> Vec<&[u8]> {
    let mut out = Vec::new();
    let mut rest = bytes;
    while let Some(pos) = rest.windows(2).position(|w| w == TERMINATOR) {
        out.push(&rest[..pos]);
        rest = &rest[pos + 2..];
    }
    out
}

/// Wait for the next outbound message whose command or action is `name`.
pub async fn next_sent(rx: &mut broadcast::Receiver<Value>, name: &str) -> Value {
    loop {
        let message = rx.recv().await.expect("mock sink closed");
        if message["content"]["command"] == name || message["action"] == name {
            return message;
        }
    }
}

/// [`NotifySource`] fed from a [`SourceHandle`].
pub struct ScriptedSource {
    rx: mpsc::UnboundedReceiver<Option<Vec<u8>>>,
}

/// Test side of a [`ScriptedSource`].
#[derive(Clone)]
pub struct SourceHandle {
    tx: mpsc::UnboundedSender<Option<Vec<u8>>>,
}

pub fn scripted_source() -> (ScriptedSource, SourceHandle) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ScriptedSource { rx }, SourceHandle { tx })
}

impl SourceHandle {
    pub fn push(&self, bytes: impl Into<Vec<u8>>) {
        let _ = self.tx.send(Some(bytes.into()));
    }

    /// Push one message followed by a `\r\n` terminator notification.
    pub fn push_json(&self, message: &Value) {
        self.push(message.to_string());
        self.push(TERMINATOR.to_vec());
    }

    pub fn disconnect(&self) {
        let _ = self.tx.send(None);
    }
}

#[async_trait::async_trait]
impl NotifySource for ScriptedSource {
    async fn next_notification(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.rx.recv().await.flatten())
    }
}

/// A forwarded shot notification.
pub fn shot_json(device: &str, hit_area: &str, repeat: Option<u32>) -> Value {
    let mut content = json!({
        "cmd": "shot",
        "ha": hit_area,
        "hp": {"x": 200.0, "y": 300.0},
        "tt": "ipsc",
        "td": 1.0,
    });
    if let Some(repeat) = repeat {
        content["rep"] = json!(repeat);
    }
    json!({"type": "netlink", "action": "forward", "device": device, "content": content})
}

/// A forwarded acknowledgment.
pub fn ack_json(device: &str, ack: &str) -> Value {
    json!({"type": "netlink", "action": "forward", "device": device, "content": {"ack": ack}})
}

pub fn shot_data(device: &str, hit_area: &str, time_diff: f64) -> ShotData {
    ShotData {
        device: Some(device.to_string()),
        target: None,
        command: "shot".to_string(),
        hit_area: HitArea::parse(hit_area),
        hit_position: Position::new(200.0, 300.0),
        rotation_angle: None,
        target_type: "ipsc".to_string(),
        time_diff,
        target_pos: None,
        repeat: None,
    }
}

pub fn shot_event(device: &str, hit_area: &str, time_diff: f64, received_at: Instant) -> ShotEvent {
    ShotEvent::new(shot_data(device, hit_area, time_diff), received_at)
}

/// Two IPSC targets, `T-A` (seq 0) and `T-B` (seq 1).
pub fn two_target_setup() -> DrillSetup {
    DrillSetup::new(vec![TargetConfig::new(0, "T-A", "ipsc"), TargetConfig::new(1, "T-B", "ipsc")])
}
