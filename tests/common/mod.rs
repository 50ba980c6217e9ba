//! Shared harness for the integration tests: an in-memory hub that records
//! what the phone writes and lets a test play target notifications back.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use flexlink::{ByteSink, Link, LinkConfig, LinkError, NotifySource};
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};

pub struct FakeHub {
    buffer: Mutex<Vec<u8>>,
    connected: AtomicBool,
    sent: broadcast::Sender<Value>,
    log: Mutex<Vec<Value>>,
}

impl FakeHub {
    pub fn messages(&self) -> Vec<Value> {
        self.log.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.messages().iter().filter_map(|m| m["content"]["command"].as_str().map(String::from)).collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.sent.subscribe()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl ByteSink for FakeHub {
    async fn write(&self, bytes: &[u8]) -> flexlink::Result<()> {
        if !self.is_connected() {
            return Err(LinkError::disconnected("fake hub write"));
        }
        let complete: Vec<Vec<u8>> = {
            let mut buffer = self.buffer.lock().unwrap();
            buffer.extend_from_slice(bytes);
            let mut out = Vec::new();
            while let Some(pos) = buffer.windows(2).position(|w| w == b"\r\n") {
                let message: Vec<u8> = buffer.drain(..pos + 2).take(pos).collect();
                out.push(message);
            }
            out
        };
        for message in complete {
            let value: Value = serde_json::from_slice(&message).unwrap();
            self.log.lock().unwrap().push(value.clone());
            let _ = self.sent.send(value);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

pub struct Notifications(mpsc::UnboundedReceiver<Option<Vec<u8>>>);

#[async_trait::async_trait]
impl NotifySource for Notifications {
    async fn next_notification(&mut self) -> flexlink::Result<Option<Vec<u8>>> {
        Ok(self.0.recv().await.flatten())
    }
}

/// Target side of the fake hub.
#[derive(Clone)]
pub struct Targets(mpsc::UnboundedSender<Option<Vec<u8>>>);

impl Targets {
    /// Deliver `message` split into 20-byte notifications, as a small MTU would.
    pub fn notify(&self, message: &Value) {
        let mut bytes = message.to_string().into_bytes();
        bytes.extend_from_slice(b"\r\n");
        for piece in bytes.chunks(20) {
            let _ = self.0.send(Some(piece.to_vec()));
        }
    }

    pub fn disconnect(&self) {
        let _ = self.0.send(None);
    }

    pub fn ack(&self, device: &str, ack: &str) {
        self.notify(&json!({"type": "netlink", "action": "forward", "device": device, "content": {"ack": ack}}));
    }

    pub fn shot(&self, device: &str, hit_area: &str, repeat: u32) {
        self.notify(&json!({
            "type": "netlink", "action": "forward", "device": device,
            "content": {"cmd": "shot", "ha": hit_area, "hp": {"x": "120.5", "y": 88}, "tt": "ipsc", "td": 0.0, "rep": repeat}
        }));
    }
}

pub fn connect() -> (Link, Targets, Arc<FakeHub>) {
    connect_with(LinkConfig::default())
}

pub fn connect_with(config: LinkConfig) -> (Link, Targets, Arc<FakeHub>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (sent, _) = broadcast::channel(1024);
    let hub = Arc::new(FakeHub {
        buffer: Mutex::new(Vec::new()),
        connected: AtomicBool::new(true),
        sent,
        log: Mutex::new(Vec::new()),
    });
    let link = Link::spawn(Notifications(rx), hub.clone(), config);
    (link, Targets(tx), hub)
}

/// Wait for the next message written with this command or action.
pub async fn written(rx: &mut broadcast::Receiver<Value>, name: &str) -> Value {
    loop {
        let message = rx.recv().await.unwrap();
        if message["content"]["command"] == name || message["action"] == name {
            return message;
        }
    }
}
