//! Link spawns and manages the inbound side of one BLE connection

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::channel::{ByteSink, MessageWriter, NotifySource};
use crate::config::LinkConfig;
use crate::framing::FrameReassembler;
use crate::router::{self, Event};
use crate::types::Request;
use crate::Result;

/// A connected hub.
///
/// Spawns a reader task that owns the [`NotifySource`], reassembles
/// notifications into messages, routes them and publishes the resulting
/// [`Event`]s on a broadcast bus. Consumers (drill runner, image transfers,
/// the host UI) subscribe independently. The outbound side is a shared
/// [`MessageWriter`].
///
/// Dropping the `Link` cancels the reader task.
pub struct Link {
    events: broadcast::Sender<Event>,
    writer: MessageWriter,
    config: LinkConfig,
    cancel: CancellationToken,
}

impl Link {
    /// Spawn the reader task for `source` and wrap `sink` for writing.
    pub fn spawn<S>(source: S, sink: Arc<dyn ByteSink>, config: LinkConfig) -> Self
    where
        S: NotifySource,
    {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let writer = MessageWriter::new(sink, config.framing.clone());
        let cancel = CancellationToken::new();

        let events_reader = events.clone();
        let cancel_reader = cancel.clone();
        tokio::spawn(async move {
            Self::reader_task(source, events_reader, cancel_reader).await;
        });

        Self { events, writer, config, cancel }
    }

    /// Reader task - reassembles notifications and publishes events
    async fn reader_task<S>(mut source: S, events: broadcast::Sender<Event>, cancel: CancellationToken)
    where
        S: NotifySource,
    {
        info!("Link reader task started");
        let mut reassembler = FrameReassembler::new();
        let mut message_count = 0u64;
        let mut error_count = 0u32;
        const MAX_ERRORS: u32 = 10;

        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Link reader cancelled");
                    break;
                }
                result = source.next_notification() => result,
            };

            match result {
                Ok(Some(bytes)) => {
                    error_count = 0;
                    trace!(len = bytes.len(), "Notification received");
                    for message in reassembler.feed(&bytes) {
                        message_count += 1;
                        for event in router::route(&message) {
                            // No subscribers is not an error
                            let _ = events.send(event);
                        }
                    }
                }
                Ok(None) => {
                    info!("Peripheral disconnected after {} messages", message_count);
                    if !reassembler.is_empty() {
                        debug!(dropped = reassembler.buffered().len(), "Discarding partial message");
                    }
                    reassembler.reset();
                    let _ = events.send(Event::Disconnected);
                    break;
                }
                Err(e) => {
                    error_count += 1;
                    error!("Notification error ({}/{}): {}", error_count, MAX_ERRORS, e);

                    if error_count >= MAX_ERRORS {
                        error!("Too many notification errors, treating link as disconnected");
                        reassembler.reset();
                        let _ = events.send(Event::Disconnected);
                        break;
                    }

                    // Exponential backoff: 50ms, 100ms, 200ms, ...
                    let backoff = std::time::Duration::from_millis(50 * (1 << error_count.min(5)));
                    tokio::time::sleep(backoff).await;
                }
            }
        }

        info!("Link reader task ended (routed {} messages)", message_count);
    }

    /// Receiver for every event routed after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Sender side of the event bus, for components that subscribe later.
    pub(crate) fn bus(&self) -> &broadcast::Sender<Event> {
        &self.events
    }

    /// Event stream for UI consumers. Lagged receivers see an error item.
    pub fn events(&self) -> BroadcastStream<Event> {
        BroadcastStream::new(self.events.subscribe())
    }

    pub fn writer(&self) -> &MessageWriter {
        &self.writer
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.writer.is_connected()
    }

    /// Token cancelled when the link shuts down; tasks built on the link
    /// derive child tokens from it.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub async fn send(&self, request: &Request) -> Result<()> {
        self.writer.send(request).await
    }

    /// Ask the hub for the devices on its netlink.
    pub async fn query_device_list(&self) -> Result<()> {
        self.send(&Request::NetlinkQueryDeviceList).await
    }

    pub async fn prepare_game_disk_ota(&self) -> Result<()> {
        self.send(&Request::PrepareGameDiskOta).await
    }

    pub async fn finish_game_disk_ota(&self) -> Result<()> {
        self.send(&Request::FinishGameDiskOta).await
    }

    pub async fn recovery_game_disk_ota(&self) -> Result<()> {
        self.send(&Request::RecoveryGameDiskOta).await
    }

    pub async fn reload_ui(&self) -> Result<()> {
        self.send(&Request::ReloadUi).await
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("subscribers", &self.events.receiver_count())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{AckKind, NetworkDevice};
    use crate::test_utils::{MockSink, ack_json, scripted_source};
    use serde_json::json;
    use std::time::Duration;

    fn spawn() -> (Link, crate::test_utils::SourceHandle, Arc<MockSink>) {
        let (source, handle) = scripted_source();
        let sink = Arc::new(MockSink::new());
        let link = Link::spawn(source, sink.clone(), LinkConfig::default());
        (link, handle, sink)
    }

    #[tokio::test(start_paused = true)]
    async fn fragmented_notifications_become_events() {
        let (link, handle, _sink) = spawn();
        let mut events = link.subscribe();

        let message = ack_json("T-A", "ready").to_string();
        let (head, tail) = message.split_at(20);
        handle.push(head);
        handle.push(format!("{tail}\r\n"));

        assert!(matches!(events.recv().await.unwrap(), Event::NetlinkForward { .. }));
        match events.recv().await.unwrap() {
            Event::Ack(ack) => {
                assert_eq!(ack.device.as_deref(), Some("T-A"));
                assert_eq!(ack.kind, AckKind::Ready);
            }
            other => panic!("expected ack, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_is_published() {
        let (link, handle, _sink) = spawn();
        let mut events = link.subscribe();
        handle.push("{\"type\":\"netlink\"");
        handle.disconnect();
        assert_eq!(events.recv().await.unwrap(), Event::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn device_requests_are_written() {
        let (link, _handle, sink) = spawn();
        link.query_device_list().await.unwrap();
        link.reload_ui().await.unwrap();
        assert_eq!(sink.requests(), vec![Request::NetlinkQueryDeviceList, Request::ReloadUi]);
    }

    #[tokio::test(start_paused = true)]
    async fn device_list_reaches_stream_subscribers() {
        use futures::StreamExt;

        let (link, handle, _sink) = spawn();
        let mut stream = link.events();
        handle.push_json(&json!({"type": "netlink", "action": "device_list", "data": [{"name": "ET02", "mode": "master"}]}));

        let event = tokio::time::timeout(Duration::from_secs(1), stream.next()).await.unwrap().unwrap().unwrap();
        assert_eq!(event, Event::DeviceList(vec![NetworkDevice { name: "ET02".into(), mode: "master".into() }]));
    }

    #[tokio::test(start_paused = true)]
    async fn drop_cancels_reader() {
        let (link, _handle, _sink) = spawn();
        let token = link.cancel_token().clone();
        drop(link);
        assert!(token.is_cancelled());
    }
}
