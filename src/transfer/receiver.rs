//! Screenshot download from the hub.

use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{TransferHandle, TransferOutcome, TransferState, percent};
use crate::channel::MessageWriter;
use crate::config::TransferConfig;
use crate::link::Link;
use crate::router::Event;
use crate::types::Request;
use crate::{LinkError, Result};

/// A reassembled image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedImage {
    pub data: Vec<u8>,
    pub chunks: usize,
}

/// Requests screenshots and collects the chunks the hub streams back.
pub struct ImageReceiver {
    writer: MessageWriter,
    bus: broadcast::Sender<Event>,
    config: TransferConfig,
    link_cancel: CancellationToken,
}

impl ImageReceiver {
    pub fn new(link: &Link) -> Self {
        Self {
            writer: link.writer().clone(),
            bus: link.bus().clone(),
            config: link.config().transfer.clone(),
            link_cancel: link.cancel_token().clone(),
        }
    }

    /// Send `request_image` and collect the reply.
    ///
    /// The download fails when no chunk arrives for `receive_timeout`, when
    /// a chunk cannot be decoded, or when chunks are still missing
    /// `completion_grace` after the hub reports completion.
    pub async fn request_screenshot(&self) -> Result<TransferHandle<ReceivedImage>> {
        // Subscribe first so the first chunk cannot be missed
        let events = self.bus.subscribe();
        self.writer.send(&Request::request_screenshot()).await?;
        info!("Screenshot requested");

        let cancel = self.link_cancel.child_token();
        let (state, state_rx) = watch::channel(TransferState::Requested);
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let download = Download { events, config: self.config.clone(), state, chunks: BTreeMap::new(), total: None };

        let cancel_task = cancel.clone();
        tokio::spawn(async move {
            let outcome = download.run(cancel_task).await;
            let _ = outcome_tx.send(outcome);
        });

        Ok(TransferHandle::new(outcome_rx, state_rx, cancel))
    }
}

struct Download {
    events: broadcast::Receiver<Event>,
    config: TransferConfig,
    state: watch::Sender<TransferState>,
    chunks: BTreeMap<usize, Vec<u8>>,
    total: Option<usize>,
}

impl Download {
    async fn run(mut self, cancel: CancellationToken) -> TransferOutcome<ReceivedImage> {
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(LinkError::TransferCancelled),
            result = self.receive() => result,
        };

        match &result {
            Ok(image) => info!(chunks = image.chunks, size = image.data.len(), "Screenshot received"),
            Err(LinkError::TransferCancelled) => info!("Screenshot download cancelled"),
            Err(e) => warn!("Screenshot download failed: {}", e),
        }
        let outcome = TransferOutcome::from_result(result);
        self.state.send_replace(outcome.state());
        outcome
    }

    async fn receive(&mut self) -> Result<ReceivedImage> {
        let mut deadline = Instant::now() + self.config.receive_timeout;
        let mut grace = false;

        loop {
            let event = tokio::select! {
                event = self.events.recv() => event,
                _ = sleep_until(deadline) => {
                    if grace {
                        debug!(received = self.chunks.len(), "Completion grace elapsed");
                        return self.assemble(None);
                    }
                    return Err(LinkError::TransferTimeout {
                        stage: "image chunks".to_string(),
                        timeout: self.config.receive_timeout,
                    });
                }
            };

            match event {
                Ok(Event::ImageTransferStart { total_chunks }) => {
                    debug!(?total_chunks, "Image transfer starting");
                    self.total = total_chunks;
                    self.report_progress();
                    if !grace {
                        deadline = Instant::now() + self.config.receive_timeout;
                    }
                }
                Ok(Event::ImageChunk { chunk_index, data }) => {
                    let bytes = STANDARD
                        .decode(data.as_bytes())
                        .map_err(|e| LinkError::ChunkDecode { index: chunk_index, details: e.to_string() })?;
                    trace!(chunk_index, len = bytes.len(), "Image chunk received");
                    self.chunks.insert(chunk_index, bytes);
                    self.report_progress();

                    if grace {
                        if self.total.is_some_and(|n| self.is_complete(n)) {
                            return self.assemble(None);
                        }
                    } else {
                        deadline = Instant::now() + self.config.receive_timeout;
                    }
                }
                Ok(Event::MalformedChunk { reason }) => return Err(LinkError::malformed(reason)),
                Ok(Event::ImageTransferComplete { chunks_sent }) => {
                    if self.total.is_none() {
                        self.total = chunks_sent;
                    }
                    match self.total {
                        Some(n) if !self.is_complete(n) => {
                            debug!(received = self.chunks.len(), expected = n, "Completion before all chunks, waiting");
                            grace = true;
                            deadline = Instant::now() + self.config.completion_grace;
                        }
                        _ => return self.assemble(chunks_sent),
                    }
                }
                Ok(Event::Disconnected) => return Err(LinkError::disconnected("image download")),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Image download lagged behind link events");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(LinkError::Closed),
            }
        }
    }

    fn is_complete(&self, expected: usize) -> bool {
        (0..expected).all(|i| self.chunks.contains_key(&i))
    }

    fn report_progress(&self) {
        let total = self.total.unwrap_or(0);
        let received = self.chunks.len();
        self.state.send_replace(TransferState::Transferring {
            chunks: received,
            total,
            percent: if total == 0 { 0 } else { percent(received, total) },
        });
    }

    /// Concatenate chunks in index order.
    fn assemble(&mut self, chunks_sent: Option<usize>) -> Result<ReceivedImage> {
        let expected = self
            .total
            .or(chunks_sent)
            .unwrap_or_else(|| self.chunks.keys().next_back().map_or(0, |last| last + 1));

        let mut data = Vec::new();
        for index in 0..expected {
            let chunk = self.chunks.remove(&index).ok_or_else(|| LinkError::ChunkDecode {
                index,
                details: "chunk never arrived".to_string(),
            })?;
            data.extend_from_slice(&chunk);
        }
        Ok(ReceivedImage { data, chunks: expected })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::test_utils::{MockSink, SourceHandle, scripted_source};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn spawn_link() -> (Link, SourceHandle, Arc<MockSink>) {
        let (source, handle) = scripted_source();
        let sink = Arc::new(MockSink::new());
        let link = Link::spawn(source, sink.clone(), LinkConfig::default());
        (link, handle, sink)
    }

    fn forward(content: serde_json::Value) -> serde_json::Value {
        json!({"type": "netlink", "action": "forward", "device": "ET02", "content": content})
    }

    fn chunk(index: usize, bytes: &[u8]) -> serde_json::Value {
        forward(json!({"command": "image_chunk", "chunk_index": index, "data": STANDARD.encode(bytes)}))
    }

    #[tokio::test(start_paused = true)]
    async fn chunks_are_assembled_in_index_order() {
        let (link, source, sink) = spawn_link();
        let receiver = ImageReceiver::new(&link);
        let handle = receiver.request_screenshot().await.unwrap();
        assert_eq!(sink.requests(), vec![Request::request_screenshot()]);

        source.push_json(&forward(json!({"command": "image_transfer_start", "total_chunks": 3})));
        source.push_json(&chunk(1, b"world"));
        source.push_json(&chunk(0, b"hello "));
        source.push_json(&chunk(2, b"!"));
        source.push_json(&forward(json!({"command": "image_transfer_complete", "chunks_sent": 3})));

        let image = handle.wait().await.into_result().unwrap();
        assert_eq!(image, ReceivedImage { data: b"hello world!".to_vec(), chunks: 3 });
    }

    #[tokio::test(start_paused = true)]
    async fn late_chunks_are_accepted_during_grace() {
        let (link, source, _sink) = spawn_link();
        let receiver = ImageReceiver::new(&link);
        let handle = receiver.request_screenshot().await.unwrap();

        source.push_json(&forward(json!({"command": "image_transfer_start", "total_chunks": 2})));
        source.push_json(&chunk(0, b"ab"));
        source.push_json(&forward(json!({"command": "image_transfer_complete"})));
        tokio::time::sleep(Duration::from_millis(1000)).await;
        source.push_json(&json!({"command": "image_chunk", "chunk_index": 1, "data": STANDARD.encode(b"cd")}));

        let image = handle.wait().await.into_result().unwrap();
        assert_eq!(image.data, b"abcd".to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_chunk_fails_after_grace() {
        let (link, source, _sink) = spawn_link();
        let receiver = ImageReceiver::new(&link);
        let handle = receiver.request_screenshot().await.unwrap();

        source.push_json(&forward(json!({"command": "image_transfer_start", "total_chunks": 3})));
        source.push_json(&chunk(0, b"a"));
        source.push_json(&chunk(2, b"c"));
        source.push_json(&forward(json!({"command": "image_transfer_complete"})));

        match handle.wait().await {
            TransferOutcome::Failed(LinkError::ChunkDecode { index, .. }) => assert_eq!(index, 1),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn corrupt_base64_fails_download() {
        let (link, source, _sink) = spawn_link();
        let receiver = ImageReceiver::new(&link);
        let handle = receiver.request_screenshot().await.unwrap();

        source.push_json(&forward(json!({"command": "image_chunk", "chunk_index": 4, "data": "not*base64"})));
        match handle.wait().await {
            TransferOutcome::Failed(LinkError::ChunkDecode { index, .. }) => assert_eq!(index, 4),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn silence_times_out() {
        let (link, _source, _sink) = spawn_link();
        let receiver = ImageReceiver::new(&link);
        let handle = receiver.request_screenshot().await.unwrap();
        let state = handle.watch_state();

        assert!(matches!(handle.wait().await, TransferOutcome::Failed(LinkError::TransferTimeout { .. })));
        assert_eq!(*state.borrow(), TransferState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn progress_counts_distinct_chunks() {
        let (link, source, _sink) = spawn_link();
        let receiver = ImageReceiver::new(&link);
        let handle = receiver.request_screenshot().await.unwrap();
        let mut state = handle.watch_state();

        source.push_json(&forward(json!({"command": "image_transfer_start", "total_chunks": 4})));
        source.push_json(&chunk(0, b"a"));
        source.push_json(&chunk(0, b"a"));
        source.push_json(&chunk(1, b"b"));

        let progress = state
            .wait_for(|s| matches!(s, TransferState::Transferring { chunks: 2, .. }))
            .await
            .unwrap()
            .clone();
        assert_eq!(progress, TransferState::Transferring { chunks: 2, total: 4, percent: 50 });
        handle.cancel();
        assert!(matches!(handle.wait().await, TransferOutcome::Cancelled));
    }
}
