//! Image upload to the master target.

use std::future::Future;
use std::sync::{Arc, Mutex};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use futures::StreamExt;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{TransferHandle, TransferOutcome, TransferState, percent};
use crate::channel::MessageWriter;
use crate::config::TransferConfig;
use crate::link::Link;
use crate::router::{AckKind, Event};
use crate::stream::PaceExt;
use crate::types::{Command, Request};
use crate::{LinkError, Result};

/// What a completed upload sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub image_name: String,
    pub total_size: usize,
    pub total_chunks: usize,
}

/// Uploads images, one at a time.
///
/// Each transfer runs in its own task:
///
/// 1. `image_transfer_ready` probe to the master device, then wait up to
///    `ready_timeout` for its `image_transfer_ready` ack
/// 2. after `handshake_settle`, the `image_transfer_start` descriptor
/// 3. after `start_settle`, one `image_chunk` per `chunk_size` bytes,
///    `chunk_pacing` apart, without waiting for acks
/// 4. `image_transfer_complete` with status `success`
///
/// Every message is forwarded to `master_device`.
pub struct ImageSender {
    writer: MessageWriter,
    bus: broadcast::Sender<Event>,
    config: TransferConfig,
    link_cancel: CancellationToken,
    state: Arc<watch::Sender<TransferState>>,
    active: Mutex<Option<CancellationToken>>,
}

impl ImageSender {
    pub fn new(link: &Link) -> Self {
        let (state, _) = watch::channel(TransferState::Idle);
        Self {
            writer: link.writer().clone(),
            bus: link.bus().clone(),
            config: link.config().transfer.clone(),
            link_cancel: link.cancel_token().clone(),
            state: Arc::new(state),
            active: Mutex::new(None),
        }
    }

    /// State of the current or most recent upload.
    pub fn state(&self) -> TransferState {
        self.state.borrow().clone()
    }

    pub fn is_transferring(&self) -> bool {
        self.state.borrow().is_active()
    }

    /// Start uploading `image` under `image_name`.
    ///
    /// Fails with [`LinkError::TransferInProgress`] while another upload is
    /// running and with [`LinkError::ChannelDisconnected`] when the link is
    /// down.
    pub fn transfer_image(&self, image: Vec<u8>, image_name: impl Into<String>) -> Result<TransferHandle<TransferReport>> {
        let mut active = self.active.lock().map_err(|_| LinkError::Closed)?;
        if self.state.borrow().is_active() {
            return Err(LinkError::TransferInProgress);
        }
        if !self.writer.is_connected() {
            return Err(LinkError::disconnected("image transfer"));
        }

        let cancel = self.link_cancel.child_token();
        *active = Some(cancel.clone());
        self.state.send_replace(TransferState::AwaitingReadyAck);

        let upload = Upload {
            image_name: image_name.into(),
            chunks: image.chunks(self.config.chunk_size.max(1)).map(<[u8]>::to_vec).collect(),
            total_size: image.len(),
        };
        info!(image = %upload.image_name, size = upload.total_size, chunks = upload.chunks.len(), "Starting image transfer");

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let handle = TransferHandle::new(outcome_rx, self.state.subscribe(), cancel.clone());
        let task = UploadTask {
            writer: self.writer.clone(),
            events: self.bus.subscribe(),
            config: self.config.clone(),
            state: self.state.clone(),
        };
        tokio::spawn(async move {
            let outcome = task.run(upload, cancel).await;
            let _ = outcome_tx.send(outcome);
        });

        Ok(handle)
    }

    /// Stop the running upload, if any.
    pub fn cancel_transfer(&self) {
        let token = self.active.lock().ok().and_then(|mut active| active.take());
        match token {
            Some(token) => {
                debug!("Cancelling image transfer");
                token.cancel();
            }
            None => trace!("No image transfer to cancel"),
        }
    }
}

impl Drop for ImageSender {
    fn drop(&mut self) {
        self.cancel_transfer();
    }
}

struct Upload {
    image_name: String,
    chunks: Vec<Vec<u8>>,
    total_size: usize,
}

struct UploadTask {
    writer: MessageWriter,
    events: broadcast::Receiver<Event>,
    config: TransferConfig,
    state: Arc<watch::Sender<TransferState>>,
}

impl UploadTask {
    async fn run(mut self, upload: Upload, cancel: CancellationToken) -> TransferOutcome<TransferReport> {
        let result = self.send_all(&upload, &cancel).await;

        match &result {
            Ok(_) => info!(image = %upload.image_name, "Image transfer complete"),
            Err(LinkError::TransferCancelled) => info!(image = %upload.image_name, "Image transfer cancelled"),
            Err(e) => warn!(image = %upload.image_name, "Image transfer failed: {}", e),
        }
        let outcome = TransferOutcome::from_result(result);
        self.state.send_replace(outcome.state());
        outcome
    }

    /// Cancellation is only observed between messages. A message whose
    /// first segment is on the wire is always written out with its terminator.
    async fn send_all(&mut self, upload: &Upload, cancel: &CancellationToken) -> Result<TransferReport> {
        let master = self.config.master_device.clone();
        let total_chunks = upload.chunks.len();
        let ready_timeout = self.config.ready_timeout;

        self.send(&master, Command::ImageTransferReady).await?;
        unless_cancelled(cancel, timeout(ready_timeout, self.ready_ack()))
            .await?
            .map_err(|_| LinkError::TransferTimeout {
                stage: "image_transfer_ready ack".to_string(),
                timeout: ready_timeout,
            })??;
        debug!("Master device ready for image");

        unless_cancelled(cancel, sleep(self.config.handshake_settle)).await?;
        self.send(
            &master,
            Command::ImageTransferStart {
                chunk_size: self.config.chunk_size,
                image_name: upload.image_name.clone(),
                total_chunks,
                total_size: upload.total_size,
            },
        )
        .await?;
        self.state.send_replace(TransferState::Transferring { chunks: 0, total: total_chunks, percent: 0 });

        unless_cancelled(cancel, sleep(self.config.start_settle)).await?;
        let mut chunks = futures::stream::iter(upload.chunks.iter().enumerate()).pace(self.config.chunk_pacing);
        while let Some((chunk_index, chunk)) = unless_cancelled(cancel, chunks.next()).await? {
            let data = STANDARD.encode(chunk);
            trace!(chunk_index, len = data.len(), "Sending image chunk");
            self.send(&master, Command::ImageChunk { chunk_index, data }).await?;

            let sent = chunk_index + 1;
            self.state.send_replace(TransferState::Transferring {
                chunks: sent,
                total: total_chunks,
                percent: percent(sent, total_chunks),
            });
        }

        if cancel.is_cancelled() {
            return Err(LinkError::TransferCancelled);
        }
        self.send(&master, Command::ImageTransferComplete { status: "success".to_string() }).await?;
        Ok(TransferReport { image_name: upload.image_name.clone(), total_size: upload.total_size, total_chunks })
    }

    async fn send(&self, master: &str, command: Command) -> Result<()> {
        self.writer.send(&Request::forward(master, command)).await
    }

    async fn ready_ack(&mut self) -> Result<()> {
        loop {
            match self.events.recv().await {
                Ok(Event::Ack(ack)) if ack.kind == AckKind::ImageTransferReady => return Ok(()),
                Ok(Event::Disconnected) => return Err(LinkError::disconnected("image transfer")),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Image transfer lagged behind link events");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(LinkError::Closed),
            }
        }
    }
}

/// Await `fut` unless `cancel` fires first.
async fn unless_cancelled<F: Future>(cancel: &CancellationToken, fut: F) -> Result<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(LinkError::TransferCancelled),
        output = fut => Ok(output),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::test_utils::{MockSink, SourceHandle, next_sent, scripted_source};
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::Instant;

    fn spawn_link() -> (Link, SourceHandle, Arc<MockSink>) {
        let (source, handle) = scripted_source();
        let sink = Arc::new(MockSink::new());
        let link = Link::spawn(source, sink.clone(), LinkConfig::default());
        (link, handle, sink)
    }

    fn ready_ack() -> serde_json::Value {
        json!({"type": "netlink", "action": "forward", "device": "ET02", "content": {"ack": "image_transfer_ready"}})
    }

    #[tokio::test(start_paused = true)]
    async fn upload_follows_handshake_and_pacing() {
        let (link, source, sink) = spawn_link();
        let mut sent = sink.subscribe();
        let sender = ImageSender::new(&link);
        let image: Vec<u8> = (0..450u32).map(|i| i as u8).collect();

        let handle = sender.transfer_image(image.clone(), "target.jpg").unwrap();
        let probe = next_sent(&mut sent, "image_transfer_ready").await;
        assert_eq!(probe["dest"], "ET02");

        let acked_at = Instant::now();
        source.push_json(&ready_ack());
        let start = next_sent(&mut sent, "image_transfer_start").await;
        assert!(acked_at.elapsed() >= Duration::from_millis(200));
        assert_eq!(
            start["content"],
            json!({"command": "image_transfer_start", "chunk_size": 200, "image_name": "target.jpg", "total_chunks": 3, "total_size": 450})
        );

        let started_at = Instant::now();
        let mut decoded = Vec::new();
        for index in 0..3 {
            let chunk = next_sent(&mut sent, "image_chunk").await;
            assert_eq!(chunk["content"]["chunk_index"], index);
            decoded.extend(STANDARD.decode(chunk["content"]["data"].as_str().unwrap()).unwrap());
        }
        assert_eq!(decoded, image);
        assert!(started_at.elapsed() >= Duration::from_millis(500 + 400));

        let done = next_sent(&mut sent, "image_transfer_complete").await;
        assert_eq!(done["content"]["status"], "success");

        let report = handle.wait().await.into_result().unwrap();
        assert_eq!(report, TransferReport { image_name: "target.jpg".into(), total_size: 450, total_chunks: 3 });
        assert_eq!(sender.state(), TransferState::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_ready_ack_times_out() {
        let (link, _source, sink) = spawn_link();
        let sender = ImageSender::new(&link);
        let handle = sender.transfer_image(vec![1, 2, 3], "a.jpg").unwrap();

        let started = Instant::now();
        match handle.wait().await {
            TransferOutcome::Failed(LinkError::TransferTimeout { timeout, .. }) => {
                assert_eq!(timeout, Duration::from_secs(5));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(6));
        assert_eq!(sink.commands(), vec!["image_transfer_ready"]);
        assert_eq!(sender.state(), TransferState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn second_transfer_is_rejected_while_running() {
        let (link, _source, _sink) = spawn_link();
        let sender = ImageSender::new(&link);
        let _first = sender.transfer_image(vec![0; 10], "a.jpg").unwrap();
        assert!(matches!(sender.transfer_image(vec![0; 10], "b.jpg"), Err(LinkError::TransferInProgress)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_mid_sequence() {
        let (link, source, sink) = spawn_link();
        let mut sent = sink.subscribe();
        let sender = ImageSender::new(&link);
        let handle = sender.transfer_image(vec![7; 1000], "big.jpg").unwrap();

        next_sent(&mut sent, "image_transfer_ready").await;
        source.push_json(&ready_ack());
        next_sent(&mut sent, "image_chunk").await;
        sender.cancel_transfer();

        assert!(matches!(handle.wait().await, TransferOutcome::Cancelled));
        assert_eq!(sender.state(), TransferState::Cancelled);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!sink.commands().contains(&"image_transfer_complete".to_string()));
        assert!(sink.commands().iter().filter(|c| *c == "image_chunk").count() < 5);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_mid_chunk_finishes_the_frame() {
        let (link, source, sink) = spawn_link();
        let mut sent = sink.subscribe();
        let sender = ImageSender::new(&link);
        let handle = sender.transfer_image(vec![28; 1000], "big.jpg").unwrap();

        next_sent(&mut sent, "image_transfer_ready").await;
        source.push_json(&ready_ack());
        next_sent(&mut sent, "image_chunk").await;
        // Second chunk is mid-segmentation here
        tokio::time::sleep(Duration::from_millis(150)).await;
        sender.cancel_transfer();

        assert!(matches!(handle.wait().await, TransferOutcome::Cancelled));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(sink.writes().concat().ends_with(b"\r\n"));
        assert!(!sink.commands().contains(&"image_transfer_complete".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_when_idle_is_harmless() {
        let (link, _source, _sink) = spawn_link();
        let sender = ImageSender::new(&link);
        sender.cancel_transfer();
        assert_eq!(sender.state(), TransferState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnected_link_rejects_transfer() {
        let (link, _source, sink) = spawn_link();
        sink.set_connected(false);
        let sender = ImageSender::new(&link);
        assert!(matches!(
            sender.transfer_image(vec![1], "a.jpg"),
            Err(LinkError::ChannelDisconnected { .. })
        ));
        assert_eq!(sender.state(), TransferState::Idle);
    }
}
