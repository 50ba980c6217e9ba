//! Terminated, segmented JSON writes.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use super::ByteSink;
use crate::config::FramingConfig;
use crate::stream::PaceExt;
use crate::types::{Outbound, Request};
use crate::{LinkError, Result};

/// Serializes requests onto a [`ByteSink`].
///
/// Every message gets the configured line terminator. Messages longer than
/// `max_write_segment` are split and written segment by segment with
/// `segment_pacing` between writes; a failed segment abandons the rest of the
/// message. Clones share the sink and never interleave segments of two
/// messages.
#[derive(Clone)]
pub struct MessageWriter {
    sink: Arc<dyn ByteSink>,
    config: FramingConfig,
    write_lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for MessageWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageWriter").field("config", &self.config).finish_non_exhaustive()
    }
}

impl MessageWriter {
    pub fn new(sink: Arc<dyn ByteSink>, config: FramingConfig) -> Self {
        Self { sink, config, write_lock: Arc::new(Mutex::new(())) }
    }

    pub fn is_connected(&self) -> bool {
        self.sink.is_connected()
    }

    /// Serialize and write one request.
    pub async fn send(&self, request: &Request) -> Result<()> {
        if !self.is_connected() {
            return Err(LinkError::disconnected(request.name()));
        }
        let json = request.to_json()?;
        debug!(request = request.name(), len = json.len(), "Sending request");
        self.write_json(&json).await
    }

    /// Write a request serialized earlier.
    pub async fn send_outbound(&self, outbound: &Outbound) -> Result<()> {
        if !self.is_connected() {
            return Err(LinkError::disconnected(outbound.name()));
        }
        debug!(request = outbound.name(), len = outbound.json.len(), "Sending request");
        self.write_json(&outbound.json).await
    }

    /// Terminate and write an already serialized message.
    pub async fn write_json(&self, json: &str) -> Result<()> {
        let mut bytes = Vec::with_capacity(json.len() + self.config.line_terminator.len());
        bytes.extend_from_slice(json.as_bytes());
        bytes.extend_from_slice(self.config.line_terminator.as_bytes());

        let _guard = self.write_lock.lock().await;

        let max = self.config.max_write_segment.max(1);
        if bytes.len() <= max {
            return self.sink.write(&bytes).await;
        }

        let total = bytes.len().div_ceil(max);
        let mut segments = futures::stream::iter(bytes.chunks(max).enumerate()).pace(self.config.segment_pacing);
        while let Some((index, segment)) = segments.next().await {
            trace!(index, total, len = segment.len(), "Writing segment");
            if let Err(e) = self.sink.write(segment).await {
                warn!(index, total, "Segment write failed, abandoning message: {}", e);
                return Err(match e {
                    LinkError::Write { .. } => e,
                    other => LinkError::write_failed_with_source(format!("segment {index} of {total}"), Box::new(other)),
                });
            }
        }
        Ok(())
    }
}
