//! Byte channel abstraction over the BLE transport.
//!
//! The radio itself (scanning, connecting, characteristic discovery) lives in
//! the host application. This crate only needs the two halves of the
//! connected link:
//!
//! - [`NotifySource`]: notifications arriving from the hub, consumed by one
//!   [`Link`](crate::link::Link) task
//! - [`ByteSink`]: the write characteristic, shared by everything that sends
//!
//! Outbound messages go through [`MessageWriter`], which terminates and
//! segments them to fit the transport.

use std::sync::Arc;

use crate::Result;

pub mod writer;

pub use writer::MessageWriter;

/// Inbound half of the link.
#[async_trait::async_trait]
pub trait NotifySource: Send + 'static {
    /// Wait for the next notification payload.
    ///
    /// Returns:
    /// - `Ok(Some(bytes))` - Notification received
    /// - `Ok(None)` - Peripheral disconnected
    /// - `Err(e)` - Transport error; the link keeps reading
    async fn next_notification(&mut self) -> Result<Option<Vec<u8>>>;
}

/// Outbound half of the link.
#[async_trait::async_trait]
pub trait ByteSink: Send + Sync + 'static {
    /// Write one segment. Completion reflects the transport write only.
    async fn write(&self, bytes: &[u8]) -> Result<()>;

    /// Whether the peripheral is currently connected.
    fn is_connected(&self) -> bool;
}

#[async_trait::async_trait]
impl<T: ByteSink + ?Sized> ByteSink for Arc<T> {
    async fn write(&self, bytes: &[u8]) -> Result<()> {
        (**self).write(bytes).await
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }
}
