//! Chunked image transfer over the link.
//!
//! [`ImageSender`] uploads an image to the master target: a ready probe,
//! a start descriptor, base64 chunks paced without per-chunk acks, and a
//! completion message. [`ImageReceiver`] asks the hub for a screenshot and
//! reassembles the chunks it streams back.
//!
//! Both report progress through a [`watch`] channel of [`TransferState`]
//! and finish with a [`TransferOutcome`].

use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::{LinkError, Result};

mod receiver;
mod sender;

pub use receiver::{ImageReceiver, ReceivedImage};
pub use sender::{ImageSender, TransferReport};

/// Where a transfer stands.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
pub enum TransferState {
    #[default]
    Idle,
    /// Upload probe sent, waiting for `image_transfer_ready`.
    AwaitingReadyAck,
    /// Download requested, nothing received yet.
    Requested,
    /// `chunks` of `total` sent or received.
    Transferring { chunks: usize, total: usize, percent: u8 },
    Complete,
    Failed,
    Cancelled,
}

impl TransferState {
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TransferState::AwaitingReadyAck | TransferState::Requested | TransferState::Transferring { .. }
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Complete | TransferState::Failed | TransferState::Cancelled)
    }
}

/// Whole-number percentage of `done` out of `total`.
pub(crate) fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    (done.min(total) * 100 / total) as u8
}

/// How a transfer ended.
#[derive(Debug)]
pub enum TransferOutcome<T> {
    Complete(T),
    Failed(LinkError),
    Cancelled,
}

impl<T> TransferOutcome<T> {
    pub fn into_result(self) -> Result<T> {
        match self {
            TransferOutcome::Complete(value) => Ok(value),
            TransferOutcome::Failed(e) => Err(e),
            TransferOutcome::Cancelled => Err(LinkError::TransferCancelled),
        }
    }

    pub(crate) fn from_result(result: Result<T>) -> Self {
        match result {
            Ok(value) => TransferOutcome::Complete(value),
            Err(LinkError::TransferCancelled) => TransferOutcome::Cancelled,
            Err(e) => TransferOutcome::Failed(e),
        }
    }

    pub(crate) fn state(&self) -> TransferState {
        match self {
            TransferOutcome::Complete(_) => TransferState::Complete,
            TransferOutcome::Failed(_) => TransferState::Failed,
            TransferOutcome::Cancelled => TransferState::Cancelled,
        }
    }
}

/// One running transfer.
#[derive(Debug)]
pub struct TransferHandle<T> {
    outcome: oneshot::Receiver<TransferOutcome<T>>,
    state: watch::Receiver<TransferState>,
    cancel: CancellationToken,
}

impl<T> TransferHandle<T> {
    pub(crate) fn new(
        outcome: oneshot::Receiver<TransferOutcome<T>>,
        state: watch::Receiver<TransferState>,
        cancel: CancellationToken,
    ) -> Self {
        Self { outcome, state, cancel }
    }

    pub fn state(&self) -> TransferState {
        self.state.borrow().clone()
    }

    /// Receiver that observes every progress change.
    pub fn watch_state(&self) -> watch::Receiver<TransferState> {
        self.state.clone()
    }

    /// Stop the transfer; [`wait`](Self::wait) then yields `Cancelled`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) -> TransferOutcome<T> {
        self.outcome.await.unwrap_or(TransferOutcome::Failed(LinkError::Closed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_rounds_down() {
        assert_eq!(percent(1, 3), 33);
        assert_eq!(percent(2, 3), 66);
        assert_eq!(percent(3, 3), 100);
        assert_eq!(percent(0, 0), 100);
    }

    #[test]
    fn cancelled_outcome_maps_to_error() {
        let outcome: TransferOutcome<()> = TransferOutcome::from_result(Err(LinkError::TransferCancelled));
        assert!(matches!(outcome, TransferOutcome::Cancelled));
        assert_eq!(outcome.state(), TransferState::Cancelled);
        assert!(matches!(outcome.into_result(), Err(LinkError::TransferCancelled)));
    }
}
