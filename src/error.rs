//! Error types for the smart-target link.
//!
//! Every fallible operation in this crate returns [`LinkError`]. Most of the
//! conditions a drill can run into (devices that never answer, an empty
//! repeat, a late end message) are *expected* and are reported as values on
//! the drill and transfer update streams instead. The error variants below
//! mirror that taxonomy so callers can turn an update into an error when they
//! want `?` ergonomics.
//!
//! ## Error Categories
//!
//! - **Channel Errors**: the BLE link dropped or a write was rejected
//! - **Serialization Errors**: an outbound command could not be encoded
//! - **Protocol Timeouts**: acks, end signals or transfer handshakes that never came
//! - **Decode Errors**: malformed inbound JSON or corrupt chunk payloads
//! - **Configuration Errors**: invalid or unreadable `LinkConfig` files
//!
//! ## Recovery and Retry
//!
//! ```rust
//! use flexlink::LinkError;
//!
//! let error = LinkError::ack_timeout(vec!["T-B".to_string()], std::time::Duration::from_secs(10));
//! if error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for link operations.
pub type Result<T, E = LinkError> = std::result::Result<T, E>;

/// Main error type for link operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum LinkError {
    #[error("BLE channel not connected during {operation}")]
    ChannelDisconnected { operation: String },

    #[error("Failed to serialize {context}")]
    Serialization {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Readiness check timed out after {timeout:?}; no ack from {non_responsive:?}")]
    AckTimeout { non_responsive: Vec<String>, timeout: Duration },

    #[error("No end signal for repeat {repeat} within {timeout:?}")]
    EndTimeout { repeat: u32, timeout: Duration },

    #[error("Malformed message: {details}")]
    MalformedMessage { details: String },

    #[error("Repeat {repeat} collected no shots")]
    EmptyRepeat { repeat: u32 },

    #[error("An image transfer is already in progress")]
    TransferInProgress,

    #[error("Image transfer timed out waiting for {stage} after {timeout:?}")]
    TransferTimeout { stage: String, timeout: Duration },

    #[error("Image transfer cancelled")]
    TransferCancelled,

    #[error("Chunk {index} could not be decoded: {details}")]
    ChunkDecode { index: usize, details: String },

    #[error("Channel write failed: {reason}")]
    Write {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Invalid configuration in {path}: {details}")]
    Config { path: PathBuf, details: String },

    #[error("I/O error")]
    Io {
        #[source]
        source: std::io::Error,
    },

    #[error("Link task has shut down")]
    Closed,
}

impl LinkError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            LinkError::ChannelDisconnected { .. } => true,
            LinkError::AckTimeout { .. } => true,
            LinkError::EndTimeout { .. } => true,
            LinkError::EmptyRepeat { .. } => true,
            LinkError::TransferInProgress => true,
            LinkError::TransferTimeout { .. } => true,
            LinkError::Write { .. } => true,
            LinkError::Serialization { .. } => false,
            LinkError::MalformedMessage { .. } => false,
            LinkError::TransferCancelled => false,
            LinkError::ChunkDecode { .. } => false,
            LinkError::Config { .. } => false,
            LinkError::Io { .. } => false,
            LinkError::Closed => false,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            LinkError::ChannelDisconnected { .. } => vec![
                "Reconnect to the smart target",
                "Check that the target is powered and in range",
            ],
            LinkError::Serialization { .. } => {
                vec!["Check drill and target configuration values", "Report the failing command"]
            }
            LinkError::AckTimeout { .. } => vec![
                "Check that every listed target is powered on",
                "Verify the target names match the netlink device list",
                "Retry the readiness check",
            ],
            LinkError::EndTimeout { .. } => vec![
                "Check the last target in the sequence is still connected",
                "Review the finalized repeat for missing shots",
            ],
            LinkError::MalformedMessage { .. } => {
                vec!["Check target firmware version", "Capture raw notifications for analysis"]
            }
            LinkError::EmptyRepeat { .. } => {
                vec!["Retry the same repeat", "Verify targets are registering hits"]
            }
            LinkError::TransferInProgress => {
                vec!["Wait for the current transfer to finish", "Cancel the current transfer"]
            }
            LinkError::TransferTimeout { .. } => vec![
                "Check the master target is connected",
                "Retry the transfer",
            ],
            LinkError::TransferCancelled => vec!["Start a new transfer if still needed"],
            LinkError::ChunkDecode { .. } => {
                vec!["Request the image again", "Check link quality"]
            }
            LinkError::Write { .. } => {
                vec!["Retry the write", "Reconnect if writes keep failing"]
            }
            LinkError::Config { .. } => {
                vec!["Fix the configuration file", "Fall back to LinkConfig::default()"]
            }
            LinkError::Io { .. } => vec!["Check the file exists and is readable"],
            LinkError::Closed => vec!["Spawn a new link for the connection"],
        }
    }

    /// Helper constructor for disconnected-channel errors.
    pub fn disconnected(operation: impl Into<String>) -> Self {
        LinkError::ChannelDisconnected { operation: operation.into() }
    }

    /// Helper constructor for serialization errors.
    pub fn serialization(context: impl Into<String>, source: serde_json::Error) -> Self {
        LinkError::Serialization { context: context.into(), source }
    }

    /// Helper constructor for readiness timeouts.
    pub fn ack_timeout(non_responsive: Vec<String>, timeout: Duration) -> Self {
        LinkError::AckTimeout { non_responsive, timeout }
    }

    /// Helper constructor for malformed inbound messages.
    pub fn malformed(details: impl Into<String>) -> Self {
        LinkError::MalformedMessage { details: details.into() }
    }

    /// Helper constructor for transport write failures.
    pub fn write_failed(reason: impl Into<String>) -> Self {
        LinkError::Write { reason: reason.into(), source: None }
    }

    /// Helper constructor for transport write failures with source.
    pub fn write_failed_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        LinkError::Write { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for configuration errors.
    pub fn config(path: impl Into<PathBuf>, details: impl Into<String>) -> Self {
        LinkError::Config { path: path.into(), details: details.into() }
    }
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        LinkError::Io { source: err }
    }
}
