//! Wire protocol and drill engine for FlexTarget smart targets.
//!
//! A phone talks to a hub over a single BLE characteristic pair. The hub
//! forwards JSON commands to targets on its netlink and relays their shots
//! and acknowledgments back. This crate implements everything above the raw
//! byte channel:
//!
//! - **Framing**: notifications are reassembled into messages and outbound
//!   messages are terminated and segmented to the link MTU
//! - **Routing**: messages are decoded into typed [`Event`]s on a broadcast bus
//! - **Drills**: readiness checks, start/end signalling, shot collection and
//!   scoring for each repeat
//! - **Image transfer**: chunked upload to the master target and screenshot
//!   download
//!
//! The BLE stack itself stays with the host: it implements [`NotifySource`]
//! and [`ByteSink`] for its characteristic.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use flexlink::{ByteSink, DrillRunner, DrillSetup, Link, LinkConfig, NotifySource, TargetConfig};
//! use futures::StreamExt;
//!
//! async fn run_drill<S: NotifySource>(source: S, sink: Arc<dyn ByteSink>) -> flexlink::Result<()> {
//!     let link = Link::spawn(source, sink, LinkConfig::default());
//!     let setup = DrillSetup::new(vec![
//!         TargetConfig::new(0, "T-A", "ipsc"),
//!         TargetConfig::new(1, "T-B", "ipsc"),
//!     ]);
//!
//!     let mut drill = DrillRunner::spawn(&link, setup);
//!     drill.handle.perform_readiness_check()?;
//!     while let Some(update) = drill.updates.next().await {
//!         println!("{update:?}");
//!     }
//!     Ok(())
//! }
//! ```

// Core types and error handling
pub mod config;
mod error;
pub mod logging;
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod types;

// Inbound side
pub mod channel;
pub mod framing;
pub mod link;
pub mod router;
pub mod stream;

// Protocol engines
pub mod ack;
pub mod drill;
pub mod scoring;
pub mod transfer;

// Core exports
pub use error::*;
pub use types::*;

pub use channel::{ByteSink, MessageWriter, NotifySource};
pub use config::LinkConfig;
pub use framing::FrameReassembler;
pub use link::Link;
pub use router::{Ack, AckKind, Event, NetworkDevice, OtaEvent, OtaFailure};

pub use ack::{AckOutcome, AckProgress, AckTracker};
pub use drill::{DrillChannels, DrillHandle, DrillMachine, DrillRunner, DrillState, DrillUpdate};
pub use transfer::{ImageReceiver, ImageSender, ReceivedImage, TransferHandle, TransferOutcome, TransferReport, TransferState};
