//! Drill execution.
//!
//! [`DrillMachine`] holds the per-repeat state and decides what to send;
//! [`DrillRunner`] connects it to a [`Link`](crate::Link).

mod machine;
mod runner;

pub use machine::{DrillMachine, DrillOutput, DrillState, DrillUpdate};
pub use runner::{DrillChannels, DrillHandle, DrillRunner};
