//! Data types shared across the link.
//!
//! - [`ShotData`] / [`ShotEvent`]: decoded shot telemetry
//! - [`TargetConfig`] / [`DrillSetup`]: what a drill asks of each target
//! - [`DrillRepeatSummary`]: scored result of one repeat
//! - [`Request`] / [`Command`]: outbound wire messages

mod message;
mod shot;
mod summary;
mod target;

pub use message::{Command, Destination, Outbound, ReadyCommand, Request, round_delay};
pub(crate) use shot::lenient_f64;
pub use shot::{HitArea, Position, ShotData, ShotEvent};
pub use summary::{DrillRepeatSummary, RepeatCompletion};
pub use target::{DrillMode, DrillSetup, TargetConfig};
