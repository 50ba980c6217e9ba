//! Finalized repeat results.

use serde::{Deserialize, Serialize};

use super::ShotData;

/// How a repeat came to be finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
#[serde(rename_all = "snake_case")]
pub enum RepeatCompletion {
    /// The last target reported `end`.
    EndSignal,
    /// No `end` arrived before the deadline.
    EndTimeout,
    /// Stopped by the shooter, after the grace period.
    ManualStop,
}

/// Scored result of one repeat. Produced once per finalized repeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
#[serde(rename_all = "camelCase")]
pub struct DrillRepeatSummary {
    pub repeat_index: u32,
    /// Seconds from the beep to the last shot.
    pub total_time: f64,
    pub num_shots: u32,
    /// Split of the first shot, seconds after the beep.
    pub first_shot: f64,
    /// Smallest split between consecutive shots.
    pub fastest: f64,
    pub score: i32,
    pub missed_targets: u32,
    /// Shots in arrival order with recomputed `time_diff` splits.
    pub shots: Vec<ShotData>,
    pub completion: RepeatCompletion,
}

impl DrillRepeatSummary {
    /// Score per second over the whole repeat, zero for a zero-length repeat.
    pub fn hit_factor(&self) -> f64 {
        if self.total_time > 0.0 { f64::from(self.score) / self.total_time } else { 0.0 }
    }
}
