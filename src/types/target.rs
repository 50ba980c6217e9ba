//! Drill setup and per-target configuration.

use std::collections::BTreeSet;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Scoring ruleset a drill runs under.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
#[serde(rename_all = "lowercase")]
pub enum DrillMode {
    #[default]
    Ipsc,
    Cqb,
}

impl DrillMode {
    pub fn as_str(self) -> &'static str {
        match self {
            DrillMode::Ipsc => "ipsc",
            DrillMode::Cqb => "cqb",
        }
    }
}

/// One target in a drill sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
#[serde(rename_all = "camelCase")]
pub struct TargetConfig {
    pub seq_no: u32,
    /// Device name on the netlink, used as the `dest` of forwarded commands.
    pub target_name: String,
    pub target_type: String,
    /// Seconds the target stays active.
    pub timeout: f64,
    pub counted_shots: u32,
    /// CQB animation to play, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

impl TargetConfig {
    pub fn new(seq_no: u32, target_name: impl Into<String>, target_type: impl Into<String>) -> Self {
        Self {
            seq_no,
            target_name: target_name.into(),
            target_type: target_type.into(),
            timeout: 30.0,
            counted_shots: 2,
            action: None,
            duration: None,
        }
    }

    pub fn with_action(mut self, action: impl Into<String>, duration: Option<f64>) -> Self {
        self.action = Some(action.into());
        self.duration = duration;
        self
    }

    /// Disguised-enemy targets only understand the reduced ready command.
    pub fn is_disguised_enemy(&self) -> bool {
        self.target_type == "disguised_enemy"
    }
}

/// Everything needed to run the repeats of one drill.
///
/// The repeat schedule (`drill_duration`, `repeats`, `pause`) belongs to the
/// host: it is carried so a setup round-trips intact, but the drill engine
/// runs one repeat at a time and the host advances it with
/// `set_current_repeat`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
#[serde(rename_all = "camelCase", default)]
pub struct DrillSetup {
    /// Configured start delay in seconds, used when no random delay is set.
    pub delay: f64,
    /// Nominal repeat length in seconds. Host-owned.
    pub drill_duration: f64,
    /// Number of repeats the host intends to run. Host-owned.
    pub repeats: u32,
    /// Seconds the host waits between repeats. Host-owned.
    pub pause: u32,
    pub mode: DrillMode,
    pub targets: Vec<TargetConfig>,
}

impl Default for DrillSetup {
    fn default() -> Self {
        Self { delay: 0.0, drill_duration: 5.0, repeats: 1, pause: 5, mode: DrillMode::Ipsc, targets: Vec::new() }
    }
}

impl DrillSetup {
    pub fn new(targets: Vec<TargetConfig>) -> Self {
        Self { targets, ..Self::default() }
    }

    /// Targets ordered by sequence number.
    pub fn sorted_targets(&self) -> Vec<&TargetConfig> {
        let mut targets: Vec<&TargetConfig> = self.targets.iter().collect();
        targets.sort_by_key(|t| t.seq_no);
        targets
    }

    pub fn first_target(&self) -> Option<&TargetConfig> {
        self.targets.iter().min_by_key(|t| t.seq_no)
    }

    /// The target whose `end` ack terminates a repeat.
    ///
    /// Ties on `seq_no` resolve to the target listed last.
    pub fn last_target(&self) -> Option<&TargetConfig> {
        self.targets.iter().max_by_key(|t| t.seq_no)
    }

    /// Distinct device names expected to acknowledge.
    pub fn expected_devices(&self) -> BTreeSet<String> {
        self.targets
            .iter()
            .map(|t| t.target_name.clone())
            .filter(|name| !name.is_empty())
            .collect()
    }

    /// Draw a start delay of 2 to 5 whole seconds.
    pub fn draw_random_delay<R: Rng + ?Sized>(rng: &mut R) -> f64 {
        f64::from(rng.gen_range(2u32..6))
    }
}
