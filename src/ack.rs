//! Acknowledgment tracking for broadcast commands.
//!
//! [`AckTracker`] is a plain state holder: it never sleeps and never spawns.
//! The owner arms it with a deadline, feeds it acks, and calls
//! [`AckTracker::on_deadline`] when its timer fires. At most one wait is
//! active at a time; beginning a new wait discards the previous one.

use std::collections::{BTreeMap, BTreeSet};

use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How a wait resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    Success,
    /// Expected devices that never acknowledged, sorted.
    Timeout(Vec<String>),
}

/// Progress after an accepted ack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckProgress {
    pub acked: usize,
    pub expected: usize,
    /// Set when this ack completed the wait.
    pub outcome: Option<AckOutcome>,
}

#[derive(Debug, Default)]
pub struct AckTracker {
    expected: BTreeSet<String>,
    acked: BTreeSet<String>,
    delay_times: BTreeMap<String, String>,
    global_delay_time: Option<String>,
    deadline: Option<Instant>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start waiting for `expected` to acknowledge before `deadline`.
    ///
    /// Clears acks and delay times from any earlier wait. Returns
    /// `Some(Success)` immediately when there is nothing to wait for.
    pub fn begin_waiting(&mut self, expected: BTreeSet<String>, deadline: Instant) -> Option<AckOutcome> {
        self.acked.clear();
        self.delay_times.clear();
        self.global_delay_time = None;
        self.expected = expected;

        if self.expected.is_empty() {
            debug!("No devices to wait for");
            self.deadline = None;
            return Some(AckOutcome::Success);
        }

        debug!(expected = self.expected.len(), "Waiting for acks");
        self.deadline = Some(deadline);
        None
    }

    /// Record an ack from `device`.
    ///
    /// Delay times are retained even outside a wait. Returns `None` when no
    /// wait is active or the device already acknowledged.
    pub fn on_ack(&mut self, device: &str, delay_time: Option<&str>) -> Option<AckProgress> {
        if let Some(delay) = delay_time {
            self.delay_times.insert(device.to_string(), delay.to_string());
            if self.global_delay_time.is_none() && !is_zero(delay) {
                debug!(device, delay, "Captured global delay time");
                self.global_delay_time = Some(delay.to_string());
            }
        }

        if !self.is_waiting() {
            return None;
        }
        if !self.expected.contains(device) {
            debug!(device, "Ack from device outside the expected set");
        }
        if !self.acked.insert(device.to_string()) {
            return None;
        }

        let acked = self.acked.len();
        let expected = self.expected.len();
        debug!(device, acked, expected, "Device acknowledged");

        let outcome = if acked >= expected {
            info!(acked, "All devices acknowledged");
            self.deadline = None;
            Some(AckOutcome::Success)
        } else {
            None
        };
        Some(AckProgress { acked, expected, outcome })
    }

    /// Resolve the wait as timed out if `now` has reached the deadline.
    pub fn on_deadline(&mut self, now: Instant) -> Option<AckOutcome> {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                let missing = self.non_responsive();
                warn!(?missing, "Ack wait timed out");
                Some(AckOutcome::Timeout(missing))
            }
            _ => None,
        }
    }

    /// Abandon the current wait without an outcome.
    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_waiting(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Expected devices that have not acknowledged yet.
    pub fn non_responsive(&self) -> Vec<String> {
        self.expected.difference(&self.acked).cloned().collect()
    }

    /// First non-zero delay time reported since the wait began.
    pub fn global_delay_time(&self) -> Option<&str> {
        self.global_delay_time.as_deref()
    }

    pub fn delay_time(&self, device: &str) -> Option<&str> {
        self.delay_times.get(device).map(String::as_str)
    }
}

fn is_zero(delay: &str) -> bool {
    delay.trim().parse::<f64>().is_ok_and(|d| d == 0.0)
}
