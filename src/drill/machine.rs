//! Drill execution state machine.
//!
//! [`DrillMachine`] performs no I/O and reads no clock. Callers pass the
//! current [`Instant`] into every method, write whatever
//! [`poll_output`](DrillMachine::poll_output) yields, and call
//! [`handle_timeout`](DrillMachine::handle_timeout) once
//! [`poll_timeout`](DrillMachine::poll_timeout) has passed.
//!
//! ```text
//! Idle -> AwaitingAcks -> ReadyConfirmed -> AwaitingEnd -> Finalized
//!              |                               |    ^
//!              v (timeout)                     v    | (grace elapsed)
//!             Idle                         GracePeriod
//! ```

use std::collections::{BTreeMap, VecDeque};

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::ack::{AckOutcome, AckTracker};
use crate::config::DrillConfig;
use crate::router::{AckKind, Event};
use crate::scoring::{recompute_time_diffs, score};
use crate::types::{
    Command, DrillMode, DrillRepeatSummary, DrillSetup, Outbound, ReadyCommand, RepeatCompletion, Request,
    ShotData, ShotEvent, round_delay,
};
use crate::{LinkError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrillState {
    Idle,
    AwaitingAcks,
    ReadyConfirmed,
    AwaitingEnd,
    GracePeriod,
    Finalized,
}

/// Progress reported to the drill's owner.
#[derive(Debug)]
pub enum DrillUpdate {
    ReadinessProgress { acked: usize, expected: usize },
    /// Readiness check expired; these targets never acknowledged.
    ReadinessTimeout(Vec<String>),
    ReadyConfirmed,
    /// The last target never reported `end`; the repeat is finalized anyway.
    EndTimeout { repeat: u32 },
    RepeatFinalized(DrillRepeatSummary),
    /// No shots were collected; the repeat may be run again.
    RepeatInvalidated { repeat: u32 },
    Failure(LinkError),
}

impl DrillUpdate {
    /// The error equivalent of an update, for callers who prefer `?`.
    pub fn into_error(self, config: &DrillConfig) -> Option<LinkError> {
        match self {
            DrillUpdate::ReadinessTimeout(devices) => Some(LinkError::ack_timeout(devices, config.ack_timeout)),
            DrillUpdate::EndTimeout { repeat } => Some(LinkError::EndTimeout { repeat, timeout: config.end_timeout }),
            DrillUpdate::RepeatInvalidated { repeat } => Some(LinkError::EmptyRepeat { repeat }),
            DrillUpdate::Failure(e) => Some(e),
            _ => None,
        }
    }
}

/// Work for the owner: something to write, or something to report.
#[derive(Debug)]
pub enum DrillOutput {
    Transmit(Outbound),
    Update(DrillUpdate),
}

/// One drill, run one repeat at a time.
#[derive(Debug)]
pub struct DrillMachine {
    setup: DrillSetup,
    config: DrillConfig,
    state: DrillState,
    current_repeat: u32,
    random_delay: Option<f64>,
    acks: AckTracker,
    shots: Vec<ShotEvent>,
    beep_time: Option<Instant>,
    start_time: Option<Instant>,
    reported_duration: Option<f64>,
    end_deadline: Option<Instant>,
    grace_deadline: Option<Instant>,
    summaries: BTreeMap<u32, DrillRepeatSummary>,
    outputs: VecDeque<DrillOutput>,
}

impl DrillMachine {
    pub fn new(setup: DrillSetup, config: DrillConfig) -> Self {
        Self {
            setup,
            config,
            state: DrillState::Idle,
            current_repeat: 1,
            random_delay: None,
            acks: AckTracker::new(),
            shots: Vec::new(),
            beep_time: None,
            start_time: None,
            reported_duration: None,
            end_deadline: None,
            grace_deadline: None,
            summaries: BTreeMap::new(),
            outputs: VecDeque::new(),
        }
    }

    pub fn state(&self) -> DrillState {
        self.state
    }

    pub fn setup(&self) -> &DrillSetup {
        &self.setup
    }

    pub fn current_repeat(&self) -> u32 {
        self.current_repeat
    }

    pub fn set_current_repeat(&mut self, repeat: u32) {
        debug!(repeat, "Current repeat set");
        self.current_repeat = repeat;
    }

    /// Delay sent in ready commands instead of the configured one.
    pub fn set_random_delay(&mut self, delay: Option<f64>) {
        self.random_delay = delay;
    }

    /// When the audible start cue fired.
    pub fn set_beep_time(&mut self, at: Instant) {
        self.beep_time = Some(at);
    }

    /// Shots collected for the current repeat so far.
    pub fn shots(&self) -> &[ShotEvent] {
        &self.shots
    }

    /// Send a ready command to every target and wait for their acks.
    ///
    /// All commands are serialized before any is queued, so a bad target
    /// aborts the whole batch.
    pub fn perform_readiness_check(&mut self, now: Instant) {
        if matches!(self.state, DrillState::AwaitingEnd | DrillState::GracePeriod) {
            warn!(state = ?self.state, "Readiness check requested while a repeat is running");
            return;
        }

        self.shots.clear();
        self.beep_time = None;
        self.start_time = None;

        let batch = match self.ready_batch() {
            Ok(batch) => batch,
            Err(e) => {
                warn!("Readiness check aborted: {}", e);
                self.state = DrillState::Idle;
                self.push_update(DrillUpdate::Failure(e));
                return;
            }
        };
        info!(repeat = self.current_repeat, commands = batch.len(), "Sending ready commands");
        self.outputs.extend(batch.into_iter().map(DrillOutput::Transmit));

        self.state = DrillState::AwaitingAcks;
        let deadline = now + self.config.ack_timeout;
        if let Some(outcome) = self.acks.begin_waiting(self.setup.expected_devices(), deadline) {
            self.finish_ack_wait(outcome);
        }
    }

    fn ready_batch(&self) -> Result<Vec<Outbound>> {
        let delay = round_delay(self.random_delay.unwrap_or(self.setup.delay));
        let targets = self.setup.sorted_targets();
        let last = targets.len().saturating_sub(1);
        let mut batch = Vec::with_capacity(targets.len());

        for (index, target) in targets.iter().enumerate() {
            let ready = if target.is_disguised_enemy() {
                ReadyCommand::disguised_enemy()
            } else {
                ReadyCommand {
                    delay: Some(delay),
                    target_type: target.target_type.clone(),
                    timeout: Some(target.timeout),
                    counted_shots: Some(target.counted_shots),
                    repeat: Some(self.current_repeat),
                    is_first: Some(index == 0),
                    is_last: Some(index == last),
                    mode: self.setup.mode,
                }
            };
            batch.push(Outbound::new(Request::forward(target.target_name.as_str(), Command::Ready(ready)))?);

            if self.setup.mode == DrillMode::Cqb {
                if let Some(action) = target.action.as_deref().filter(|a| !a.is_empty()) {
                    let animation = Command::AnimationConfig { action: action.to_string(), duration: target.duration };
                    batch.push(Outbound::new(Request::forward(target.target_name.as_str(), animation))?);
                }
            }
        }
        Ok(batch)
    }

    fn finish_ack_wait(&mut self, outcome: AckOutcome) {
        match outcome {
            AckOutcome::Success => {
                info!(repeat = self.current_repeat, "All targets ready");
                self.state = DrillState::ReadyConfirmed;
                self.push_update(DrillUpdate::ReadyConfirmed);
            }
            AckOutcome::Timeout(missing) => {
                warn!(repeat = self.current_repeat, ?missing, "Readiness check timed out");
                self.state = DrillState::Idle;
                self.push_update(DrillUpdate::ReadinessTimeout(missing));
            }
        }
    }

    /// Broadcast `start` and begin collecting shots.
    pub fn start_execution(&mut self, now: Instant) {
        if matches!(self.state, DrillState::AwaitingEnd | DrillState::GracePeriod) {
            warn!(state = ?self.state, "Start requested while a repeat is running");
            return;
        }
        if self.state != DrillState::ReadyConfirmed {
            debug!(state = ?self.state, "Starting without a confirmed readiness check");
        }
        self.acks.cancel();

        let delay_time = self.acks.global_delay_time().map(str::to_string);
        let start = match Outbound::new(Request::broadcast(Command::Start { delay_time })) {
            Ok(start) => start,
            Err(e) => {
                self.push_update(DrillUpdate::Failure(e));
                return;
            }
        };

        info!(repeat = self.current_repeat, "Starting repeat");
        self.start_time = Some(now);
        self.reported_duration = None;
        self.grace_deadline = None;
        self.outputs.push_back(DrillOutput::Transmit(start));
        self.state = DrillState::AwaitingEnd;
        self.end_deadline = Some(now + self.config.end_timeout);

        if self.setup.expected_devices().is_empty() {
            debug!("No targets configured, completing repeat immediately");
            self.complete_repeat(RepeatCompletion::EndSignal);
        }
    }

    /// Feed a routed event.
    pub fn handle_event(&mut self, event: Event, now: Instant) {
        match event {
            Event::Ack(ack) => {
                let Some(device) = ack.device else {
                    debug!("Ignoring ack without device");
                    return;
                };
                match ack.kind {
                    AckKind::Ready => {
                        if let Some(progress) = self.acks.on_ack(&device, ack.delay_time.as_deref()) {
                            self.push_update(DrillUpdate::ReadinessProgress {
                                acked: progress.acked,
                                expected: progress.expected,
                            });
                            if let Some(outcome) = progress.outcome {
                                self.finish_ack_wait(outcome);
                            }
                        }
                    }
                    AckKind::End => self.on_end_ack(&device, ack.drill_duration),
                    _ => {}
                }
            }
            Event::Shot(shot) => self.on_shot(shot, now),
            Event::Disconnected => {
                if matches!(
                    self.state,
                    DrillState::AwaitingAcks | DrillState::AwaitingEnd | DrillState::GracePeriod
                ) {
                    warn!(state = ?self.state, "Link dropped during drill");
                    self.stop_execution();
                    self.push_update(DrillUpdate::Failure(LinkError::disconnected("drill execution")));
                }
            }
            _ => {}
        }
    }

    fn on_end_ack(&mut self, device: &str, drill_duration: Option<f64>) {
        if self.state != DrillState::AwaitingEnd {
            return;
        }
        if let Some(duration) = drill_duration {
            debug!(device, duration, "Drill duration reported");
            self.reported_duration = Some(duration);
        }
        let is_last = self.setup.last_target().is_some_and(|t| t.target_name == device);
        if !is_last {
            debug!(device, "End from a target other than the last one");
            return;
        }

        info!(device, repeat = self.current_repeat, "Last target ended");
        match Outbound::new(Request::broadcast(Command::End)) {
            Ok(end) => self.outputs.push_back(DrillOutput::Transmit(end)),
            Err(e) => self.push_update(DrillUpdate::Failure(e)),
        }
        self.complete_repeat(RepeatCompletion::EndSignal);
    }

    fn on_shot(&mut self, shot: ShotData, now: Instant) {
        if !matches!(self.state, DrillState::AwaitingEnd | DrillState::GracePeriod) {
            debug!(state = ?self.state, "Ignoring shot outside a running repeat");
            return;
        }
        if let Some(repeat) = shot.repeat {
            if repeat != self.current_repeat {
                debug!(repeat, current = self.current_repeat, "Ignoring shot from another repeat");
                return;
            }
        }
        debug!(device = ?shot.source(), hit_area = %shot.hit_area, "Shot accepted");
        self.shots.push(ShotEvent::new(shot, now));
    }

    /// Stop on the shooter's request: send `end` now, finalize after the grace period.
    pub fn manual_stop_repeat(&mut self, now: Instant) {
        if self.state != DrillState::AwaitingEnd {
            warn!(state = ?self.state, "Manual stop outside a running repeat");
            return;
        }
        match Outbound::new(Request::broadcast(Command::End)) {
            Ok(end) => self.outputs.push_back(DrillOutput::Transmit(end)),
            Err(e) => self.push_update(DrillUpdate::Failure(e)),
        }
        info!(repeat = self.current_repeat, grace = ?self.config.grace_period, "Manual stop, collecting late shots");
        self.end_deadline = None;
        self.grace_deadline = Some(now + self.config.grace_period);
        self.state = DrillState::GracePeriod;
    }

    /// Cancel every timer and stop collecting shots.
    pub fn stop_execution(&mut self) {
        debug!(state = ?self.state, "Stopping drill execution");
        self.acks.cancel();
        self.end_deadline = None;
        self.grace_deadline = None;
        self.state = DrillState::Idle;
    }

    /// Summaries of every finalized repeat, ordered by repeat index.
    pub fn complete_drill(&mut self) -> Vec<DrillRepeatSummary> {
        self.stop_execution();
        self.summaries.values().cloned().collect()
    }

    /// Earliest pending deadline.
    pub fn poll_timeout(&self) -> Option<Instant> {
        [self.acks.deadline(), self.end_deadline, self.grace_deadline].into_iter().flatten().min()
    }

    /// Fire every deadline that has passed.
    pub fn handle_timeout(&mut self, now: Instant) {
        if let Some(outcome) = self.acks.on_deadline(now) {
            self.finish_ack_wait(outcome);
        }
        if self.end_deadline.is_some_and(|d| now >= d) {
            warn!(repeat = self.current_repeat, "No end signal, finalizing repeat");
            self.end_deadline = None;
            self.push_update(DrillUpdate::EndTimeout { repeat: self.current_repeat });
            self.complete_repeat(RepeatCompletion::EndTimeout);
        }
        if self.grace_deadline.is_some_and(|d| now >= d) {
            self.grace_deadline = None;
            self.complete_repeat(RepeatCompletion::ManualStop);
        }
    }

    pub fn poll_output(&mut self) -> Option<DrillOutput> {
        self.outputs.pop_front()
    }

    /// Report a transport failure and drop everything still queued.
    pub fn abort(&mut self, error: LinkError) {
        warn!("Drill aborted: {}", error);
        self.outputs.clear();
        self.stop_execution();
        self.push_update(DrillUpdate::Failure(error));
    }

    fn complete_repeat(&mut self, completion: RepeatCompletion) {
        self.end_deadline = None;
        self.grace_deadline = None;
        let repeat = self.current_repeat;

        if self.shots.is_empty() {
            warn!(repeat, "No shots received, invalidating repeat");
            self.state = DrillState::Idle;
            self.push_update(DrillUpdate::RepeatInvalidated { repeat });
            return;
        }

        let mut shots = std::mem::take(&mut self.shots);
        let reference = self.beep_time.or(self.start_time);
        if let Some(reference) = reference {
            recompute_time_diffs(&mut shots, reference);
        } else {
            shots.sort_by_key(|s| s.received_at);
        }

        let breakdown = score(&shots, &self.setup.targets);
        let splits: Vec<f64> = shots.iter().map(|s| s.shot.time_diff).collect();
        let total_time = match (self.beep_time, self.reported_duration) {
            (Some(_), _) => splits.iter().sum(),
            (None, Some(duration)) => duration,
            (None, None) => splits.iter().sum(),
        };

        let summary = DrillRepeatSummary {
            repeat_index: repeat,
            total_time,
            num_shots: shots.len() as u32,
            first_shot: splits.first().copied().unwrap_or(0.0),
            fastest: splits.iter().copied().fold(f64::INFINITY, f64::min).max(0.0),
            score: breakdown.score,
            missed_targets: breakdown.missed_count,
            shots: shots.into_iter().map(|s| s.shot).collect(),
            completion,
        };
        info!(repeat, shots = summary.num_shots, score = summary.score, ?completion, "Repeat finalized");

        self.summaries.insert(repeat, summary.clone());
        self.state = DrillState::Finalized;
        self.push_update(DrillUpdate::RepeatFinalized(summary));
    }

    fn push_update(&mut self, update: DrillUpdate) {
        self.outputs.push_back(DrillOutput::Update(update));
    }
}
