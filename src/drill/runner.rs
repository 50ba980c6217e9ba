//! DrillRunner drives a [`DrillMachine`] against a live link

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, sleep_until};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::machine::{DrillMachine, DrillOutput, DrillUpdate};
use crate::channel::MessageWriter;
use crate::link::Link;
use crate::router::Event;
use crate::types::{DrillRepeatSummary, DrillSetup};
use crate::{LinkError, Result};

/// Result of spawning a drill
pub struct DrillChannels {
    /// Control surface for the running drill
    pub handle: DrillHandle,
    /// Progress, timeouts, summaries and failures, in order
    pub updates: UnboundedReceiverStream<DrillUpdate>,
}

#[derive(Debug)]
enum DrillCommand {
    ReadinessCheck,
    Start,
    ManualStop,
    Stop,
    SetRepeat(u32),
    SetRandomDelay(Option<f64>),
    SetBeepTime(Instant),
    Complete(oneshot::Sender<Vec<DrillRepeatSummary>>),
}

/// Spawns the task that owns a drill's state.
///
/// The task subscribes to the link's events, writes the machine's outbound
/// commands through the link's writer and sleeps until the machine's next
/// deadline. It ends when the handle shuts it down, every handle is
/// dropped, or the link itself shuts down.
pub struct DrillRunner;

impl DrillRunner {
    pub fn spawn(link: &Link, setup: DrillSetup) -> DrillChannels {
        let machine = DrillMachine::new(setup, link.config().drill.clone());
        // Subscribe before spawning so no ack can slip past
        let events = link.subscribe();
        let writer = link.writer().clone();
        let cancel = link.cancel_token().child_token();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (update_tx, update_rx) = mpsc::unbounded_channel();

        let cancel_task = cancel.clone();
        tokio::spawn(async move {
            Self::drill_task(machine, events, writer, command_rx, update_tx, cancel_task).await;
        });

        DrillChannels {
            handle: DrillHandle { commands: command_tx, cancel },
            updates: UnboundedReceiverStream::new(update_rx),
        }
    }

    /// Drill task - applies commands, events and deadlines to the machine
    async fn drill_task(
        mut machine: DrillMachine,
        mut events: broadcast::Receiver<Event>,
        writer: MessageWriter,
        mut commands: mpsc::UnboundedReceiver<DrillCommand>,
        updates: mpsc::UnboundedSender<DrillUpdate>,
        cancel: CancellationToken,
    ) {
        info!(targets = machine.setup().targets.len(), "Drill task started");
        let mut events_open = true;

        loop {
            while let Some(output) = machine.poll_output() {
                match output {
                    DrillOutput::Transmit(outbound) => {
                        if let Err(e) = writer.send_outbound(&outbound).await {
                            machine.abort(e);
                        }
                    }
                    DrillOutput::Update(update) => {
                        // A dropped update stream is not an error
                        let _ = updates.send(update);
                    }
                }
            }

            let deadline = machine.poll_timeout();
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Drill task cancelled");
                    break;
                }
                command = commands.recv() => {
                    let Some(command) = command else {
                        debug!("All drill handles dropped");
                        break;
                    };
                    Self::apply(&mut machine, command, &writer);
                }
                event = events.recv(), if events_open => match event {
                    Ok(event) => machine.handle_event(event, Instant::now()),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Drill task lagged behind link events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        events_open = false;
                        machine.handle_event(Event::Disconnected, Instant::now());
                    }
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    machine.handle_timeout(Instant::now());
                }
            }
        }

        machine.stop_execution();
        info!("Drill task ended");
    }

    fn apply(machine: &mut DrillMachine, command: DrillCommand, writer: &MessageWriter) {
        let now = Instant::now();
        match command {
            DrillCommand::ReadinessCheck if !writer.is_connected() => {
                machine.abort(LinkError::disconnected("readiness check"));
            }
            DrillCommand::ReadinessCheck => machine.perform_readiness_check(now),
            DrillCommand::Start if !writer.is_connected() => {
                machine.abort(LinkError::disconnected("start execution"));
            }
            DrillCommand::Start => machine.start_execution(now),
            DrillCommand::ManualStop => machine.manual_stop_repeat(now),
            DrillCommand::Stop => machine.stop_execution(),
            DrillCommand::SetRepeat(repeat) => machine.set_current_repeat(repeat),
            DrillCommand::SetRandomDelay(delay) => machine.set_random_delay(delay),
            DrillCommand::SetBeepTime(at) => machine.set_beep_time(at),
            DrillCommand::Complete(reply) => {
                let _ = reply.send(machine.complete_drill());
            }
        }
    }
}

/// Cloneable control surface of a running drill.
///
/// Commands are queued to the drill task and applied in order. Every
/// method fails with [`LinkError::Closed`] once the task has ended.
#[derive(Debug, Clone)]
pub struct DrillHandle {
    commands: mpsc::UnboundedSender<DrillCommand>,
    cancel: CancellationToken,
}

impl DrillHandle {
    fn send(&self, command: DrillCommand) -> Result<()> {
        self.commands.send(command).map_err(|_| LinkError::Closed)
    }

    /// Send `ready` to every target and wait for their acks.
    pub fn perform_readiness_check(&self) -> Result<()> {
        self.send(DrillCommand::ReadinessCheck)
    }

    /// Broadcast `start` and begin collecting shots.
    pub fn start_execution(&self) -> Result<()> {
        self.send(DrillCommand::Start)
    }

    /// Broadcast `end` and finalize once the grace period has passed.
    pub fn manual_stop_repeat(&self) -> Result<()> {
        self.send(DrillCommand::ManualStop)
    }

    pub fn stop_execution(&self) -> Result<()> {
        self.send(DrillCommand::Stop)
    }

    pub fn set_current_repeat(&self, repeat: u32) -> Result<()> {
        self.send(DrillCommand::SetRepeat(repeat))
    }

    pub fn set_random_delay(&self, delay: Option<f64>) -> Result<()> {
        self.send(DrillCommand::SetRandomDelay(delay))
    }

    /// Record when the start cue sounded; split times are measured from it.
    pub fn set_beep_time(&self, at: Instant) -> Result<()> {
        self.send(DrillCommand::SetBeepTime(at))
    }

    /// Stop the drill and collect every finalized repeat, in repeat order.
    pub async fn complete_drill(&self) -> Result<Vec<DrillRepeatSummary>> {
        let (reply, rx) = oneshot::channel();
        self.send(DrillCommand::Complete(reply))?;
        rx.await.map_err(|_| LinkError::Closed)
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::test_utils::{MockSink, ack_json, next_sent, scripted_source, shot_json, two_target_setup};
    use crate::types::RepeatCompletion;
    use futures::StreamExt;
    use std::sync::Arc;
    use std::time::Duration;

    fn spawn_link() -> (Link, crate::test_utils::SourceHandle, Arc<MockSink>) {
        let (source, handle) = scripted_source();
        let sink = Arc::new(MockSink::new());
        let link = Link::spawn(source, sink.clone(), LinkConfig::default());
        (link, handle, sink)
    }

    async fn next_update(updates: &mut UnboundedReceiverStream<DrillUpdate>) -> DrillUpdate {
        tokio::time::timeout(Duration::from_secs(60), updates.next()).await.unwrap().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn readiness_then_repeat() {
        let (link, source, sink) = spawn_link();
        let mut sent = sink.subscribe();
        let DrillChannels { handle, mut updates } = DrillRunner::spawn(&link, two_target_setup());

        handle.perform_readiness_check().unwrap();
        next_sent(&mut sent, "ready").await;
        next_sent(&mut sent, "ready").await;
        source.push_json(&ack_json("T-A", "ready"));
        source.push_json(&ack_json("T-B", "ready"));

        assert!(matches!(next_update(&mut updates).await, DrillUpdate::ReadinessProgress { acked: 1, .. }));
        assert!(matches!(next_update(&mut updates).await, DrillUpdate::ReadinessProgress { acked: 2, .. }));
        assert!(matches!(next_update(&mut updates).await, DrillUpdate::ReadyConfirmed));

        handle.start_execution().unwrap();
        next_sent(&mut sent, "start").await;
        source.push_json(&shot_json("T-A", "azone", Some(1)));
        source.push_json(&shot_json("T-B", "czone", Some(1)));
        source.push_json(&ack_json("T-B", "end"));
        next_sent(&mut sent, "end").await;

        match next_update(&mut updates).await {
            DrillUpdate::RepeatFinalized(summary) => {
                assert_eq!(summary.score, 8);
                assert_eq!(summary.num_shots, 2);
                assert_eq!(summary.completion, RepeatCompletion::EndSignal);
            }
            other => panic!("unexpected update {other:?}"),
        }
        let summaries = handle.complete_drill().await.unwrap();
        assert_eq!(summaries.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn readiness_times_out_on_silent_target() {
        let (link, source, _sink) = spawn_link();
        let DrillChannels { handle, mut updates } = DrillRunner::spawn(&link, two_target_setup());

        handle.perform_readiness_check().unwrap();
        source.push_json(&ack_json("T-A", "ready"));
        assert!(matches!(next_update(&mut updates).await, DrillUpdate::ReadinessProgress { .. }));

        let started = Instant::now();
        match next_update(&mut updates).await {
            DrillUpdate::ReadinessTimeout(missing) => assert_eq!(missing, vec!["T-B".to_string()]),
            other => panic!("unexpected update {other:?}"),
        }
        assert!(started.elapsed() <= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnected_link_fails_readiness() {
        let (link, _source, sink) = spawn_link();
        sink.set_connected(false);
        let DrillChannels { handle, mut updates } = DrillRunner::spawn(&link, two_target_setup());

        handle.perform_readiness_check().unwrap();
        assert!(matches!(
            next_update(&mut updates).await,
            DrillUpdate::Failure(LinkError::ChannelDisconnected { .. })
        ));
        assert!(sink.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_handle() {
        let (link, _source, _sink) = spawn_link();
        let DrillChannels { handle, mut updates } = DrillRunner::spawn(&link, two_target_setup());
        handle.shutdown();
        assert!(updates.next().await.is_none());
        assert!(matches!(handle.complete_drill().await, Err(LinkError::Closed)));
    }
}
