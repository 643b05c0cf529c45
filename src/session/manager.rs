use super::backoff::Backoff;
use super::machine::{Admission, SessionAction, SessionMachine};
use super::transport::{
    ControllerTransport, TransportEvent, EVENT_AUTH_ACK, EVENT_AUTH_REJECT, EVENT_COMMAND,
    EVENT_COMMAND_ACK, EVENT_CREDENTIALS, EVENT_HEARTBEAT, EVENT_OPEN, EVENT_STATUS,
};
use super::{SessionError, SessionPhase, SessionState};
use crate::config::SessionConfig;
use crate::dispatch::OutboundCommand;
use crate::fault::FaultReporter;
use crate::status::StatusReflector;
use chrono::Local;
use serde_json::json;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Resolution of heartbeat, auth-timeout and retry timers
const SESSION_TICK: Duration = Duration::from_millis(100);

enum LoopEvent {
    Shutdown,
    Command(Option<OutboundCommand>),
    Inbound(TransportEvent),
    Tick,
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Drives the session machine from transport events, timers and commands
pub struct SessionManager {
    config: SessionConfig,
    machine: SessionMachine,
    transport: Box<dyn ControllerTransport>,
    commands: mpsc::Receiver<OutboundCommand>,
    commands_open: bool,
    link_up: bool,
    state_tx: watch::Sender<SessionState>,
    reflector: StatusReflector,
    faults: FaultReporter,
}

impl SessionManager {
    pub fn new(
        config: SessionConfig,
        transport: Box<dyn ControllerTransport>,
        commands: mpsc::Receiver<OutboundCommand>,
        reflector: StatusReflector,
        faults: FaultReporter,
    ) -> Self {
        let machine = SessionMachine::new(&config, Backoff::new(&config.backoff), now());
        let (state_tx, _) = watch::channel(machine.state().clone());
        Self {
            config,
            machine,
            transport,
            commands,
            commands_open: true,
            link_up: false,
            state_tx,
            reflector,
            faults,
        }
    }

    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            "Session manager starting for {}:{}",
            self.config.host, self.config.port
        );
        let mut ticker = tokio::time::interval(SESSION_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let actions = self.machine.start(now());
        self.execute(actions).await;

        loop {
            self.publish_state();

            if self.machine.phase() == SessionPhase::Connecting {
                let connected = tokio::select! {
                    _ = cancel.cancelled() => break,
                    connected = self.transport.connect() => connected,
                };
                let actions = match connected {
                    Ok(()) => {
                        info!("Transport connected, authenticating");
                        self.link_up = true;
                        self.machine.on_connected(now())
                    }
                    Err(e) => {
                        warn!("{} ({:?})", e, e.class());
                        self.machine.on_connect_failed(now())
                    }
                };
                self.execute(actions).await;
                continue;
            }

            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => LoopEvent::Shutdown,
                command = self.commands.recv(), if self.commands_open => {
                    LoopEvent::Command(command)
                }
                inbound = self.transport.next_event(), if self.link_up => {
                    LoopEvent::Inbound(inbound)
                }
                _ = ticker.tick() => LoopEvent::Tick,
            };

            let actions = match event {
                LoopEvent::Shutdown => break,
                LoopEvent::Command(Some(command)) => self.offer(command).into_iter().collect(),
                LoopEvent::Command(None) => {
                    debug!("Command channel closed");
                    self.commands_open = false;
                    Vec::new()
                }
                LoopEvent::Inbound(event) => self.on_inbound(event),
                LoopEvent::Tick => self.machine.on_tick(now()),
            };
            self.execute(actions).await;
        }

        self.shutdown().await;
    }

    fn offer(&mut self, command: OutboundCommand) -> Option<SessionAction> {
        let sequence = command.sequence;
        match self.machine.admit(command, now()) {
            Admission::Send(command) => Some(SessionAction::Send(command)),
            Admission::Held => None,
            Admission::Dropped(reason) => {
                let e = SessionError::CommandDropped {
                    sequence,
                    reason: reason.to_string(),
                };
                debug!("{} ({:?})", e, e.class());
                None
            }
        }
    }

    fn on_inbound(&mut self, event: TransportEvent) -> Vec<SessionAction> {
        let at = now();
        match event {
            TransportEvent::Closed { reason } => {
                warn!("Transport closed: {}", reason);
                self.link_up = false;
                self.machine.on_closed(at)
            }
            TransportEvent::Message { event, payload } => match event.as_str() {
                EVENT_AUTH_ACK => {
                    let run_state = self.reflector.current().map(|s| s.run_state);
                    self.machine.on_auth_ack(at, run_state)
                }
                EVENT_AUTH_REJECT => {
                    let reason = payload
                        .get("reason")
                        .and_then(|r| r.as_str())
                        .unwrap_or("credentials rejected")
                        .to_string();
                    let e = SessionError::AuthRejected(reason.clone());
                    error!("{} ({:?})", e, e.class());
                    self.machine.on_auth_reject(at, reason)
                }
                EVENT_STATUS => {
                    self.reflector.handle(&payload);
                    self.machine.on_inbound(at);
                    Vec::new()
                }
                EVENT_COMMAND_ACK => {
                    self.machine.on_inbound(at);
                    match payload.get("sequence").and_then(|s| s.as_u64()) {
                        Some(sequence) => self.machine.on_command_ack(sequence),
                        None => warn!("commandAck without sequence: {}", payload),
                    }
                    Vec::new()
                }
                other => {
                    if other != EVENT_HEARTBEAT {
                        debug!("Unhandled inbound event '{}'", other);
                    }
                    self.machine.on_inbound(at);
                    Vec::new()
                }
            },
        }
    }

    async fn execute(&mut self, actions: Vec<SessionAction>) {
        let mut queue: VecDeque<SessionAction> = actions.into();

        while let Some(action) = queue.pop_front() {
            let sent = match action {
                SessionAction::Connect => Ok(()),
                SessionAction::SendCredentials => {
                    debug!("Sending credentials for {}", self.config.credentials.name);
                    let payload = json!({
                        "name": self.config.credentials.name,
                        "token": self.config.credentials.token,
                    });
                    self.transport.send(EVENT_CREDENTIALS, payload).await
                }
                SessionAction::SendOpen => match &self.config.machine_port {
                    Some(port) => {
                        info!("Requesting port {} at {} baud", port.port, port.baudrate);
                        let payload = json!({
                            "port": port.port,
                            "baudrate": port.baudrate,
                            "controllerType": port.controller_type,
                        });
                        self.transport.send(EVENT_OPEN, payload).await
                    }
                    None => Ok(()),
                },
                SessionAction::SendHeartbeat => {
                    let payload = json!({ "timestamp": Local::now().to_rfc3339() });
                    self.transport.send(EVENT_HEARTBEAT, payload).await
                }
                SessionAction::Send(command) => {
                    debug!("Sending #{} {}", command.sequence, command.intent.name());
                    match serde_json::to_value(&command) {
                        Ok(payload) => self.transport.send(EVENT_COMMAND, payload).await,
                        Err(e) => {
                            error!("Cannot encode command #{}: {}", command.sequence, e);
                            Ok(())
                        }
                    }
                }
                SessionAction::CloseTransport => {
                    self.close_transport().await;
                    Ok(())
                }
                SessionAction::Fatal(condition) => {
                    self.faults.raise(condition);
                    Ok(())
                }
            };

            if let Err(e) = sent {
                warn!("{} ({:?})", e, e.class());
                queue.extend(self.machine.on_transport_error(now()));
            }
        }
        self.publish_state();
    }

    async fn close_transport(&mut self) {
        if tokio::time::timeout(self.config.close_timeout(), self.transport.close())
            .await
            .is_err()
        {
            warn!("Transport close timed out, dropping link");
        }
        self.link_up = false;
    }

    /// Hands remaining commands (the final stop) to the link, then closes it
    async fn shutdown(&mut self) {
        info!("Session manager shutting down");
        let close_timeout = self.config.close_timeout();
        if tokio::time::timeout(close_timeout, self.drain()).await.is_err() {
            warn!("Command drain timed out after {:?}", close_timeout);
        }
        if self.link_up {
            self.close_transport().await;
        }
        self.publish_state();
    }

    async fn drain(&mut self) {
        while self.commands_open {
            match self.commands.recv().await {
                Some(command) => {
                    if let Some(action) = self.offer(command) {
                        self.execute(vec![action]).await;
                    }
                }
                None => self.commands_open = false,
            }
        }
    }

    fn publish_state(&self) {
        let state = self.machine.state();
        self.state_tx.send_if_modified(|current| {
            if current != state {
                *current = state.clone();
                true
            } else {
                false
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Intent;
    use crate::controller::JogVector;
    use crate::fault::{fault_channel, FatalCondition};
    use crate::session::transport::tests::{MemoryTransport, Wire};
    use crate::status::RunState;
    use std::sync::{Arc, Mutex};

    struct Harness {
        wire: Arc<Mutex<Wire>>,
        inbound: mpsc::UnboundedSender<TransportEvent>,
        commands: mpsc::Sender<OutboundCommand>,
        state: watch::Receiver<SessionState>,
        status: watch::Receiver<Option<crate::status::MachineStatus>>,
        signal: crate::fault::FaultSignal,
        cancel: CancellationToken,
        task: JoinHandle<()>,
    }

    fn start() -> Harness {
        let (transport, wire, inbound) = MemoryTransport::new();
        let (commands, command_rx) = mpsc::channel(16);
        let (reflector, status) = StatusReflector::new();
        let (faults, signal) = fault_channel();
        let cancel = CancellationToken::new();

        let manager = SessionManager::new(
            SessionConfig::default(),
            Box::new(transport),
            command_rx,
            reflector,
            faults,
        );
        let state = manager.state();
        let task = manager.spawn(cancel.clone());
        Harness {
            wire,
            inbound,
            commands,
            state,
            status,
            signal,
            cancel,
            task,
        }
    }

    fn message(event: &str, payload: serde_json::Value) -> TransportEvent {
        TransportEvent::Message {
            event: event.to_string(),
            payload,
        }
    }

    fn command(sequence: u64, epoch: u64, intent: Intent) -> OutboundCommand {
        OutboundCommand {
            sequence,
            epoch,
            intent,
        }
    }

    async fn wait_ready(h: &mut Harness, epoch: u64) {
        h.state
            .wait_for(|s| s.is_ready() && s.epoch == epoch)
            .await
            .unwrap();
    }

    fn sent_sequences(h: &Harness) -> Vec<u64> {
        h.wire
            .lock()
            .unwrap()
            .sent_named(EVENT_COMMAND)
            .iter()
            .filter_map(|c| c["sequence"].as_u64())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn authenticates_sends_commands_and_reflects_status() {
        let mut h = start();
        h.inbound.send(message(EVENT_AUTH_ACK, json!({}))).unwrap();
        wait_ready(&mut h, 1).await;
        assert_eq!(h.wire.lock().unwrap().sent_named(EVENT_CREDENTIALS).len(), 1);

        let jog = Intent::Jog {
            vector: JogVector {
                x: 0.5,
                y: 0.0,
                z: 0.0,
            },
            feed_rate: 500.0,
        };
        h.commands.send(command(1, 1, jog)).await.unwrap();
        h.inbound
            .send(message(
                EVENT_STATUS,
                json!({
                    "runState": "Jog",
                    "workPosition": { "x": 1.0, "y": 2.0, "z": 3.0 },
                    "feedRate": 500.0,
                }),
            ))
            .unwrap();

        h.status.wait_for(|s| s.is_some()).await.unwrap();
        assert_eq!(
            h.status.borrow().as_ref().map(|s| s.run_state),
            Some(RunState::Run)
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sent_sequences(&h), vec![1]);

        h.cancel.cancel();
        h.task.await.unwrap();
        assert_eq!(h.wire.lock().unwrap().closes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_credentials_raise_fatal() {
        let mut h = start();
        h.inbound
            .send(message(EVENT_AUTH_REJECT, json!({ "reason": "bad token" })))
            .unwrap();

        let condition = h.signal.wait().await;
        assert_eq!(
            condition,
            FatalCondition::AuthRejected("bad token".to_string())
        );

        // No reconnect attempts after a rejection
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.wire.lock().unwrap().connects, 1);
        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_replays_stop_but_never_old_jogs() {
        let mut h = start();
        h.inbound.send(message(EVENT_AUTH_ACK, json!({}))).unwrap();
        wait_ready(&mut h, 1).await;

        h.inbound
            .send(TransportEvent::Closed {
                reason: "cable".to_string(),
            })
            .unwrap();
        h.state
            .wait_for(|s| s.phase == SessionPhase::Disconnected)
            .await
            .unwrap();

        let jog = Intent::Jog {
            vector: JogVector {
                x: 0.3,
                y: 0.0,
                z: 0.0,
            },
            feed_rate: 300.0,
        };
        h.commands.send(command(5, 1, jog.clone())).await.unwrap();
        h.commands
            .send(command(6, 1, Intent::StopAll))
            .await
            .unwrap();

        h.inbound.send(message(EVENT_AUTH_ACK, json!({}))).unwrap();
        wait_ready(&mut h, 2).await;

        h.commands.send(command(7, 1, jog)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(sent_sequences(&h), vec![6]);
        assert_eq!(h.wire.lock().unwrap().connects, 2);

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn final_stop_is_drained_before_close() {
        let mut h = start();
        h.inbound.send(message(EVENT_AUTH_ACK, json!({}))).unwrap();
        wait_ready(&mut h, 1).await;

        h.cancel.cancel();
        h.commands
            .send(command(1, 1, Intent::StopAll))
            .await
            .unwrap();
        drop(h.commands);
        h.task.await.unwrap();

        let wire = h.wire.lock().unwrap();
        assert_eq!(wire.sent_named(EVENT_COMMAND).len(), 1);
        assert_eq!(wire.closes, 1);
    }
}
