//! Pure session state machine
//!
//! Inputs are transport outcomes, inbound events, timer ticks and commands
//! asking to go out; outputs are [`SessionAction`]s for the manager to carry
//! out. Nothing here performs I/O or reads the clock.

use super::backoff::Backoff;
use super::{SessionPhase, SessionState};
use crate::config::SessionConfig;
use crate::dispatch::{Intent, OutboundCommand};
use crate::fault::FatalCondition;
use crate::status::RunState;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Work for the manager
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    Connect,
    SendCredentials,
    /// Ask the server to open the configured machine port
    SendOpen,
    SendHeartbeat,
    Send(OutboundCommand),
    CloseTransport,
    Fatal(FatalCondition),
}

/// Verdict on a command offered to the session
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Send(OutboundCommand),
    /// Safety command kept for replay once `Ready`
    Held,
    Dropped(&'static str),
}

#[derive(Debug, Clone, Copy)]
struct Timing {
    auth_timeout: Duration,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    grace_period: Duration,
    replay_max_age: Duration,
    max_retries: u32,
    open_port: bool,
}

#[derive(Debug)]
pub struct SessionMachine {
    timing: Timing,
    state: SessionState,
    backoff: Backoff,
    phase_since: Instant,
    last_inbound: Instant,
    last_heartbeat: Option<Instant>,
    last_sent_sequence: Option<u64>,
    last_acked_sequence: Option<u64>,
    held_stop: Option<(OutboundCommand, Instant)>,
    held_home: Option<(OutboundCommand, Instant)>,
    /// Auth rejected or retries exhausted; no further connects
    halted: bool,
}

impl SessionMachine {
    pub fn new(config: &SessionConfig, backoff: Backoff, now: Instant) -> Self {
        Self {
            timing: Timing {
                auth_timeout: config.auth_timeout(),
                heartbeat_interval: config.heartbeat_interval(),
                heartbeat_timeout: config.heartbeat_timeout(),
                grace_period: config.grace_period(),
                replay_max_age: config.safety_replay_max_age(),
                max_retries: config.max_retries,
                open_port: config.machine_port.is_some(),
            },
            state: SessionState::default(),
            backoff,
            phase_since: now,
            last_inbound: now,
            last_heartbeat: None,
            last_sent_sequence: None,
            last_acked_sequence: None,
            held_stop: None,
            held_home: None,
            halted: false,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.phase
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    fn enter(&mut self, phase: SessionPhase, now: Instant) {
        if self.state.phase != phase {
            info!("Session {:?} -> {:?}", self.state.phase, phase);
        }
        self.state.phase = phase;
        self.phase_since = now;
    }

    pub fn start(&mut self, now: Instant) -> Vec<SessionAction> {
        if self.halted || self.state.phase != SessionPhase::Disconnected {
            return Vec::new();
        }
        self.state.next_retry_at = None;
        self.enter(SessionPhase::Connecting, now);
        vec![SessionAction::Connect]
    }

    pub fn on_connected(&mut self, now: Instant) -> Vec<SessionAction> {
        if self.state.phase != SessionPhase::Connecting {
            debug!("Late connect result in {:?}, closing", self.state.phase);
            return vec![SessionAction::CloseTransport];
        }
        self.enter(SessionPhase::Authenticating, now);
        self.last_inbound = now;
        vec![SessionAction::SendCredentials]
    }

    pub fn on_connect_failed(&mut self, now: Instant) -> Vec<SessionAction> {
        if self.state.phase != SessionPhase::Connecting {
            return Vec::new();
        }
        self.schedule_retry(now)
    }

    /// Credentials accepted; replays held safety commands that still apply
    pub fn on_auth_ack(
        &mut self,
        now: Instant,
        run_state: Option<RunState>,
    ) -> Vec<SessionAction> {
        if self.state.phase != SessionPhase::Authenticating {
            debug!("Ignoring authAck in {:?}", self.state.phase);
            return Vec::new();
        }

        self.backoff.reset();
        self.state.retry_count = 0;
        self.state.next_retry_at = None;
        self.become_ready(now);

        let mut actions = Vec::new();
        if self.timing.open_port {
            actions.push(SessionAction::SendOpen);
        }
        actions.extend(self.replay(now, run_state).into_iter().map(SessionAction::Send));
        actions
    }

    pub fn on_auth_reject(&mut self, now: Instant, reason: String) -> Vec<SessionAction> {
        if self.state.phase != SessionPhase::Authenticating {
            debug!("Ignoring authReject in {:?}", self.state.phase);
            return Vec::new();
        }
        self.halted = true;
        self.enter(SessionPhase::Disconnected, now);
        vec![
            SessionAction::CloseTransport,
            SessionAction::Fatal(FatalCondition::AuthRejected(reason)),
        ]
    }

    /// Any inbound traffic counts as a heartbeat
    pub fn on_inbound(&mut self, now: Instant) {
        self.last_inbound = now;
        if self.state.phase == SessionPhase::Degraded {
            info!("Heartbeat resumed");
            self.become_ready(now);
        }
    }

    pub fn on_command_ack(&mut self, sequence: u64) {
        match self.last_sent_sequence {
            Some(sent) if sequence <= sent => {}
            _ => {
                warn!("Ack for unsent command {}", sequence);
                return;
            }
        }
        if let Some(acked) = self.last_acked_sequence {
            if sequence <= acked {
                warn!("Ack regressed from {} to {}", acked, sequence);
                return;
            }
        }
        debug!("Command {} acknowledged", sequence);
        self.last_acked_sequence = Some(sequence);
    }

    /// Send or connect trouble on a live link
    pub fn on_transport_error(&mut self, now: Instant) -> Vec<SessionAction> {
        match self.state.phase {
            SessionPhase::Ready => {
                self.enter(SessionPhase::Degraded, now);
                Vec::new()
            }
            SessionPhase::Connecting | SessionPhase::Authenticating => {
                let mut actions = vec![SessionAction::CloseTransport];
                actions.extend(self.schedule_retry(now));
                actions
            }
            SessionPhase::Degraded | SessionPhase::Disconnected => Vec::new(),
        }
    }

    pub fn on_closed(&mut self, now: Instant) -> Vec<SessionAction> {
        match self.state.phase {
            SessionPhase::Disconnected => Vec::new(),
            _ => self.schedule_retry(now),
        }
    }

    pub fn on_tick(&mut self, now: Instant) -> Vec<SessionAction> {
        match self.state.phase {
            SessionPhase::Disconnected => match self.state.next_retry_at {
                Some(at) if !self.halted && now >= at => self.start(now),
                _ => Vec::new(),
            },
            SessionPhase::Connecting => Vec::new(),
            SessionPhase::Authenticating => {
                if now.duration_since(self.phase_since) < self.timing.auth_timeout {
                    return Vec::new();
                }
                warn!(
                    "No authentication answer within {:?}",
                    self.timing.auth_timeout
                );
                let mut actions = vec![SessionAction::CloseTransport];
                actions.extend(self.schedule_retry(now));
                actions
            }
            SessionPhase::Ready => {
                if now.duration_since(self.last_inbound) >= self.timing.heartbeat_timeout {
                    warn!(
                        "No traffic for {:?}, link degraded",
                        now.duration_since(self.last_inbound)
                    );
                    self.enter(SessionPhase::Degraded, now);
                }
                self.heartbeat(now)
            }
            SessionPhase::Degraded => {
                if now.duration_since(self.phase_since) >= self.timing.grace_period {
                    warn!("Grace period of {:?} expired", self.timing.grace_period);
                    let mut actions = vec![SessionAction::CloseTransport];
                    actions.extend(self.schedule_retry(now));
                    return actions;
                }
                self.heartbeat(now)
            }
        }
    }

    /// Decides whether a command may go out now
    pub fn admit(&mut self, command: OutboundCommand, now: Instant) -> Admission {
        let phase = self.state.phase;

        if command.intent.is_safety() {
            return match phase {
                SessionPhase::Ready | SessionPhase::Degraded => self.check_order(command),
                _ => {
                    debug!("Holding {} for replay", command.intent.name());
                    let held = Some((command.clone(), now));
                    match command.intent {
                        Intent::StopAll => self.held_stop = held,
                        _ => self.held_home = held,
                    }
                    Admission::Held
                }
            };
        }

        if phase != SessionPhase::Ready {
            return Admission::Dropped("session not ready");
        }
        if command.epoch != self.state.epoch {
            return Admission::Dropped("stale epoch");
        }
        self.check_order(command)
    }

    fn check_order(&mut self, command: OutboundCommand) -> Admission {
        if let Some(last) = self.last_sent_sequence {
            if command.sequence <= last {
                warn!(
                    "Command {} would go out after {}, dropping",
                    command.sequence, last
                );
                return Admission::Dropped("out of order");
            }
        }
        self.last_sent_sequence = Some(command.sequence);
        Admission::Send(command)
    }

    fn become_ready(&mut self, now: Instant) {
        self.state.epoch += 1;
        self.last_inbound = now;
        self.last_heartbeat = None;
        self.enter(SessionPhase::Ready, now);
    }

    fn heartbeat(&mut self, now: Instant) -> Vec<SessionAction> {
        match self.last_heartbeat {
            Some(at) if now.duration_since(at) < self.timing.heartbeat_interval => Vec::new(),
            _ => {
                self.last_heartbeat = Some(now);
                vec![SessionAction::SendHeartbeat]
            }
        }
    }

    fn schedule_retry(&mut self, now: Instant) -> Vec<SessionAction> {
        self.enter(SessionPhase::Disconnected, now);
        self.state.retry_count += 1;

        if self.state.retry_count > self.timing.max_retries {
            self.halted = true;
            self.state.next_retry_at = None;
            return vec![SessionAction::Fatal(FatalCondition::RetriesExhausted {
                attempts: self.state.retry_count,
            })];
        }

        let delay = self.backoff.next_delay();
        info!(
            "Reconnect attempt {} in {:?}",
            self.state.retry_count, delay
        );
        self.state.next_retry_at = Some(now + delay);
        Vec::new()
    }

    /// StopAll always; Home only if newer than any stop, fresh, and not in Alarm
    fn replay(&mut self, now: Instant, run_state: Option<RunState>) -> Vec<OutboundCommand> {
        let stop = self.held_stop.take();
        let home = self.held_home.take();
        let mut replay = Vec::new();

        let home = home.filter(|(_, held_at)| {
            let superseded = stop.as_ref().is_some_and(|(_, stop_at)| stop_at >= held_at);
            let fresh = now.duration_since(*held_at) <= self.timing.replay_max_age;
            let alarmed = run_state == Some(RunState::Alarm);
            if superseded || !fresh || alarmed {
                debug!(
                    "Not replaying home (superseded {}, fresh {}, alarm {})",
                    superseded, fresh, alarmed
                );
                false
            } else {
                true
            }
        });

        for (command, _) in stop.into_iter().chain(home) {
            info!("Replaying {}", command.intent.name());
            if let Admission::Send(command) = self.check_order(command) {
                replay.push(command);
            }
        }
        replay
    }
}
