use super::{MachineStatus, RunState, WorkPosition};
use crate::fault::ErrorClass;
use chrono::Local;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("Malformed status payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Unknown run state '{0}'")]
    UnknownRunState(String),

    #[error("Status field {0} is not a finite number")]
    NonFinite(&'static str),
}

impl StatusError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::TransientProtocol
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusPayload {
    run_state: String,
    work_position: WorkPosition,
    feed_rate: f64,
}

/// Accepts the controller's sub-state suffixes (`Hold:0`, `Door:1`); jogging
/// and homing are reported as `Run`
fn parse_run_state(raw: &str) -> Result<RunState, StatusError> {
    let base = raw.split(':').next().unwrap_or_default().trim();
    match base.to_ascii_lowercase().as_str() {
        "idle" => Ok(RunState::Idle),
        "run" | "jog" | "home" => Ok(RunState::Run),
        "hold" => Ok(RunState::Hold),
        "alarm" => Ok(RunState::Alarm),
        "door" => Ok(RunState::Door),
        _ => Err(StatusError::UnknownRunState(raw.to_string())),
    }
}

/// Parses a full status snapshot; partial payloads are rejected
pub fn parse_status(payload: &serde_json::Value) -> Result<MachineStatus, StatusError> {
    let raw = StatusPayload::deserialize(payload)?;

    let position = raw.work_position;
    for (field, value) in [
        ("workPosition.x", position.x),
        ("workPosition.y", position.y),
        ("workPosition.z", position.z),
        ("feedRate", raw.feed_rate),
    ] {
        if !value.is_finite() {
            return Err(StatusError::NonFinite(field));
        }
    }

    Ok(MachineStatus {
        run_state: parse_run_state(&raw.run_state)?,
        work_position: position,
        feed_rate: raw.feed_rate,
        received_at: Local::now(),
        adverse_entries: 0,
    })
}

/// Owns the machine status snapshot and publishes replacements
#[derive(Debug)]
pub struct StatusReflector {
    tx: watch::Sender<Option<MachineStatus>>,
}

impl StatusReflector {
    pub fn new() -> (Self, watch::Receiver<Option<MachineStatus>>) {
        let (tx, rx) = watch::channel(None);
        (Self { tx }, rx)
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<MachineStatus>> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> Option<MachineStatus> {
        self.tx.borrow().clone()
    }

    /// Replaces the snapshot wholesale or leaves it untouched on error
    ///
    /// The adverse-entry count carries over and grows on every transition
    /// into Alarm or Door, so a reader that only sees a later snapshot can
    /// still tell one happened.
    pub fn apply(&self, payload: &serde_json::Value) -> Result<(), StatusError> {
        let mut status = parse_status(payload)?;
        debug!(
            "Machine status {} at ({:.3}, {:.3}, {:.3}) feed {:.1}",
            status.run_state,
            status.work_position.x,
            status.work_position.y,
            status.work_position.z,
            status.feed_rate
        );
        self.tx.send_modify(|current| {
            let (previous, entries) = current
                .as_ref()
                .map_or((None, 0), |s| (Some(s.run_state), s.adverse_entries));
            let entered = status.run_state.is_adverse() && previous != Some(status.run_state);
            status.adverse_entries = entries + u64::from(entered);
            *current = Some(status);
        });
        Ok(())
    }

    /// Applies an inbound update, logging rejected payloads
    pub fn handle(&self, payload: &serde_json::Value) {
        if let Err(e) = self.apply(payload) {
            warn!("Rejected status update ({:?}): {}", e.class(), e);
        }
    }
}
