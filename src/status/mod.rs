//! Status subsystem: the last known machine state
//!
//! Inbound `status` events from the controller server are parsed into a full
//! [`MachineStatus`] snapshot and published on a `watch` channel. Readers only
//! ever see a complete snapshot; a malformed update leaves the previous one in
//! place.

pub mod reflector;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use reflector::{StatusError, StatusReflector};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Idle,
    Run,
    Hold,
    Alarm,
    Door,
}

impl RunState {
    /// Manual motion may start from these states
    pub fn permits_jog(self) -> bool {
        matches!(self, RunState::Idle | RunState::Hold)
    }

    /// States that force the pendant back to neutral
    pub fn is_adverse(self) -> bool {
        matches!(self, RunState::Alarm | RunState::Door)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "Idle",
            RunState::Run => "Run",
            RunState::Hold => "Hold",
            RunState::Alarm => "Alarm",
            RunState::Door => "Door",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorkPosition {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MachineStatus {
    pub run_state: RunState,
    pub work_position: WorkPosition,
    pub feed_rate: f64,
    pub received_at: DateTime<Local>,
    /// Running count of transitions into Alarm or Door, kept by the reflector
    pub adverse_entries: u64,
}

impl MachineStatus {
    pub fn new(run_state: RunState, work_position: WorkPosition, feed_rate: f64) -> Self {
        Self {
            run_state,
            work_position,
            feed_rate,
            received_at: Local::now(),
            adverse_entries: 0,
        }
    }
}
