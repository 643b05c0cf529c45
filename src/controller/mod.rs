//! Controller subsystem: joystick input to machine intents
//!
//! Implements the input half of the pendant pipeline:
//!
//! 1. [`device_reader`] - Raw device events decoded into [`LogicalEvent`]s
//! 2. [`control_mapper`] - Stateful translation of events into [`Intent`]s
//! 3. [`controller_handle`] - Poll loop wiring and lifecycle management
//!
//! # Architecture
//!
//! ```text
//! Device ──► DeviceReader ──► ControlMapper ──► Intent channel
//!            (LogicalEvent)    ▲ (poll tick)
//!                              │
//!                       MachineStatus snapshot
//! ```
//!
//! [`Intent`]: crate::dispatch::Intent

pub mod control_mapper;
pub mod controller_handle;
pub mod decode;
pub mod device_reader;
pub mod gilrs_source;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use control_mapper::{ControlMapper, ControlMode, ControlState};
pub use controller_handle::ControllerHandle;
pub use device_reader::{DeviceError, DeviceReader, RawDeviceEvent, RawEventSource};

/// Device-native axis number
pub type AxisCode = u8;

/// Device-native button number
pub type ButtonCode = u8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalEventKind {
    AxisMoved,
    ButtonPressed,
    ButtonReleased,
}

/// Decoded device event; produced by the reader, consumed once by the mapper
#[derive(Debug, Clone, PartialEq)]
pub struct LogicalEvent {
    pub kind: LogicalEventKind,
    pub code: u8,
    /// Normalized to [-1, 1] for axes; 1.0 / 0.0 for buttons
    pub value: f64,
    /// Initial-state report sent by the device on open, not an operator action
    pub initial: bool,
    pub timestamp: DateTime<Local>,
}

impl LogicalEvent {
    pub fn axis(code: AxisCode, value: f64) -> Self {
        Self {
            kind: LogicalEventKind::AxisMoved,
            code,
            value,
            initial: false,
            timestamp: Local::now(),
        }
    }

    pub fn button(code: ButtonCode, pressed: bool) -> Self {
        Self {
            kind: if pressed {
                LogicalEventKind::ButtonPressed
            } else {
                LogicalEventKind::ButtonReleased
            },
            code,
            value: if pressed { 1.0 } else { 0.0 },
            initial: false,
            timestamp: Local::now(),
        }
    }
}

/// Machine motion axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MachineAxis {
    X,
    Y,
    Z,
}

impl MachineAxis {
    pub const ALL: [MachineAxis; 3] = [MachineAxis::X, MachineAxis::Y, MachineAxis::Z];

    fn index(self) -> usize {
        match self {
            MachineAxis::X => 0,
            MachineAxis::Y => 1,
            MachineAxis::Z => 2,
        }
    }
}

impl fmt::Display for MachineAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachineAxis::X => write!(f, "X"),
            MachineAxis::Y => write!(f, "Y"),
            MachineAxis::Z => write!(f, "Z"),
        }
    }
}

/// Set of machine axes, stored as a bit mask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AxisSet(u8);

impl AxisSet {
    pub fn all() -> Self {
        MachineAxis::ALL.into_iter().collect()
    }

    pub fn contains(&self, axis: MachineAxis) -> bool {
        self.0 & (1 << axis.index()) != 0
    }

    pub fn insert(&mut self, axis: MachineAxis) {
        self.0 |= 1 << axis.index();
    }

    pub fn remove(&mut self, axis: MachineAxis) {
        self.0 &= !(1 << axis.index());
    }

    /// Flips membership and reports whether the axis is now active
    pub fn toggle(&mut self, axis: MachineAxis) -> bool {
        self.0 ^= 1 << axis.index();
        self.contains(axis)
    }

    pub fn iter(&self) -> impl Iterator<Item = MachineAxis> + '_ {
        MachineAxis::ALL
            .into_iter()
            .filter(move |axis| self.contains(*axis))
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl FromIterator<MachineAxis> for AxisSet {
    fn from_iter<I: IntoIterator<Item = MachineAxis>>(iter: I) -> Self {
        let mut set = AxisSet::default();
        for axis in iter {
            set.insert(axis);
        }
        set
    }
}

impl Serialize for AxisSet {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

/// Per-axis signed jog fraction
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct JogVector {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl JogVector {
    pub fn get(&self, axis: MachineAxis) -> f64 {
        match axis {
            MachineAxis::X => self.x,
            MachineAxis::Y => self.y,
            MachineAxis::Z => self.z,
        }
    }

    pub fn set(&mut self, axis: MachineAxis, value: f64) {
        match axis {
            MachineAxis::X => self.x = value,
            MachineAxis::Y => self.y = value,
            MachineAxis::Z => self.z = value,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.x == 0.0 && self.y == 0.0 && self.z == 0.0
    }

    /// Largest component magnitude
    pub fn peak(&self) -> f64 {
        self.x.abs().max(self.y.abs()).max(self.z.abs())
    }
}
