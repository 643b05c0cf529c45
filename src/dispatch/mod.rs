//! Dispatch subsystem: intents in, sequenced outbound commands out
//!
//! The control mapper produces [`Intent`]s at poll rate. The [`Coalescer`]
//! keeps one pending slot per coalesced class (jog, feed override) and lets
//! everything else through immediately; the dispatcher task flushes the slots
//! on a fixed tick while the session is `Ready`.
//!
//! ```text
//! Intent channel ──► Coalescer ──(flush tick / immediate)──► OutboundCommand channel
//!                        ▲
//!                 SessionState snapshot
//! ```

pub mod coalescer;
pub mod dispatcher;

use crate::config::MachineCommand;
use crate::controller::{AxisSet, JogVector, MachineAxis};
use crate::fault::ErrorClass;
use crate::session::SessionPhase;
use serde::Serialize;

pub use coalescer::Coalescer;
pub use dispatcher::DispatcherHandle;

/// A point-in-time decision to act
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum Intent {
    /// Continuous jog; a zero vector releases the jog
    Jog {
        vector: JogVector,
        #[serde(rename = "feedRate")]
        feed_rate: f64,
    },
    /// One fixed-distance move
    Step { axis: MachineAxis, distance: f64 },
    StopAll,
    SetFeedOverride { percent: u16 },
    Home,
    SelectAxis { axes: AxisSet },
    Command { command: MachineCommand },
}

/// How the coalescer treats an intent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentClass {
    Jog,
    FeedOverride,
    Immediate,
}

impl Intent {
    pub fn class(&self) -> IntentClass {
        match self {
            Intent::Jog { .. } => IntentClass::Jog,
            Intent::SetFeedOverride { .. } => IntentClass::FeedOverride,
            _ => IntentClass::Immediate,
        }
    }

    /// Idempotent safety commands; the only ones ever replayed after reconnect
    pub fn is_safety(&self) -> bool {
        matches!(self, Intent::StopAll | Intent::Home)
    }

    /// A zero jog; losing it would leave the machine moving
    pub fn is_jog_release(&self) -> bool {
        matches!(self, Intent::Jog { vector, .. } if vector.is_zero())
    }

    pub fn name(&self) -> &'static str {
        match self {
            Intent::Jog { .. } => "jog",
            Intent::Step { .. } => "step",
            Intent::StopAll => "stopAll",
            Intent::SetFeedOverride { .. } => "setFeedOverride",
            Intent::Home => "home",
            Intent::SelectAxis { .. } => "selectAxis",
            Intent::Command { .. } => "command",
        }
    }
}

/// Wire-ready command: `{type, payload, sequence}`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundCommand {
    pub sequence: u64,
    /// Session epoch the command was produced in; not sent
    #[serde(skip)]
    pub epoch: u64,
    #[serde(flatten)]
    pub intent: Intent,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Command channel closed: {0}")]
    ChannelClosed(String),

    #[error("Refusing to send {intent} while session is {phase:?}")]
    NotReady {
        intent: &'static str,
        phase: SessionPhase,
    },
}

impl DispatchError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::LogicInvariant
    }
}
