//! Session subsystem: the authenticated link to the controller server
//!
//! Split the same way as the controller side:
//!
//! - [`machine`] - pure connection state machine; every decision about phases,
//!   retries, heartbeats and what may be sent lives here and takes the
//!   current time as an argument
//! - [`backoff`] - reconnect delay schedule
//! - [`transport`] - the event channel collaborator (`connect`, `send`,
//!   inbound events, `close`)
//! - [`mqtt_transport`] - that collaborator over MQTT
//! - [`manager`] - the task that drives the machine from transport events,
//!   timers and the outbound command channel
//!
//! # Phases
//!
//! ```text
//! Disconnected ──► Connecting ──► Authenticating ──► Ready ◄──► Degraded
//!      ▲               │                │              │           │
//!      └── backoff ────┴─── timeout ────┘              └── close ──┘
//!                                       │ authReject
//!                                       ▼
//!                               fatal, no retry
//! ```

pub mod backoff;
pub mod machine;
pub mod manager;
pub mod mqtt_transport;
pub mod transport;

use crate::fault::ErrorClass;
use std::time::Instant;

pub use backoff::Backoff;
pub use machine::{Admission, SessionAction, SessionMachine};
pub use manager::SessionManager;
pub use mqtt_transport::MqttTransport;
pub use transport::{ControllerTransport, TransportError, TransportEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Degraded,
}

/// Session snapshot published to the dispatcher
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionState {
    pub phase: SessionPhase,
    pub retry_count: u32,
    pub next_retry_at: Option<Instant>,
    /// Incremented on every entry into `Ready`
    pub epoch: u64,
}

impl SessionState {
    pub fn is_ready(&self) -> bool {
        self.phase == SessionPhase::Ready
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Controller rejected credentials: {0}")]
    AuthRejected(String),

    #[error("No authentication answer within {0:?}")]
    AuthTimeout(std::time::Duration),

    #[error("Gave up after {attempts} connection attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("Dropped command {sequence}: {reason}")]
    CommandDropped { sequence: u64, reason: String },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl SessionError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SessionError::AuthRejected(_) => ErrorClass::FatalAuth,
            SessionError::AuthTimeout(_) | SessionError::RetriesExhausted { .. } => {
                ErrorClass::TransientNetwork
            }
            SessionError::CommandDropped { .. } => ErrorClass::LogicInvariant,
            SessionError::Transport(e) => e.class(),
        }
    }
}
