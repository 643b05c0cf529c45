use crate::fault::ErrorClass;
use async_trait::async_trait;
use std::time::Duration;

/// Outbound event names
pub const EVENT_CREDENTIALS: &str = "credentials";
pub const EVENT_COMMAND: &str = "command";
pub const EVENT_HEARTBEAT: &str = "heartbeat";
pub const EVENT_OPEN: &str = "open";

/// Inbound event names
pub const EVENT_AUTH_ACK: &str = "authAck";
pub const EVENT_AUTH_REJECT: &str = "authReject";
pub const EVENT_STATUS: &str = "status";
pub const EVENT_COMMAND_ACK: &str = "commandAck";

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Connect timed out after {0:?}")]
    Timeout(Duration),

    #[error("Send of '{event}' failed: {reason}")]
    Send { event: String, reason: String },

    #[error("Transport closed: {0}")]
    Closed(String),

    #[error("Failed to encode '{event}': {source}")]
    Encode {
        event: String,
        #[source]
        source: serde_json::Error,
    },
}

impl TransportError {
    pub fn class(&self) -> ErrorClass {
        match self {
            TransportError::Encode { .. } => ErrorClass::LogicInvariant,
            _ => ErrorClass::TransientNetwork,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message {
        event: String,
        payload: serde_json::Value,
    },
    Closed {
        reason: String,
    },
}

/// Bidirectional named-event channel to the controller server
#[async_trait]
pub trait ControllerTransport: Send {
    /// Establishes the link; bounded by the transport's own timeout
    async fn connect(&mut self) -> Result<(), TransportError>;

    async fn send(&mut self, event: &str, payload: serde_json::Value)
        -> Result<(), TransportError>;

    /// Next inbound event; must be cancel-safe, it is raced against timers
    async fn next_event(&mut self) -> TransportEvent;

    /// Best-effort graceful close
    async fn close(&mut self);
}
