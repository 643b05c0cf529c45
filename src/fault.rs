//! Error classes and the single fatal-condition signal
//!
//! Subsystems report transient trouble through logs and keep running. The few
//! conditions the pendant cannot recover from on its own are raised once on a
//! [`FaultReporter`]; the host process waits on [`FaultSignal`] and turns the
//! first fatal condition into a non-zero exit.

use std::fmt;
use tokio::sync::watch;
use tracing::error;

/// Severity classes shared by all subsystem errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Connect/send failure; retried with backoff
    TransientNetwork,
    /// Malformed inbound payload; logged, previous state kept
    TransientProtocol,
    /// Credentials rejected; never retried
    FatalAuth,
    /// Input device gone; safety stop first, then surfaced
    FatalDevice,
    /// Internal contract broken; the offending command is dropped
    LogicInvariant,
}

impl ErrorClass {
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorClass::FatalAuth | ErrorClass::FatalDevice)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatalCondition {
    AuthRejected(String),
    DeviceGone(String),
    RetriesExhausted { attempts: u32 },
}

impl fmt::Display for FatalCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalCondition::AuthRejected(reason) => {
                write!(f, "controller rejected credentials: {}", reason)
            }
            FatalCondition::DeviceGone(reason) => write!(f, "input device lost: {}", reason),
            FatalCondition::RetriesExhausted { attempts } => write!(
                f,
                "cannot reach controller after {} connection attempts",
                attempts
            ),
        }
    }
}

/// Raising side; cheap to clone into every subsystem
#[derive(Debug, Clone)]
pub struct FaultReporter {
    tx: watch::Sender<Option<FatalCondition>>,
}

/// Host side
#[derive(Debug, Clone)]
pub struct FaultSignal {
    rx: watch::Receiver<Option<FatalCondition>>,
}

pub fn fault_channel() -> (FaultReporter, FaultSignal) {
    let (tx, rx) = watch::channel(None);
    (FaultReporter { tx }, FaultSignal { rx })
}

impl FaultReporter {
    /// Records the condition; only the first one raised is kept
    pub fn raise(&self, condition: FatalCondition) {
        error!("Fatal condition: {}", condition);
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(condition);
                true
            } else {
                false
            }
        });
    }
}

impl FaultSignal {
    pub fn current(&self) -> Option<FatalCondition> {
        self.rx.borrow().clone()
    }

    /// Resolves with the first fatal condition
    pub async fn wait(&mut self) -> FatalCondition {
        loop {
            if let Some(condition) = self.rx.borrow_and_update().clone() {
                return condition;
            }
            if self.rx.changed().await.is_err() {
                // Every reporter is gone without raising anything
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_condition_wins() {
        let (reporter, mut signal) = fault_channel();
        assert!(signal.current().is_none());

        reporter.raise(FatalCondition::AuthRejected("bad token".to_string()));
        reporter.raise(FatalCondition::RetriesExhausted { attempts: 3 });

        assert_eq!(
            signal.wait().await,
            FatalCondition::AuthRejected("bad token".to_string())
        );
    }

    #[test]
    fn classes_split_fatal_from_transient() {
        assert!(ErrorClass::FatalAuth.is_fatal());
        assert!(ErrorClass::FatalDevice.is_fatal());
        assert!(!ErrorClass::TransientNetwork.is_fatal());
        assert!(!ErrorClass::TransientProtocol.is_fatal());
        assert!(!ErrorClass::LogicInvariant.is_fatal());
    }
}
