use super::{DispatchError, Intent, IntentClass, OutboundCommand};
use crate::session::SessionState;
use tracing::debug;

#[derive(Debug, Clone)]
struct Pending {
    intent: Intent,
    epoch: u64,
}

/// One pending slot per coalesced class plus the sequence counter
///
/// Newer intents overwrite the slot; the flush tick sends whatever is left
/// when the session is `Ready` and the slot was filled in the current epoch.
/// Safety intents bypass the slots and clear any pending jog.
#[derive(Debug)]
pub struct Coalescer {
    pending_jog: Option<Pending>,
    pending_feed: Option<Pending>,
    last_jog: Option<Pending>,
    /// A nonzero jog went out and no release or stop followed yet
    motion_active: bool,
    next_sequence: u64,
}

impl Default for Coalescer {
    fn default() -> Self {
        Self::new()
    }
}

impl Coalescer {
    pub fn new() -> Self {
        Self {
            pending_jog: None,
            pending_feed: None,
            last_jog: None,
            motion_active: false,
            next_sequence: 1,
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending_jog.is_some() || self.pending_feed.is_some()
    }

    /// Takes an intent; immediate ones come back stamped and ready to send
    pub fn offer(&mut self, intent: Intent, session: &SessionState) -> Option<OutboundCommand> {
        let pending = Pending {
            intent,
            epoch: session.epoch,
        };

        match pending.intent.class() {
            IntentClass::Jog => {
                if self.pending_jog.replace(pending).is_some() {
                    debug!("Pending jog overwritten");
                }
                None
            }
            IntentClass::FeedOverride => {
                self.pending_feed = Some(pending);
                None
            }
            IntentClass::Immediate if pending.intent.is_safety() => {
                if self.pending_jog.take().is_some() {
                    debug!("{} cancels pending jog", pending.intent.name());
                }
                self.motion_active = false;
                self.last_jog = None;
                Some(self.stamp(pending))
            }
            IntentClass::Immediate => {
                if !session.is_ready() {
                    let e = DispatchError::NotReady {
                        intent: pending.intent.name(),
                        phase: session.phase,
                    };
                    debug!("{} ({:?})", e, e.class());
                    return None;
                }
                Some(self.stamp(pending))
            }
        }
    }

    /// Drains the slots; called on the flush tick
    pub fn flush(&mut self, session: &SessionState) -> Vec<OutboundCommand> {
        let mut out = Vec::new();

        if !session.is_ready() {
            let jog = self.pending_jog.take();
            let feed = self.pending_feed.take();
            if jog.is_some() || feed.is_some() {
                debug!("Session {:?}, pending intents dropped", session.phase);
            }
            if self.motion_active {
                // The release may never arrive; park a stop with the session
                self.motion_active = false;
                self.last_jog = None;
                out.push(self.stamp(Pending {
                    intent: Intent::StopAll,
                    epoch: session.epoch,
                }));
            }
            return out;
        }

        if let Some(feed) = self.pending_feed.take() {
            if feed.epoch == session.epoch {
                out.push(self.stamp(feed));
            } else {
                debug!("Feed override from epoch {} dropped", feed.epoch);
            }
        }

        if let Some(jog) = self.pending_jog.take() {
            if jog.epoch != session.epoch {
                debug!("Jog from epoch {} dropped", jog.epoch);
            } else if self
                .last_jog
                .as_ref()
                .is_some_and(|last| last.epoch == jog.epoch && last.intent == jog.intent)
            {
                debug!("Jog unchanged, not resent");
            } else {
                self.motion_active = matches!(
                    &jog.intent,
                    Intent::Jog { vector, .. } if !vector.is_zero()
                );
                self.last_jog = Some(jog.clone());
                out.push(self.stamp(jog));
            }
        }

        out
    }

    /// Final stop on shutdown
    pub fn final_stop(&mut self, session: &SessionState) -> OutboundCommand {
        self.pending_jog = None;
        self.pending_feed = None;
        self.motion_active = false;
        self.stamp(Pending {
            intent: Intent::StopAll,
            epoch: session.epoch,
        })
    }

    fn stamp(&mut self, pending: Pending) -> OutboundCommand {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        OutboundCommand {
            sequence,
            epoch: pending.epoch,
            intent: pending.intent,
        }
    }
}
