//! Dispatcher task: intent channel to command channel through the coalescer
//!
//! The coalescer is owned by the task, so the flush tick only ever touches
//! the pending slots; delivery to the session happens after the slots are
//! drained and never while they are borrowed.

use super::{Coalescer, DispatchError, Intent, OutboundCommand};
use crate::config::DispatchConfig;
use crate::session::SessionState;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

enum LoopEvent {
    Shutdown,
    Intent(Intent),
    Flush,
}

#[derive(Debug)]
pub struct DispatcherHandle {
    task_handle: Option<JoinHandle<()>>,
}

impl DispatcherHandle {
    pub fn spawn(
        config: &DispatchConfig,
        intents: mpsc::Receiver<Intent>,
        commands: mpsc::Sender<OutboundCommand>,
        session: watch::Receiver<SessionState>,
        cancel: CancellationToken,
    ) -> Self {
        let dispatcher = Dispatcher {
            coalescer: Coalescer::new(),
            flush_interval: config.flush_interval(),
            intents,
            commands,
            session,
        };
        let task_handle = tokio::spawn(dispatcher.run(cancel));
        info!("Dispatcher started, flushing every {:?}", config.flush_interval());
        Self {
            task_handle: Some(task_handle),
        }
    }

    /// Waits for the task; the final stop has been handed over once this returns
    pub async fn join(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            if let Err(e) = handle.await {
                error!("Dispatcher task panicked: {}", e);
            }
        }
    }
}

struct Dispatcher {
    coalescer: Coalescer,
    flush_interval: Duration,
    intents: mpsc::Receiver<Intent>,
    commands: mpsc::Sender<OutboundCommand>,
    session: watch::Receiver<SessionState>,
}

impl Dispatcher {
    async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => LoopEvent::Shutdown,
                intent = self.intents.recv() => match intent {
                    Some(intent) => LoopEvent::Intent(intent),
                    None => LoopEvent::Shutdown,
                },
                _ = ticker.tick() => LoopEvent::Flush,
            };

            let delivered = match event {
                LoopEvent::Shutdown => break,
                LoopEvent::Intent(intent) => {
                    let session = self.session.borrow().clone();
                    match self.coalescer.offer(intent, &session) {
                        Some(command) => self.deliver(command).await,
                        None => Ok(()),
                    }
                }
                LoopEvent::Flush => {
                    let session = self.session.borrow().clone();
                    let flushed = self.coalescer.flush(&session);
                    let mut result = Ok(());
                    for command in flushed {
                        result = self.deliver(command).await;
                        if result.is_err() {
                            break;
                        }
                    }
                    result
                }
            };

            if let Err(e) = delivered {
                error!("{}", e);
                return;
            }
        }

        info!("Dispatcher stopping, sending final stop");
        let session = self.session.borrow().clone();
        let stop = self.coalescer.final_stop(&session);
        if let Err(e) = self.deliver(stop).await {
            warn!("Final stop not delivered: {}", e);
        }
    }

    /// Safety commands and jog releases wait for room; the rest is dropped when full
    async fn deliver(&self, command: OutboundCommand) -> Result<(), DispatchError> {
        debug!(
            "Dispatching #{} {} (epoch {})",
            command.sequence,
            command.intent.name(),
            command.epoch
        );

        if command.intent.is_safety() || command.intent.is_jog_release() {
            return self
                .commands
                .send(command)
                .await
                .map_err(|e| DispatchError::ChannelClosed(e.to_string()));
        }

        match self.commands.try_send(command) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(command)) => {
                warn!(
                    "Command channel full, dropping #{} {}",
                    command.sequence,
                    command.intent.name()
                );
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DispatchError::ChannelClosed(
                "session stopped".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::JogVector;
    use crate::session::SessionPhase;

    fn jog(x: f64) -> Intent {
        Intent::Jog {
            vector: JogVector { x, y: 0.0, z: 0.0 },
            feed_rate: 100.0,
        }
    }

    fn ready() -> SessionState {
        SessionState {
            phase: SessionPhase::Ready,
            epoch: 1,
            ..SessionState::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn coalesces_between_ticks_and_stops_on_shutdown() {
        let (intent_tx, intent_rx) = mpsc::channel(16);
        let (command_tx, mut command_rx) = mpsc::channel(16);
        let (_session_tx, session_rx) = watch::channel(ready());
        let cancel = CancellationToken::new();

        let mut handle = DispatcherHandle::spawn(
            &DispatchConfig::default(),
            intent_rx,
            command_tx,
            session_rx,
            cancel.clone(),
        );

        // Let the immediate first tick pass
        tokio::time::sleep(Duration::from_millis(10)).await;
        for i in 1..=5 {
            intent_tx.send(jog(f64::from(i) / 10.0)).await.unwrap();
        }
        intent_tx.send(Intent::Home).await.unwrap();

        let home = command_rx.recv().await.unwrap();
        assert_eq!(home.intent, Intent::Home);

        // Home cleared the pending jog
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(command_rx.try_recv().is_err());

        intent_tx.send(jog(0.2)).await.unwrap();
        intent_tx.send(jog(0.9)).await.unwrap();
        let flushed = command_rx.recv().await.unwrap();
        assert_eq!(flushed.intent, jog(0.9));
        assert!(flushed.sequence > home.sequence);

        cancel.cancel();
        handle.join().await;
        let last = command_rx.recv().await.unwrap();
        assert_eq!(last.intent, Intent::StopAll);
        assert!(command_rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_flushed_while_disconnected() {
        let (intent_tx, intent_rx) = mpsc::channel(16);
        let (command_tx, mut command_rx) = mpsc::channel(16);
        let (_session_tx, session_rx) = watch::channel(SessionState::default());
        let cancel = CancellationToken::new();

        let mut handle = DispatcherHandle::spawn(
            &DispatchConfig::default(),
            intent_rx,
            command_tx,
            session_rx,
            cancel.clone(),
        );

        intent_tx.send(jog(0.5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(command_rx.try_recv().is_err());

        drop(intent_tx);
        handle.join().await;
        assert_eq!(command_rx.recv().await.unwrap().intent, Intent::StopAll);
    }
}
