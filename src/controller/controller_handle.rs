//! Controller Handle - spawns the device and mapper tasks
//!
//! Two tasks, joined by a channel like the collector/processor pair they
//! replace:
//!
//! ```text
//! reader task ─[DeviceMessage]→ mapper task ─[Intent]→ dispatcher
//!                                   ▲
//!                       MachineStatus watch + poll tick
//! ```
//!
//! The reader task owns the device handle; it never blocks the mapper, and it
//! is the only place the device is opened, re-opened or released. On a
//! disconnect the mapper emits `StopAll` before anything else happens.

use super::device_reader::{
    DeviceError, DeviceReader, JoydevSource, Opening, RawEventSource, Reading,
};
use super::gilrs_source::GilrsSource;
use super::{ControlMapper, ControlState, LogicalEvent};
use crate::config::{ControlConfig, DeviceBackend, DeviceConfig};
use crate::dispatch::Intent;
use crate::fault::{FatalCondition, FaultReporter};
use crate::status::MachineStatus;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DEVICE_CHANNEL_CAPACITY: usize = 256;

/// Reader task to mapper task
#[derive(Debug)]
enum DeviceMessage {
    Event(LogicalEvent),
    /// Device dropped out; the reader is trying to re-open it
    Lost(String),
    Reopened,
    /// Open failed after every attempt
    Gone(String),
}

enum LoopEvent {
    Shutdown,
    Device(Option<DeviceMessage>),
    Status,
    StatusClosed,
    Tick,
}

/// Picks the raw event collaborator for the configured backend
pub fn source_for(config: &DeviceConfig) -> Box<dyn RawEventSource> {
    match config.backend {
        DeviceBackend::Joydev => Box::new(JoydevSource::new(config.path.clone())),
        DeviceBackend::Gilrs => Box::new(GilrsSource::new()),
    }
}

pub struct ControllerHandle {
    state: watch::Receiver<ControlState>,
    reader: JoinHandle<()>,
    mapper: JoinHandle<()>,
}

impl ControllerHandle {
    pub fn spawn(
        source: Box<dyn RawEventSource>,
        device: &DeviceConfig,
        control: ControlConfig,
        intents: mpsc::Sender<Intent>,
        status: watch::Receiver<Option<MachineStatus>>,
        faults: FaultReporter,
        cancel: CancellationToken,
    ) -> Self {
        info!("Starting controller on {}", source.describe());

        let (device_tx, device_rx) = mpsc::channel(DEVICE_CHANNEL_CAPACITY);
        let reader = DeviceReader::create(source, device);
        let reader = tokio::spawn(run_reader(reader, device_tx, cancel.clone()));

        let mapper = ControlMapper::new(control.clone());
        let (state_tx, state) = watch::channel(mapper.state().clone());
        let mapper = tokio::spawn(
            MapperLoop {
                mapper,
                poll_interval: control.poll_interval(),
                device_rx,
                status,
                intents,
                state_tx,
                faults,
            }
            .run(cancel),
        );

        Self {
            state,
            reader,
            mapper,
        }
    }

    /// Read-only view of the mapper's control state
    pub fn state(&self) -> watch::Receiver<ControlState> {
        self.state.clone()
    }

    /// Waits for both tasks after cancellation
    pub async fn join(self) {
        if let Err(e) = self.mapper.await {
            error!("Mapper task panicked: {}", e);
        }
        if let Err(e) = self.reader.await {
            error!("Reader task panicked: {}", e);
        }
    }
}

/// Opens the device, giving up early on cancellation
async fn open_device(
    reader: DeviceReader<Opening>,
    cancel: &CancellationToken,
) -> Option<Result<DeviceReader<Reading>, DeviceError>> {
    tokio::select! {
        _ = cancel.cancelled() => None,
        opened = reader.open() => Some(opened),
    }
}

async fn run_reader(
    reader: DeviceReader<Opening>,
    tx: mpsc::Sender<DeviceMessage>,
    cancel: CancellationToken,
) {
    let mut reader = match open_device(reader, &cancel).await {
        Some(Ok(reader)) => reader,
        Some(Err(e)) => {
            let _ = tx.send(DeviceMessage::Gone(e.to_string())).await;
            return;
        }
        None => return,
    };

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read_next() => read,
        };

        match read {
            Ok(event) => {
                if tx.send(DeviceMessage::Event(event)).await.is_err() {
                    debug!("Mapper gone, stopping reader");
                    break;
                }
            }
            Err(e) => {
                warn!("{} ({:?})", e, e.class());
                if tx.send(DeviceMessage::Lost(e.to_string())).await.is_err() {
                    break;
                }

                let opening = reader.lost().await;
                reader = match open_device(opening, &cancel).await {
                    Some(Ok(reader)) => {
                        let _ = tx.send(DeviceMessage::Reopened).await;
                        reader
                    }
                    Some(Err(e)) => {
                        let _ = tx.send(DeviceMessage::Gone(e.to_string())).await;
                        return;
                    }
                    None => return,
                };
            }
        }
    }

    reader.close().await;
}

struct MapperLoop {
    mapper: ControlMapper,
    poll_interval: std::time::Duration,
    device_rx: mpsc::Receiver<DeviceMessage>,
    status: watch::Receiver<Option<MachineStatus>>,
    intents: mpsc::Sender<Intent>,
    state_tx: watch::Sender<ControlState>,
    faults: FaultReporter,
}

impl MapperLoop {
    async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut status_open = true;

        // A status may already be waiting
        self.apply_status().await;

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => LoopEvent::Shutdown,
                message = self.device_rx.recv() => LoopEvent::Device(message),
                changed = self.status.changed(), if status_open => match changed {
                    Ok(()) => LoopEvent::Status,
                    Err(_) => LoopEvent::StatusClosed,
                },
                _ = ticker.tick() => LoopEvent::Tick,
            };

            let keep_running = match event {
                LoopEvent::Shutdown => {
                    info!("Controller shutting down");
                    false
                }
                LoopEvent::Device(Some(DeviceMessage::Event(event))) => {
                    self.mapper.handle_event(&event);
                    true
                }
                LoopEvent::Device(Some(DeviceMessage::Lost(reason))) => {
                    warn!("Input device lost ({}), stopping all motion", reason);
                    self.mapper.reset();
                    self.publish_state();
                    self.deliver(Intent::StopAll).await
                }
                LoopEvent::Device(Some(DeviceMessage::Reopened)) => {
                    info!("Input device back");
                    true
                }
                LoopEvent::Device(Some(DeviceMessage::Gone(reason))) => {
                    self.faults.raise(FatalCondition::DeviceGone(reason));
                    false
                }
                LoopEvent::Device(None) => {
                    debug!("Reader task ended");
                    false
                }
                LoopEvent::Status => self.apply_status().await,
                LoopEvent::StatusClosed => {
                    warn!("Status feed closed; keeping last known state");
                    status_open = false;
                    true
                }
                LoopEvent::Tick => {
                    let now = tokio::time::Instant::now().into_std();
                    let intent = self.mapper.poll(now);
                    self.publish_state();
                    match intent {
                        Some(intent) => self.deliver(intent).await,
                        None => true,
                    }
                }
            };

            if !keep_running {
                break;
            }
        }
    }

    async fn apply_status(&mut self) -> bool {
        let snapshot = self.status.borrow_and_update().clone();
        let intent = self.mapper.on_status(snapshot.as_ref());
        self.publish_state();
        match intent {
            Some(intent) => self.deliver(intent).await,
            None => true,
        }
    }

    fn publish_state(&self) {
        let state = self.mapper.state();
        self.state_tx.send_if_modified(|current| {
            if current != state {
                *current = state.clone();
                true
            } else {
                false
            }
        });
    }

    /// Safety intents and jog releases wait for room; everything else is
    /// dropped when full and offered again on a later cycle
    async fn deliver(&self, intent: Intent) -> bool {
        debug!("Intent {:?}", intent);
        if intent.is_safety() || intent.is_jog_release() {
            return match self.intents.send(intent).await {
                Ok(()) => true,
                Err(e) => {
                    error!("Intent channel closed, dropping {}", e.0.name());
                    false
                }
            };
        }

        match self.intents.try_send(intent) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(intent)) => {
                warn!("Intent channel full, dropping {}", intent.name());
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                error!("Intent channel closed");
                false
            }
        }
    }
}
