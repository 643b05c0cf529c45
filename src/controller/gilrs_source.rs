//! gilrs-backed device source
//!
//! gilrs owns platform handles that are not guaranteed to be `Send`, so the
//! context lives on a dedicated collector thread and events cross over a
//! channel. Axes and buttons are renumbered to the joydev PlayStation layout
//! so one binding table serves both backends.

use super::device_reader::{DeviceError, RawDeviceEvent, RawEventSource, RawEventType};
use async_trait::async_trait;
use gilrs::{Axis, Button, Event, EventType, GamepadId, Gilrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

const FULL_SCALE: f32 = 32767.0;
const POLL_SLEEP: Duration = Duration::from_micros(500);

enum SourceMessage {
    Event(RawDeviceEvent),
    Disconnected(String),
}

pub struct GilrsSource {
    events: Option<mpsc::UnboundedReceiver<SourceMessage>>,
    stop: Arc<AtomicBool>,
}

impl GilrsSource {
    pub fn new() -> Self {
        Self {
            events: None,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Default for GilrsSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RawEventSource for GilrsSource {
    fn describe(&self) -> String {
        "gilrs gamepad".to_string()
    }

    async fn open(&mut self) -> Result<(), DeviceError> {
        self.close().await;

        let stop = Arc::new(AtomicBool::new(false));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let thread_stop = stop.clone();

        std::thread::Builder::new()
            .name("gilrs-collector".to_string())
            .spawn(move || run_collector(event_tx, ready_tx, thread_stop))
            .map_err(|e| DeviceError::OpenFailed {
                device: "gilrs".to_string(),
                reason: e.to_string(),
            })?;

        match ready_rx.await {
            Ok(Ok(name)) => {
                info!("Collecting from gamepad {}", name);
                self.events = Some(event_rx);
                self.stop = stop;
                Ok(())
            }
            Ok(Err(reason)) => Err(DeviceError::OpenFailed {
                device: "gilrs".to_string(),
                reason,
            }),
            Err(_) => Err(DeviceError::OpenFailed {
                device: "gilrs".to_string(),
                reason: "collector thread exited during startup".to_string(),
            }),
        }
    }

    async fn next_raw_event(&mut self) -> Result<RawDeviceEvent, DeviceError> {
        let events = self
            .events
            .as_mut()
            .ok_or_else(|| DeviceError::DeviceDisconnected("gamepad not open".to_string()))?;

        match events.recv().await {
            Some(SourceMessage::Event(event)) => Ok(event),
            Some(SourceMessage::Disconnected(reason)) => {
                self.events = None;
                Err(DeviceError::DeviceDisconnected(reason))
            }
            None => {
                self.events = None;
                Err(DeviceError::DeviceDisconnected(
                    "collector thread stopped".to_string(),
                ))
            }
        }
    }

    async fn close(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.events = None;
    }
}

fn run_collector(
    events: mpsc::UnboundedSender<SourceMessage>,
    ready: oneshot::Sender<Result<String, String>>,
    stop: Arc<AtomicBool>,
) {
    let mut gilrs = match Gilrs::new() {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to initialize gilrs: {}", e);
            let _ = ready.send(Err(e.to_string()));
            return;
        }
    };

    let selected: Option<(GamepadId, String)> = gilrs
        .gamepads()
        .next()
        .map(|(id, gamepad)| (id, gamepad.name().to_string()));
    let Some((active, name)) = selected else {
        let _ = ready.send(Err("no gamepad connected".to_string()));
        return;
    };
    if ready.send(Ok(name)).is_err() {
        return;
    }

    let started = Instant::now();
    while !stop.load(Ordering::SeqCst) {
        while let Some(Event { id, event, .. }) = gilrs.next_event() {
            if id != active {
                debug!("Skipping event from non-active gamepad: {:?}", id);
                continue;
            }
            let time_ms = started.elapsed().as_millis() as u32;
            let message = match event {
                EventType::Disconnected => {
                    warn!("Gamepad disconnected");
                    let _ = events.send(SourceMessage::Disconnected(
                        "gamepad disconnected".to_string(),
                    ));
                    return;
                }
                other => match convert_event(other, time_ms) {
                    Some(raw) => SourceMessage::Event(raw),
                    None => continue,
                },
            };
            if events.send(message).is_err() {
                debug!("Event receiver dropped, stopping collector");
                return;
            }
        }
        std::thread::sleep(POLL_SLEEP);
    }
    debug!("Gilrs collector stopped");
}

fn convert_event(event: EventType, time_ms: u32) -> Option<RawDeviceEvent> {
    match event {
        EventType::AxisChanged(axis, value, _) => {
            let (number, value) = map_axis(axis, value)?;
            Some(RawDeviceEvent {
                event_type: RawEventType::Axis,
                number,
                value,
                initial: false,
                time_ms,
            })
        }
        EventType::ButtonPressed(button, _) | EventType::ButtonReleased(button, _) => {
            let pressed = matches!(event, EventType::ButtonPressed(..));
            Some(RawDeviceEvent {
                event_type: RawEventType::Button,
                number: map_button(button)?,
                value: i32::from(pressed),
                initial: false,
                time_ms,
            })
        }
        _ => None,
    }
}

/// gilrs reports stick Y up-positive; joydev reports it down-positive
fn map_axis(axis: Axis, value: f32) -> Option<(u8, i32)> {
    let scaled = |v: f32| (v.clamp(-1.0, 1.0) * FULL_SCALE).round() as i32;
    match axis {
        Axis::LeftStickX => Some((0, scaled(value))),
        Axis::LeftStickY => Some((1, scaled(-value))),
        Axis::LeftZ => Some((2, scaled(value))),
        Axis::RightStickX => Some((3, scaled(value))),
        Axis::RightStickY => Some((4, scaled(-value))),
        Axis::RightZ => Some((5, scaled(value))),
        _ => None,
    }
}

fn map_button(button: Button) -> Option<u8> {
    match button {
        Button::South => Some(0),
        Button::East => Some(1),
        Button::North => Some(2),
        Button::West => Some(3),
        Button::LeftTrigger => Some(4),
        Button::RightTrigger => Some(5),
        Button::LeftTrigger2 => Some(6),
        Button::RightTrigger2 => Some(7),
        Button::Select => Some(8),
        Button::Start => Some(9),
        Button::Mode => Some(10),
        Button::LeftThumb => Some(11),
        Button::RightThumb => Some(12),
        Button::DPadUp => Some(13),
        Button::DPadDown => Some(14),
        Button::DPadLeft => Some(15),
        Button::DPadRight => Some(16),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stick_y_is_flipped_to_joydev_orientation() {
        assert_eq!(map_axis(Axis::LeftStickY, 1.0), Some((1, -32767)));
        assert_eq!(map_axis(Axis::LeftStickX, 1.0), Some((0, 32767)));
        assert_eq!(map_axis(Axis::RightStickY, -0.5), Some((4, 16384)));
        assert_eq!(map_axis(Axis::DPadX, 1.0), None);
    }

    #[test]
    fn buttons_follow_playstation_numbering() {
        assert_eq!(map_button(Button::South), Some(0));
        assert_eq!(map_button(Button::North), Some(2));
        assert_eq!(map_button(Button::DPadRight), Some(16));
        assert_eq!(map_button(Button::C), None);
    }
}
