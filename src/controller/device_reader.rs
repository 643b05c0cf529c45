use super::decode::{parse_js_event, DecodeTable, JS_EVENT_SIZE};
use super::LogicalEvent;
use crate::config::DeviceConfig;
use crate::fault::ErrorClass;
use async_trait::async_trait;
use statum::{machine, state};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEventType {
    Axis,
    Button,
}

/// Device-native event before calibration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDeviceEvent {
    pub event_type: RawEventType,
    pub number: u8,
    pub value: i32,
    pub initial: bool,
    pub time_ms: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Failed to open input device {device}: {reason}")]
    OpenFailed { device: String, reason: String },

    #[error("Input device disconnected: {0}")]
    DeviceDisconnected(String),
}

impl DeviceError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::FatalDevice
    }
}

/// Abstract `nextRawEvent()` collaborator
#[async_trait]
pub trait RawEventSource: Send {
    /// Human readable name for logs
    fn describe(&self) -> String;

    async fn open(&mut self) -> Result<(), DeviceError>;

    /// Waits for the next event; `DeviceDisconnected` once the device is gone
    async fn next_raw_event(&mut self) -> Result<RawDeviceEvent, DeviceError>;

    /// Releases the device handle; safe to call when already closed
    async fn close(&mut self);
}

/// Linux joystick API source (`/dev/input/jsN`)
pub struct JoydevSource {
    path: PathBuf,
    file: Option<tokio::fs::File>,
}

impl JoydevSource {
    pub fn new(path: PathBuf) -> Self {
        Self { path, file: None }
    }
}

#[async_trait]
impl RawEventSource for JoydevSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn open(&mut self) -> Result<(), DeviceError> {
        let file = tokio::fs::File::open(&self.path)
            .await
            .map_err(|e| DeviceError::OpenFailed {
                device: self.describe(),
                reason: e.to_string(),
            })?;
        self.file = Some(file);
        Ok(())
    }

    async fn next_raw_event(&mut self) -> Result<RawDeviceEvent, DeviceError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| DeviceError::DeviceDisconnected("device not open".to_string()))?;

        let mut buf = [0u8; JS_EVENT_SIZE];
        loop {
            if let Err(e) = file.read_exact(&mut buf).await {
                self.file = None;
                return Err(DeviceError::DeviceDisconnected(e.to_string()));
            }
            match parse_js_event(&buf) {
                Some(event) => return Ok(event),
                None => debug!("Skipping unknown joystick record type {:#04x}", buf[6]),
            }
        }
    }

    async fn close(&mut self) {
        if self.file.take().is_some() {
            debug!("Closed {}", self.path.display());
        }
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum ReaderState {
    Opening,
    Reading,
}

/// Device reader with compile-time open/read states
#[machine]
pub struct DeviceReader<S: ReaderState> {
    source: Box<dyn RawEventSource>,
    decode: DecodeTable,
    open_attempts: u32,
    retry_delay: Duration,
}

impl<S: ReaderState> DeviceReader<S> {
    pub fn describe(&self) -> String {
        self.source.describe()
    }
}

impl DeviceReader<Opening> {
    pub fn create(source: Box<dyn RawEventSource>, config: &DeviceConfig) -> Self {
        debug!("Creating device reader for {}", source.describe());
        Self::new(
            source,
            DecodeTable::new(config.clone()),
            config.open_attempts.max(1),
            config.open_retry_delay(),
        )
    }

    /// Opens the device, retrying a bounded number of times
    pub async fn open(mut self) -> Result<DeviceReader<Reading>, DeviceError> {
        let mut last_error = None;
        for attempt in 1..=self.open_attempts {
            match self.source.open().await {
                Ok(()) => {
                    info!("Input device {} opened", self.source.describe());
                    return Ok(self.transition());
                }
                Err(e) => {
                    warn!(
                        "Open attempt {}/{} failed: {}",
                        attempt, self.open_attempts, e
                    );
                    last_error = Some(e);
                    if attempt < self.open_attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        error!("Giving up on input device {}", self.source.describe());
        Err(last_error.unwrap_or_else(|| DeviceError::OpenFailed {
            device: self.source.describe(),
            reason: "no open attempts configured".to_string(),
        }))
    }
}

impl DeviceReader<Reading> {
    /// Waits for the next decoded event
    pub async fn read_next(&mut self) -> Result<LogicalEvent, DeviceError> {
        let raw = self.source.next_raw_event().await?;
        let event = self.decode.decode(&raw);
        debug!("Decoded {:?} -> {:?} {:.3}", raw, event.kind, event.value);
        Ok(event)
    }

    /// Drops the dead handle and goes back to opening
    pub async fn lost(mut self) -> DeviceReader<Opening> {
        self.source.close().await;
        self.transition()
    }

    pub async fn close(mut self) {
        self.source.close().await;
        info!("Input device {} released", self.source.describe());
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::controller::LogicalEventKind;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Scripted source; an exhausted script reads as a disconnect unless
    /// `hang_when_empty` is set
    pub(crate) struct ScriptedSource {
        pub events: VecDeque<RawDeviceEvent>,
        pub failing_opens: u32,
        /// Opens at or beyond this count fail
        pub max_opens: u32,
        pub hang_when_empty: bool,
        pub opens: Arc<AtomicU32>,
    }

    impl ScriptedSource {
        pub(crate) fn new(events: Vec<RawDeviceEvent>) -> Self {
            Self {
                events: events.into(),
                failing_opens: 0,
                max_opens: u32::MAX,
                hang_when_empty: false,
                opens: Arc::new(AtomicU32::new(0)),
            }
        }
    }

    #[async_trait]
    impl RawEventSource for ScriptedSource {
        fn describe(&self) -> String {
            "scripted".to_string()
        }

        async fn open(&mut self) -> Result<(), DeviceError> {
            let attempt = self.opens.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failing_opens || attempt >= self.max_opens {
                return Err(DeviceError::OpenFailed {
                    device: self.describe(),
                    reason: "busy".to_string(),
                });
            }
            Ok(())
        }

        async fn next_raw_event(&mut self) -> Result<RawDeviceEvent, DeviceError> {
            match self.events.pop_front() {
                Some(event) => Ok(event),
                None if self.hang_when_empty => std::future::pending().await,
                None => Err(DeviceError::DeviceDisconnected(
                    "script exhausted".to_string(),
                )),
            }
        }

        async fn close(&mut self) {}
    }

    fn quick_config(attempts: u32) -> DeviceConfig {
        DeviceConfig {
            open_attempts: attempts,
            open_retry_delay_ms: 1,
            ..DeviceConfig::default()
        }
    }

    #[tokio::test]
    async fn reads_and_decodes_until_disconnect() {
        let source = ScriptedSource::new(vec![RawDeviceEvent {
            event_type: RawEventType::Axis,
            number: 0,
            value: 32767,
            initial: false,
            time_ms: 10,
        }]);
        let mut reader = DeviceReader::create(Box::new(source), &quick_config(1))
            .open()
            .await
            .unwrap();

        let event = reader.read_next().await.unwrap();
        assert_eq!(event.kind, LogicalEventKind::AxisMoved);
        assert_eq!(event.value, 1.0);

        assert!(matches!(
            reader.read_next().await,
            Err(DeviceError::DeviceDisconnected(_))
        ));
    }

    #[tokio::test]
    async fn open_retries_then_succeeds() {
        let mut source = ScriptedSource::new(Vec::new());
        source.failing_opens = 2;
        let opens = source.opens.clone();

        let reader = DeviceReader::create(Box::new(source), &quick_config(3)).open().await;
        assert!(reader.is_ok());
        assert_eq!(opens.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn open_gives_up_after_configured_attempts() {
        let mut source = ScriptedSource::new(Vec::new());
        source.failing_opens = 10;
        let opens = source.opens.clone();

        let result = DeviceReader::create(Box::new(source), &quick_config(2)).open().await;
        assert!(matches!(result, Err(DeviceError::OpenFailed { .. })));
        assert_eq!(opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn joydev_missing_device_fails_to_open() {
        let mut source = JoydevSource::new(PathBuf::from("/nonexistent/js9"));
        assert!(matches!(
            source.open().await,
            Err(DeviceError::OpenFailed { .. })
        ));
        assert!(matches!(
            source.next_raw_event().await,
            Err(DeviceError::DeviceDisconnected(_))
        ));
    }
}
