//! Raw device record decoding
//!
//! Covers the Linux joystick API record layout and the calibration step that
//! turns device-native axis values into normalized fractions.

use super::device_reader::{RawDeviceEvent, RawEventType};
use super::{LogicalEvent, LogicalEventKind};
use crate::config::{AxisCalibration, DeviceConfig};
use chrono::Local;

/// Size of one `js_event` record
pub const JS_EVENT_SIZE: usize = 8;

const JS_EVENT_BUTTON: u8 = 0x01;
const JS_EVENT_AXIS: u8 = 0x02;
const JS_EVENT_INIT: u8 = 0x80;

/// Parses a `js_event`: u32 time (ms), i16 value, u8 type, u8 number
pub fn parse_js_event(buf: &[u8; JS_EVENT_SIZE]) -> Option<RawDeviceEvent> {
    let time_ms = u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let value = i16::from_ne_bytes([buf[4], buf[5]]);
    let kind = buf[6];
    let number = buf[7];

    let initial = kind & JS_EVENT_INIT != 0;
    let event_type = match kind & !JS_EVENT_INIT {
        JS_EVENT_BUTTON => RawEventType::Button,
        JS_EVENT_AXIS => RawEventType::Axis,
        _ => return None,
    };

    Some(RawDeviceEvent {
        event_type,
        number,
        value: i32::from(value),
        initial,
        time_ms,
    })
}

/// Maps a raw value inside `calibration` onto [-1, 1], clamping outside values
pub fn normalize_axis(raw: i32, calibration: AxisCalibration) -> f64 {
    let min = f64::from(calibration.min);
    let max = f64::from(calibration.max);
    let clamped = f64::from(raw).clamp(min, max);
    (2.0 * (clamped - min) / (max - min) - 1.0).clamp(-1.0, 1.0)
}

/// Calibration lookup for every axis the device reports
#[derive(Debug, Clone)]
pub struct DecodeTable {
    device: DeviceConfig,
}

impl DecodeTable {
    pub fn new(device: DeviceConfig) -> Self {
        Self { device }
    }

    pub fn decode(&self, raw: &RawDeviceEvent) -> LogicalEvent {
        let (kind, value) = match raw.event_type {
            RawEventType::Axis => (
                LogicalEventKind::AxisMoved,
                normalize_axis(raw.value, self.device.calibration_for(raw.number)),
            ),
            RawEventType::Button if raw.value != 0 => (LogicalEventKind::ButtonPressed, 1.0),
            RawEventType::Button => (LogicalEventKind::ButtonReleased, 0.0),
        };

        LogicalEvent {
            kind,
            code: raw.number,
            value,
            initial: raw.initial,
            timestamp: Local::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CalibrationEntry;

    fn record(time: u32, value: i16, kind: u8, number: u8) -> [u8; JS_EVENT_SIZE] {
        let mut buf = [0u8; JS_EVENT_SIZE];
        buf[0..4].copy_from_slice(&time.to_ne_bytes());
        buf[4..6].copy_from_slice(&value.to_ne_bytes());
        buf[6] = kind;
        buf[7] = number;
        buf
    }

    #[test]
    fn parses_axis_and_button_records() {
        let axis = parse_js_event(&record(1200, -16000, 0x02, 3)).unwrap();
        assert_eq!(axis.event_type, RawEventType::Axis);
        assert_eq!(axis.number, 3);
        assert_eq!(axis.value, -16000);
        assert_eq!(axis.time_ms, 1200);
        assert!(!axis.initial);

        let button = parse_js_event(&record(5, 1, 0x81, 9)).unwrap();
        assert_eq!(button.event_type, RawEventType::Button);
        assert!(button.initial);
    }

    #[test]
    fn skips_unknown_record_types() {
        assert!(parse_js_event(&record(0, 0, 0x04, 0)).is_none());
    }

    #[test]
    fn calibrated_sweep_is_monotonic_and_clamped() {
        let calibration = AxisCalibration {
            min: -1000,
            max: 3000,
        };
        assert_eq!(normalize_axis(-1000, calibration), -1.0);
        assert_eq!(normalize_axis(1000, calibration), 0.0);
        assert_eq!(normalize_axis(3000, calibration), 1.0);
        assert_eq!(normalize_axis(-32767, calibration), -1.0);
        assert_eq!(normalize_axis(32767, calibration), 1.0);

        let mut previous = f64::NEG_INFINITY;
        for raw in (-1500..=3500).step_by(50) {
            let value = normalize_axis(raw, calibration);
            assert!(value >= previous, "sweep regressed at raw {}", raw);
            assert!((-1.0..=1.0).contains(&value));
            previous = value;
        }
    }

    #[test]
    fn decode_uses_per_axis_calibration() {
        let device = DeviceConfig {
            calibration: vec![CalibrationEntry {
                code: 2,
                min: 0,
                max: 255,
            }],
            ..DeviceConfig::default()
        };
        let table = DecodeTable::new(device);

        let trigger = table.decode(&RawDeviceEvent {
            event_type: RawEventType::Axis,
            number: 2,
            value: 255,
            initial: false,
            time_ms: 0,
        });
        assert_eq!(trigger.kind, LogicalEventKind::AxisMoved);
        assert_eq!(trigger.value, 1.0);

        let stick = table.decode(&RawDeviceEvent {
            event_type: RawEventType::Axis,
            number: 0,
            value: -32767,
            initial: false,
            time_ms: 0,
        });
        assert_eq!(stick.value, -1.0);

        let release = table.decode(&RawDeviceEvent {
            event_type: RawEventType::Button,
            number: 4,
            value: 0,
            initial: true,
            time_ms: 0,
        });
        assert_eq!(release.kind, LogicalEventKind::ButtonReleased);
        assert!(release.initial);
    }
}
