//! Startup configuration for the pendant.
//!
//! A single immutable [`PendantConfig`] is built once in `main` and handed to
//! each subsystem as its own section. Every field has a default, so a missing
//! file or a partial file still yields a runnable configuration.

use crate::controller::{AxisCode, ButtonCode, MachineAxis};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const CONFIG_ENV_VAR: &str = "CNCPENDANT_CONFIG";
const CONFIG_DIR: &str = "cncpendant";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(default)]
pub struct PendantConfig {
    pub device: DeviceConfig,
    pub control: ControlConfig,
    pub dispatch: DispatchConfig,
    pub session: SessionConfig,
}

/// Which collaborator produces raw device events
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeviceBackend {
    /// Linux joystick API (`/dev/input/jsN`)
    #[default]
    Joydev,
    /// Any gamepad gilrs can see
    Gilrs,
}

/// Raw device range for one axis; values outside are clamped
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq)]
pub struct AxisCalibration {
    pub min: i32,
    pub max: i32,
}

impl Default for AxisCalibration {
    fn default() -> Self {
        Self {
            min: -32767,
            max: 32767,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default)]
pub struct DeviceConfig {
    pub backend: DeviceBackend,
    pub path: PathBuf,
    pub open_attempts: u32,
    pub open_retry_delay_ms: u64,
    /// Per-axis calibration; unlisted axes use the default range
    pub calibration: Vec<CalibrationEntry>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq)]
pub struct CalibrationEntry {
    pub code: AxisCode,
    pub min: i32,
    pub max: i32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            backend: DeviceBackend::Joydev,
            path: PathBuf::from("/dev/input/js0"),
            open_attempts: 5,
            open_retry_delay_ms: 500,
            calibration: Vec::new(),
        }
    }
}

impl DeviceConfig {
    pub fn calibration_for(&self, code: AxisCode) -> AxisCalibration {
        self.calibration
            .iter()
            .find(|entry| entry.code == code)
            .map(|entry| AxisCalibration {
                min: entry.min,
                max: entry.max,
            })
            .unwrap_or_default()
    }

    pub fn open_retry_delay(&self) -> Duration {
        Duration::from_millis(self.open_retry_delay_ms)
    }
}

/// A device axis driving one machine axis
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq)]
pub struct AxisBinding {
    pub code: AxisCode,
    pub axis: MachineAxis,
    #[serde(default)]
    pub invert: bool,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Positive,
    Negative,
}

impl Direction {
    pub fn sign(self) -> f64 {
        match self {
            Direction::Positive => 1.0,
            Direction::Negative => -1.0,
        }
    }
}

/// Controller-side commands a button can trigger directly
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum MachineCommand {
    Unlock,
    Reset,
    FeedHold,
    CycleStart,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq)]
#[serde(tag = "function", rename_all = "snake_case")]
pub enum ButtonFunction {
    Step {
        axis: MachineAxis,
        direction: Direction,
    },
    Home,
    Stop,
    FeedUp,
    FeedDown,
    ToggleAxis {
        axis: MachineAxis,
    },
    Command {
        command: MachineCommand,
    },
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq)]
pub struct ButtonBinding {
    pub code: ButtonCode,
    #[serde(flatten)]
    pub function: ButtonFunction,
}

/// Named button/axis numbering of a supported gamepad
///
/// Selects the default bindings when the config lists none of its own.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum GamepadLayout {
    #[default]
    Ps3,
    Ps4,
    Xbox360,
    /// ModMyPi wireless USB gamepad
    Mmp1251,
}

impl GamepadLayout {
    pub const ALL: [GamepadLayout; 4] = [
        GamepadLayout::Ps3,
        GamepadLayout::Ps4,
        GamepadLayout::Xbox360,
        GamepadLayout::Mmp1251,
    ];

    /// LEFT-X, LEFT-Y and RIGHT-Y drive X, Y and Z on every layout
    pub fn axis_bindings(self) -> Vec<AxisBinding> {
        vec![
            AxisBinding {
                code: 0,
                axis: MachineAxis::X,
                invert: false,
            },
            AxisBinding {
                code: 1,
                axis: MachineAxis::Y,
                invert: true,
            },
            AxisBinding {
                code: 4,
                axis: MachineAxis::Z,
                invert: true,
            },
        ]
    }

    pub fn button_bindings(self) -> Vec<ButtonBinding> {
        use ButtonFunction::*;
        use Direction::*;
        use MachineAxis::*;

        let button = |code, function| ButtonBinding { code, function };
        let command = |command| Command { command };
        let step = |axis, direction| Step { axis, direction };

        match self {
            // CROSS, CIRCLE, TRIANGLE, SQUARE, L1, R1, L2, R2, SELECT, START, D-pad
            GamepadLayout::Ps3 => vec![
                button(0, Stop),
                button(1, command(MachineCommand::Unlock)),
                button(2, Home),
                button(3, ToggleAxis { axis: Z }),
                button(4, FeedDown),
                button(5, FeedUp),
                button(6, step(Z, Negative)),
                button(7, step(Z, Positive)),
                button(8, command(MachineCommand::FeedHold)),
                button(9, command(MachineCommand::CycleStart)),
                button(13, step(Y, Positive)),
                button(14, step(Y, Negative)),
                button(15, step(X, Negative)),
                button(16, step(X, Positive)),
            ],
            // Same face buttons as the PS3; the D-pad is an axis pair here
            GamepadLayout::Ps4 => vec![
                button(0, Stop),
                button(1, command(MachineCommand::Unlock)),
                button(2, Home),
                button(3, ToggleAxis { axis: Z }),
                button(4, FeedDown),
                button(5, FeedUp),
                button(6, step(Z, Negative)),
                button(7, step(Z, Positive)),
                button(8, command(MachineCommand::FeedHold)),
                button(9, command(MachineCommand::CycleStart)),
            ],
            // A, B, X, Y, LB/L1, RB/R1, BACK/SELECT, START
            GamepadLayout::Xbox360 | GamepadLayout::Mmp1251 => vec![
                button(0, Stop),
                button(1, command(MachineCommand::Unlock)),
                button(2, ToggleAxis { axis: Z }),
                button(3, Home),
                button(4, FeedDown),
                button(5, FeedUp),
                button(6, command(MachineCommand::FeedHold)),
                button(7, command(MachineCommand::CycleStart)),
            ],
        }
    }
}

/// Chooses a step distance from how far an analog axis is pushed
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq)]
pub struct StepMagnitude {
    pub code: AxisCode,
    pub slow_step: f64,
    pub mid_step: f64,
    pub fast_step: f64,
    pub slow_below: f64,
    pub fast_above: f64,
}

impl StepMagnitude {
    /// Distance for the given normalized axis input (sign ignored)
    pub fn distance(&self, input: f64) -> f64 {
        let input = input.abs();
        if input < self.slow_below {
            self.slow_step
        } else if input > self.fast_above {
            self.fast_step
        } else {
            self.mid_step
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default)]
pub struct ControlConfig {
    pub layout: GamepadLayout,
    pub deadzone: f64,
    pub debounce_ms: u64,
    pub poll_interval_ms: u64,
    pub feed_step: u16,
    pub initial_feed_override: u16,
    /// Feed rate at full deflection and 100 % override, in machine units/min
    pub max_jog_feed: f64,
    pub step_distance: f64,
    pub step_magnitude: Option<StepMagnitude>,
    /// Homing is abandoned if the machine does not report `Run` within this
    pub homing_timeout_ms: u64,
    pub active_axes: Vec<MachineAxis>,
    /// Empty means the layout's bindings
    #[serde(default)]
    pub axes: Vec<AxisBinding>,
    /// Empty means the layout's bindings
    #[serde(default)]
    pub buttons: Vec<ButtonBinding>,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self::for_layout(GamepadLayout::default())
    }
}

impl ControlConfig {
    pub fn for_layout(layout: GamepadLayout) -> Self {
        Self {
            layout,
            deadzone: 0.15,
            debounce_ms: 80,
            poll_interval_ms: 10,
            feed_step: 10,
            initial_feed_override: 100,
            max_jog_feed: 1000.0,
            step_distance: 1.0,
            step_magnitude: None,
            homing_timeout_ms: 10_000,
            active_axes: vec![MachineAxis::X, MachineAxis::Y, MachineAxis::Z],
            axes: layout.axis_bindings(),
            buttons: layout.button_bindings(),
        }
    }

    /// Fills unlisted bindings from the selected layout
    fn apply_layout(&mut self) {
        if self.axes.is_empty() {
            self.axes = self.layout.axis_bindings();
        }
        if self.buttons.is_empty() {
            self.buttons = self.layout.button_bindings();
        }
    }

    pub fn homing_timeout(&self) -> Duration {
        Duration::from_millis(self.homing_timeout_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default)]
pub struct DispatchConfig {
    pub flush_interval_ms: u64,
    pub intent_buffer: usize,
    pub command_buffer: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 50,
            intent_buffer: 64,
            command_buffer: 32,
        }
    }
}

impl DispatchConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub factor: f64,
    pub cap_ms: u64,
    /// Fraction of the nominal delay added as random jitter (0 disables)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 1000,
            factor: 2.0,
            cap_ms: 30_000,
            jitter: 0.2,
        }
    }
}

/// Opaque credentials for the `credentials` handshake
#[derive(Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Credentials {
    pub name: String,
    pub token: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("name", &self.name)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Serial port the controller server should open once the session is ready
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachinePort {
    pub port: String,
    pub baudrate: u32,
    pub controller_type: String,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub topic_root: String,
    pub broker_user: Option<String>,
    pub broker_password: Option<String>,
    pub credentials: Credentials,
    pub machine_port: Option<MachinePort>,
    pub connect_timeout_ms: u64,
    pub auth_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Heartbeat intervals without inbound traffic before the link is degraded
    pub heartbeat_tolerance: u32,
    pub grace_period_ms: u64,
    pub close_timeout_ms: u64,
    pub safety_replay_max_age_ms: u64,
    pub max_retries: u32,
    pub backoff: BackoffConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "cncpendant".to_string(),
            topic_root: "cnc".to_string(),
            broker_user: None,
            broker_password: None,
            credentials: Credentials::default(),
            machine_port: None,
            connect_timeout_ms: 5000,
            auth_timeout_ms: 5000,
            heartbeat_interval_ms: 1000,
            heartbeat_tolerance: 3,
            grace_period_ms: 5000,
            close_timeout_ms: 500,
            safety_replay_max_age_ms: 5000,
            max_retries: 10,
            backoff: BackoffConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval() * self.heartbeat_tolerance.max(1)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn safety_replay_max_age(&self) -> Duration {
        Duration::from_millis(self.safety_replay_max_age_ms)
    }
}

impl PendantConfig {
    /// Resolves the config path: env override first, then the user config directory
    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            return PathBuf::from(path);
        }
        let mut path = dirs::config_dir().unwrap_or_else(|| {
            warn!("Could not determine config directory, using current directory");
            PathBuf::from(".")
        });
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    /// Loads and validates the file at `path`; a missing file yields defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            info!("Loading configuration from {}", path.display());
            let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            Self::from_toml(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            info!(
                "No configuration at {}, using built-in defaults",
                path.display()
            );
            Self::default()
        };

        config.validate()?;
        debug!("Configuration loaded: {:?}", config);
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        let mut config: Self = toml::from_str(content)?;
        config.control.apply_layout();
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        let control = &self.control;

        if !(0.0..1.0).contains(&control.deadzone) {
            return invalid(format!("deadzone {} outside [0, 1)", control.deadzone));
        }
        if control.feed_step == 0 {
            return invalid("feed_step must be positive".to_string());
        }
        if !(10..=200).contains(&control.initial_feed_override) {
            return invalid(format!(
                "initial_feed_override {} outside [10, 200]",
                control.initial_feed_override
            ));
        }
        if control.poll_interval_ms == 0 || self.dispatch.flush_interval_ms == 0 {
            return invalid("poll and flush intervals must be positive".to_string());
        }
        if control.homing_timeout_ms == 0 {
            return invalid("homing_timeout_ms must be positive".to_string());
        }
        if self.device.backend == DeviceBackend::Gilrs && control.layout != GamepadLayout::Ps3 {
            return invalid(format!(
                "gilrs backend reports PS3 numbering, layout {:?} does not apply",
                control.layout
            ));
        }
        if self.session.heartbeat_interval_ms == 0 {
            return invalid("heartbeat_interval_ms must be positive".to_string());
        }
        if self.dispatch.intent_buffer == 0 || self.dispatch.command_buffer == 0 {
            return invalid("channel buffers must be positive".to_string());
        }
        for entry in &self.device.calibration {
            if entry.min >= entry.max {
                return invalid(format!(
                    "axis {} calibration min {} >= max {}",
                    entry.code, entry.min, entry.max
                ));
            }
        }

        let mut seen = HashSet::new();
        for binding in &control.buttons {
            if !seen.insert(binding.code) {
                return invalid(format!("button {} bound more than once", binding.code));
            }
        }

        let backoff = &self.session.backoff;
        if backoff.factor < 1.0 {
            return invalid(format!("backoff factor {} below 1", backoff.factor));
        }
        if backoff.base_ms == 0 || backoff.cap_ms < backoff.base_ms {
            return invalid(format!(
                "backoff base {}ms / cap {}ms inconsistent",
                backoff.base_ms, backoff.cap_ms
            ));
        }
        if !(0.0..=1.0).contains(&backoff.jitter) {
            return invalid(format!("backoff jitter {} outside [0, 1]", backoff.jitter));
        }

        Ok(())
    }
}
