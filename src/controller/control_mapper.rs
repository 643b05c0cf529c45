//! Control Mapper - logical events to machine intents
//!
//! Events update the mapper's view of the device (axis fractions, button
//! levels) as they arrive; intents are only decided on the poll tick, at most
//! one per cycle. Button functions are edge-triggered: a press is recorded
//! when the new level differs from the stored previous level, and the edge
//! stays pending until a cycle consumes it. Lower-priority edges therefore
//! fire on a later cycle instead of being lost.
//!
//! # Modes
//!
//! ```text
//!            deflection > deadzone            all axes inside deadzone
//!   Idle ───(status Idle|Hold)──► Jogging ───(for the debounce window)──► Idle
//!    │  ▲                            │
//!    │  └── all step buttons up ─┐   │ step edge (jog released first)
//!    └──── step edge ─────────► StepJog
//!
//!   any ── home edge (not in Alarm) ──► Homing ── Run then Idle|Hold ──► Idle
//!                                          └──── no Run in time ───────► Idle
//!   any ── stop edge, status Alarm|Door ──► Idle (+ StopAll)
//! ```
//!
//! While jogging the current vector is offered every cycle, not only when it
//! changes; the coalescer collapses repeats. A held stick therefore reaches
//! the machine again after the session drops and recovers.

use super::{
    AxisCode, AxisSet, ButtonCode, JogVector, LogicalEvent, LogicalEventKind, MachineAxis,
};
use crate::config::{ButtonFunction, ControlConfig};
use crate::dispatch::Intent;
use crate::status::{MachineStatus, RunState};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info, warn};

const MIN_FEED_OVERRIDE: u16 = 10;
const MAX_FEED_OVERRIDE: u16 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMode {
    Idle,
    Jogging,
    StepJog,
    Homing,
}

/// Mapper-owned control state, published read-only to observers
#[derive(Debug, Clone, PartialEq)]
pub struct ControlState {
    pub mode: ControlMode,
    pub active_axes: AxisSet,
    pub jog_vector: JogVector,
    pub feed_override_percent: u16,
    pub last_intent_at: Option<Instant>,
}

#[derive(Debug, Clone, Copy, Default)]
struct ButtonTrack {
    level: bool,
    /// Press edge not yet consumed by a poll cycle
    pending: bool,
}

#[derive(Debug)]
pub struct ControlMapper {
    config: ControlConfig,
    state: ControlState,
    axis_values: HashMap<AxisCode, f64>,
    buttons: HashMap<ButtonCode, ButtonTrack>,
    run_state: Option<RunState>,
    /// Start of the current all-inside-deadzone stretch while jogging
    settled_since: Option<Instant>,
    homing_since: Option<Instant>,
    homing_saw_run: bool,
    /// Highest adverse-entry count seen in a status snapshot
    adverse_seen: u64,
}

impl ControlMapper {
    pub fn new(config: ControlConfig) -> Self {
        let feed = config
            .initial_feed_override
            .clamp(MIN_FEED_OVERRIDE, MAX_FEED_OVERRIDE);
        let active_axes = config.active_axes.iter().copied().collect();
        Self {
            state: ControlState {
                mode: ControlMode::Idle,
                active_axes,
                jog_vector: JogVector::default(),
                feed_override_percent: feed,
                last_intent_at: None,
            },
            config,
            axis_values: HashMap::new(),
            buttons: HashMap::new(),
            run_state: None,
            settled_since: None,
            homing_since: None,
            homing_saw_run: false,
            adverse_seen: 0,
        }
    }

    pub fn state(&self) -> &ControlState {
        &self.state
    }

    /// Records a device event; decisions are deferred to [`ControlMapper::poll`]
    pub fn handle_event(&mut self, event: &LogicalEvent) {
        match event.kind {
            LogicalEventKind::AxisMoved => {
                self.axis_values.insert(event.code, event.value.clamp(-1.0, 1.0));
            }
            LogicalEventKind::ButtonPressed | LogicalEventKind::ButtonReleased => {
                let pressed = event.kind == LogicalEventKind::ButtonPressed;
                let track = self.buttons.entry(event.code).or_default();
                if pressed && !track.level && !event.initial {
                    debug!("Button {} press edge", event.code);
                    track.pending = true;
                }
                track.level = pressed;
            }
        }
    }

    /// Feeds a new status snapshot; adverse states force Idle and stop
    ///
    /// An adverse state that came and went between two snapshots is still
    /// caught through the snapshot's adverse-entry count.
    pub fn on_status(&mut self, status: Option<&MachineStatus>) -> Option<Intent> {
        let new_state = status.map(|s| s.run_state);
        let previous = std::mem::replace(&mut self.run_state, new_state);
        let status = status?;
        let run_state = status.run_state;

        let entered = run_state.is_adverse() && previous != Some(run_state);
        let missed = status.adverse_entries > self.adverse_seen;
        self.adverse_seen = self.adverse_seen.max(status.adverse_entries);
        if entered || missed {
            if entered {
                warn!(
                    "Machine entered {} while {:?}, forcing Idle",
                    run_state, self.state.mode
                );
            } else {
                warn!(
                    "Machine passed through Alarm/Door between updates (now {}), forcing Idle",
                    run_state
                );
            }
            self.force_idle();
            return Some(self.emit(Intent::StopAll, Instant::now()));
        }

        if self.state.mode == ControlMode::Homing {
            if run_state == RunState::Run {
                self.homing_saw_run = true;
            } else if self.homing_saw_run && run_state.permits_jog() {
                info!("Homing finished");
                self.state.mode = ControlMode::Idle;
                self.homing_since = None;
            }
        }
        None
    }

    /// Device lost; everything held is forgotten
    pub fn reset(&mut self) {
        self.axis_values.clear();
        self.buttons.clear();
        self.force_idle();
    }

    /// One poll cycle; returns at most one intent
    pub fn poll(&mut self, now: Instant) -> Option<Intent> {
        if self.take_edges(|f| matches!(f, ButtonFunction::Stop)) {
            info!("Stop requested from {:?}", self.state.mode);
            self.force_idle();
            return Some(self.emit(Intent::StopAll, now));
        }

        self.check_homing_timeout(now);

        if self.take_edge(|f| matches!(f, ButtonFunction::Home)).is_some() {
            if self.run_state == Some(RunState::Alarm) {
                warn!("Ignoring home request while machine is in Alarm");
            } else {
                info!("Homing requested");
                self.release_jog_state();
                self.state.mode = ControlMode::Homing;
                self.homing_saw_run = false;
                self.homing_since = Some(now);
                return Some(self.emit(Intent::Home, now));
            }
        }

        if let Some(ButtonFunction::Command { command }) =
            self.take_edge(|f| matches!(f, ButtonFunction::Command { .. }))
        {
            info!("Machine command {:?}", command);
            return Some(self.emit(Intent::Command { command }, now));
        }

        if let Some(intent) = self.poll_step(now) {
            return Some(intent);
        }

        while let Some(function) =
            self.take_edge(|f| matches!(f, ButtonFunction::FeedUp | ButtonFunction::FeedDown))
        {
            let step = self.config.feed_step;
            let current = self.state.feed_override_percent;
            let next = match function {
                ButtonFunction::FeedUp => current.saturating_add(step),
                _ => current.saturating_sub(step),
            }
            .clamp(MIN_FEED_OVERRIDE, MAX_FEED_OVERRIDE);
            if next != current {
                debug!("Feed override {}% -> {}%", current, next);
                self.state.feed_override_percent = next;
                return Some(self.emit(Intent::SetFeedOverride { percent: next }, now));
            }
        }

        if let Some(ButtonFunction::ToggleAxis { axis }) =
            self.take_edge(|f| matches!(f, ButtonFunction::ToggleAxis { .. }))
        {
            let active = self.state.active_axes.toggle(axis);
            info!("Axis {} {}", axis, if active { "enabled" } else { "disabled" });
            let axes = self.state.active_axes;
            return Some(self.emit(Intent::SelectAxis { axes }, now));
        }

        self.poll_motion(now)
    }

    /// Gives up on a homing cycle the machine never started
    fn check_homing_timeout(&mut self, now: Instant) {
        if self.state.mode != ControlMode::Homing || self.homing_saw_run {
            return;
        }
        let Some(since) = self.homing_since else {
            return;
        };
        if now.duration_since(since) >= self.config.homing_timeout() {
            warn!(
                "Machine did not start homing within {:?}, back to Idle",
                self.config.homing_timeout()
            );
            self.state.mode = ControlMode::Idle;
            self.homing_since = None;
        }
    }

    fn poll_step(&mut self, now: Instant) -> Option<Intent> {
        let is_step = |f: &ButtonFunction| matches!(f, ButtonFunction::Step { .. });

        match self.state.mode {
            ControlMode::Homing => {
                if self.take_edges(is_step) {
                    debug!("Step ignored while homing");
                }
                None
            }
            ControlMode::Jogging if self.has_edge(is_step) => {
                // Release the running jog first; the step fires next cycle
                self.state.mode = ControlMode::StepJog;
                self.release_jog_state();
                Some(self.emit(Self::jog_release(), now))
            }
            ControlMode::Idle | ControlMode::StepJog => {
                let entering = self.state.mode == ControlMode::Idle;
                if entering && self.has_edge(is_step) && !self.jog_permitted() {
                    self.take_edges(is_step);
                    debug!("Step ignored, machine state {:?}", self.run_state);
                    return None;
                }

                let Some(ButtonFunction::Step { axis, direction }) = self.take_edge(is_step)
                else {
                    if self.state.mode == ControlMode::StepJog && !self.any_held(is_step) {
                        debug!("Step buttons released, back to Idle");
                        self.state.mode = ControlMode::Idle;
                    }
                    return None;
                };

                self.state.mode = ControlMode::StepJog;
                let distance = direction.sign() * self.step_distance();
                debug!("Step {} by {:.3}", axis, distance);
                Some(self.emit(Intent::Step { axis, distance }, now))
            }
            ControlMode::Jogging => None,
        }
    }

    fn poll_motion(&mut self, now: Instant) -> Option<Intent> {
        let vector = self.jog_vector();

        match self.state.mode {
            ControlMode::Idle => {
                self.state.jog_vector = JogVector::default();
                if vector.is_zero() || !self.jog_permitted() {
                    return None;
                }
                debug!("Deflection past deadzone, start jogging");
                self.state.mode = ControlMode::Jogging;
                self.settled_since = None;
                self.state.jog_vector = vector;
                self.emit_jog(vector, now)
            }
            ControlMode::Jogging => {
                self.state.jog_vector = vector;
                if !vector.is_zero() {
                    self.settled_since = None;
                    return self.emit_jog(vector, now);
                }

                let since = *self.settled_since.get_or_insert(now);
                if now.duration_since(since) < self.config.debounce() {
                    return None;
                }
                debug!("Axes settled for {:?}, jog released", self.config.debounce());
                self.state.mode = ControlMode::Idle;
                self.settled_since = None;
                self.emit_jog(JogVector::default(), now)
            }
            ControlMode::StepJog | ControlMode::Homing => None,
        }
    }

    /// Deadzoned, inverted, active-only axis fractions scaled by feed override
    fn jog_vector(&self) -> JogVector {
        let mut vector = JogVector::default();
        for binding in &self.config.axes {
            let raw = self.axis_values.get(&binding.code).copied().unwrap_or(0.0);
            let value = if binding.invert { -raw } else { raw };
            if value.abs() <= self.config.deadzone {
                continue;
            }
            let summed = (vector.get(binding.axis) + value).clamp(-1.0, 1.0);
            vector.set(binding.axis, summed);
        }

        let scale = f64::from(self.state.feed_override_percent) / 100.0;
        for axis in MachineAxis::ALL {
            let value = if self.state.active_axes.contains(axis) {
                vector.get(axis) * scale
            } else {
                0.0
            };
            vector.set(axis, value);
        }
        vector
    }

    fn step_distance(&self) -> f64 {
        let base = match self.config.step_magnitude {
            Some(magnitude) => {
                let input = self.axis_values.get(&magnitude.code).copied().unwrap_or(0.0);
                magnitude.distance(input)
            }
            None => self.config.step_distance,
        };
        base * f64::from(self.state.feed_override_percent) / 100.0
    }

    fn jog_permitted(&self) -> bool {
        self.run_state.is_some_and(RunState::permits_jog)
    }

    fn emit_jog(&mut self, vector: JogVector, now: Instant) -> Option<Intent> {
        let feed_rate = self.config.max_jog_feed * vector.peak();
        Some(self.emit(Intent::Jog { vector, feed_rate }, now))
    }

    fn jog_release() -> Intent {
        Intent::Jog {
            vector: JogVector::default(),
            feed_rate: 0.0,
        }
    }

    fn emit(&mut self, intent: Intent, now: Instant) -> Intent {
        self.state.last_intent_at = Some(now);
        intent
    }

    fn release_jog_state(&mut self) {
        self.state.jog_vector = JogVector::default();
        self.settled_since = None;
    }

    fn force_idle(&mut self) {
        self.state.mode = ControlMode::Idle;
        self.release_jog_state();
        self.homing_saw_run = false;
        self.homing_since = None;

        // Pending motion edges die with the stop; feed/axis/command edges survive
        let motion: Vec<ButtonCode> = self
            .buttons
            .keys()
            .copied()
            .filter(|code| {
                matches!(
                    self.bound_function(*code),
                    Some(ButtonFunction::Step { .. } | ButtonFunction::Home)
                )
            })
            .collect();
        for code in motion {
            if let Some(track) = self.buttons.get_mut(&code) {
                track.pending = false;
            }
        }
    }

    fn bound_function(&self, code: ButtonCode) -> Option<ButtonFunction> {
        self.config
            .buttons
            .iter()
            .find(|b| b.code == code)
            .map(|b| b.function)
    }

    fn has_edge(&self, matches: impl Fn(&ButtonFunction) -> bool) -> bool {
        self.buttons.iter().any(|(code, track)| {
            track.pending && self.bound_function(*code).is_some_and(|f| matches(&f))
        })
    }

    fn any_held(&self, matches: impl Fn(&ButtonFunction) -> bool) -> bool {
        self.buttons.iter().any(|(code, track)| {
            track.level && self.bound_function(*code).is_some_and(|f| matches(&f))
        })
    }

    /// Consumes the pending edge with the lowest button code among matches
    fn take_edge(&mut self, matches: impl Fn(&ButtonFunction) -> bool) -> Option<ButtonFunction> {
        let (code, function) = self
            .buttons
            .iter()
            .filter(|(_, track)| track.pending)
            .filter_map(|(code, _)| self.bound_function(*code).map(|f| (*code, f)))
            .filter(|(_, f)| matches(f))
            .min_by_key(|(code, _)| *code)?;
        if let Some(track) = self.buttons.get_mut(&code) {
            track.pending = false;
        }
        Some(function)
    }

    /// Consumes every matching pending edge; true if there was one
    fn take_edges(&mut self, matches: impl Fn(&ButtonFunction) -> bool) -> bool {
        let mut any = false;
        while self.take_edge(&matches).is_some() {
            any = true;
        }
        any
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AxisBinding, ButtonBinding, Direction, MachineCommand, StepMagnitude};
    use crate::status::WorkPosition;
    use std::time::Duration;

    const STOP: u8 = 0;
    const UNLOCK: u8 = 1;
    const HOME: u8 = 2;
    const TOGGLE_Z: u8 = 3;
    const FEED_DOWN: u8 = 4;
    const FEED_UP: u8 = 5;
    const STEP_X_PLUS: u8 = 16;

    fn status(run_state: RunState) -> MachineStatus {
        MachineStatus::new(
            run_state,
            WorkPosition {
                x: 0.0,
                y: 0.0,
                z: 0.0,
            },
            0.0,
        )
    }

    fn ready_mapper() -> ControlMapper {
        let mut mapper = ControlMapper::new(ControlConfig::default());
        mapper.on_status(Some(&status(RunState::Idle)));
        mapper
    }

    fn ms(start: Instant, offset: u64) -> Instant {
        start + Duration::from_millis(offset)
    }

    fn press(mapper: &mut ControlMapper, code: u8) {
        mapper.handle_event(&LogicalEvent::button(code, true));
    }

    fn release(mapper: &mut ControlMapper, code: u8) {
        mapper.handle_event(&LogicalEvent::button(code, false));
    }

    #[test]
    fn inside_deadzone_is_exactly_zero() {
        let mut mapper = ready_mapper();
        let start = Instant::now();

        mapper.handle_event(&LogicalEvent::axis(0, 0.149));
        mapper.handle_event(&LogicalEvent::axis(1, -0.15));
        assert_eq!(mapper.poll(start), None);
        assert_eq!(mapper.state().mode, ControlMode::Idle);
        assert!(mapper.state().jog_vector.is_zero());

        mapper.handle_event(&LogicalEvent::axis(1, -0.6));
        let Some(Intent::Jog { vector, .. }) = mapper.poll(ms(start, 10)) else {
            panic!("expected jog");
        };
        assert_eq!(vector.x, 0.0);
        // Y binding is inverted
        assert_eq!(vector.y, 0.6);
        assert_eq!(vector.z, 0.0);
    }

    #[test]
    fn jog_needs_known_idle_or_hold_status() {
        let mut mapper = ControlMapper::new(ControlConfig::default());
        let start = Instant::now();
        mapper.handle_event(&LogicalEvent::axis(0, 0.8));
        assert_eq!(mapper.poll(start), None);

        mapper.on_status(Some(&status(RunState::Run)));
        assert_eq!(mapper.poll(ms(start, 10)), None);

        mapper.on_status(Some(&status(RunState::Hold)));
        assert!(matches!(
            mapper.poll(ms(start, 20)),
            Some(Intent::Jog { .. })
        ));
        assert_eq!(mapper.state().mode, ControlMode::Jogging);
    }

    #[test]
    fn oscillation_inside_debounce_window_is_one_transition() {
        let mut mapper = ready_mapper();
        let start = Instant::now();
        let mut transitions = 0;
        let mut mode = mapper.state().mode;

        for step in 0..6u64 {
            let value = if step % 2 == 0 { 0.5 } else { 0.1 };
            mapper.handle_event(&LogicalEvent::axis(0, value));
            mapper.poll(ms(start, step * 10));
            if mapper.state().mode != mode {
                transitions += 1;
                mode = mapper.state().mode;
            }
        }
        assert_eq!(transitions, 1);
        assert_eq!(mapper.state().mode, ControlMode::Jogging);

        // Settled past the window: exactly one release
        mapper.handle_event(&LogicalEvent::axis(0, 0.0));
        assert_eq!(mapper.poll(ms(start, 60)), None);
        assert_eq!(mapper.poll(ms(start, 100)), None);
        let release = mapper.poll(ms(start, 140));
        assert!(matches!(release, Some(Intent::Jog { vector, .. }) if vector.is_zero()));
        assert_eq!(mapper.state().mode, ControlMode::Idle);
        assert_eq!(mapper.poll(ms(start, 150)), None);
    }

    #[test]
    fn held_step_fires_once() {
        let mut mapper = ready_mapper();
        let start = Instant::now();

        press(&mut mapper, STEP_X_PLUS);
        let mut steps = 0;
        for tick in 0..50u64 {
            // joydev repeats nothing, but a redundant level report must not re-fire
            if tick % 10 == 5 {
                press(&mut mapper, STEP_X_PLUS);
            }
            if let Some(Intent::Step { axis, distance }) = mapper.poll(ms(start, tick * 10)) {
                assert_eq!(axis, MachineAxis::X);
                assert_eq!(distance, 1.0);
                steps += 1;
            }
        }
        assert_eq!(steps, 1);
        assert_eq!(mapper.state().mode, ControlMode::StepJog);

        release(&mut mapper, STEP_X_PLUS);
        assert_eq!(mapper.poll(ms(start, 510)), None);
        assert_eq!(mapper.state().mode, ControlMode::Idle);
    }

    #[test]
    fn tap_between_polls_is_latched() {
        let mut mapper = ready_mapper();
        press(&mut mapper, STEP_X_PLUS);
        release(&mut mapper, STEP_X_PLUS);
        assert!(matches!(
            mapper.poll(Instant::now()),
            Some(Intent::Step { .. })
        ));
    }

    #[test]
    fn initial_state_report_does_not_fire() {
        let mut mapper = ready_mapper();
        let mut held = LogicalEvent::button(HOME, true);
        held.initial = true;
        mapper.handle_event(&held);
        assert_eq!(mapper.poll(Instant::now()), None);
    }

    #[test]
    fn step_scales_with_override_and_magnitude_axis() {
        let config = ControlConfig {
            step_magnitude: Some(StepMagnitude {
                code: 5,
                slow_step: 0.1,
                mid_step: 1.0,
                fast_step: 10.0,
                slow_below: 0.0,
                fast_above: 0.8,
            }),
            initial_feed_override: 50,
            ..ControlConfig::default()
        };
        let mut mapper = ControlMapper::new(config);
        mapper.on_status(Some(&status(RunState::Idle)));

        mapper.handle_event(&LogicalEvent::axis(5, 0.9));
        mapper.handle_event(&LogicalEvent::button(15, true));
        assert_eq!(
            mapper.poll(Instant::now()),
            Some(Intent::Step {
                axis: MachineAxis::X,
                distance: -5.0
            })
        );
    }

    #[test]
    fn alarm_forces_idle_and_stops_once() {
        let mut mapper = ready_mapper();
        let start = Instant::now();
        mapper.handle_event(&LogicalEvent::axis(0, 0.9));
        assert!(matches!(mapper.poll(start), Some(Intent::Jog { .. })));

        assert_eq!(
            mapper.on_status(Some(&status(RunState::Alarm))),
            Some(Intent::StopAll)
        );
        assert_eq!(mapper.state().mode, ControlMode::Idle);
        assert!(mapper.state().jog_vector.is_zero());

        // Still in alarm: no second stop, no jog even with the stick deflected
        assert_eq!(mapper.on_status(Some(&status(RunState::Alarm))), None);
        assert_eq!(mapper.poll(ms(start, 10)), None);
    }

    #[test]
    fn home_ignored_in_alarm_but_unlock_goes_through() {
        let mut mapper = ready_mapper();
        mapper.on_status(Some(&status(RunState::Alarm)));

        press(&mut mapper, HOME);
        assert_eq!(mapper.poll(Instant::now()), None);
        assert_eq!(mapper.state().mode, ControlMode::Idle);

        press(&mut mapper, UNLOCK);
        assert_eq!(
            mapper.poll(Instant::now()),
            Some(Intent::Command {
                command: MachineCommand::Unlock
            })
        );
    }

    #[test]
    fn homing_ends_after_run_then_idle() {
        let mut mapper = ready_mapper();
        press(&mut mapper, HOME);
        assert_eq!(mapper.poll(Instant::now()), Some(Intent::Home));
        assert_eq!(mapper.state().mode, ControlMode::Homing);

        mapper.on_status(Some(&status(RunState::Idle)));
        assert_eq!(mapper.state().mode, ControlMode::Homing);
        mapper.on_status(Some(&status(RunState::Run)));
        mapper.on_status(Some(&status(RunState::Idle)));
        assert_eq!(mapper.state().mode, ControlMode::Idle);
    }

    #[test]
    fn homing_gives_up_without_run() {
        let config = ControlConfig {
            homing_timeout_ms: 2000,
            ..ControlConfig::default()
        };
        let mut mapper = ControlMapper::new(config);
        mapper.on_status(Some(&status(RunState::Idle)));
        let start = Instant::now();

        press(&mut mapper, HOME);
        assert_eq!(mapper.poll(start), Some(Intent::Home));
        mapper.handle_event(&LogicalEvent::axis(0, 0.9));
        press(&mut mapper, STEP_X_PLUS);

        for tick in 1..199u64 {
            mapper.on_status(Some(&status(RunState::Idle)));
            assert_eq!(mapper.poll(ms(start, tick * 10)), None);
        }
        assert_eq!(mapper.state().mode, ControlMode::Homing);

        // Timed out: stick motion is honored again
        assert!(matches!(
            mapper.poll(ms(start, 2000)),
            Some(Intent::Jog { .. })
        ));
        assert_eq!(mapper.state().mode, ControlMode::Jogging);
    }

    #[test]
    fn homing_in_progress_does_not_time_out() {
        let config = ControlConfig {
            homing_timeout_ms: 100,
            ..ControlConfig::default()
        };
        let mut mapper = ControlMapper::new(config);
        mapper.on_status(Some(&status(RunState::Idle)));
        let start = Instant::now();

        press(&mut mapper, HOME);
        mapper.poll(start);
        mapper.on_status(Some(&status(RunState::Run)));
        assert_eq!(mapper.poll(ms(start, 500)), None);
        assert_eq!(mapper.state().mode, ControlMode::Homing);
    }

    #[test]
    fn held_stick_keeps_offering_its_jog() {
        let mut mapper = ready_mapper();
        let start = Instant::now();
        mapper.handle_event(&LogicalEvent::axis(0, 1.0));

        let jogs = (0..5u64)
            .filter_map(|tick| mapper.poll(ms(start, tick * 10)))
            .filter(|intent| matches!(intent, Intent::Jog { vector, .. } if vector.x == 1.0))
            .count();
        assert_eq!(jogs, 5);
    }

    #[test]
    fn adverse_state_between_snapshots_still_stops() {
        let mut mapper = ready_mapper();
        let start = Instant::now();
        mapper.handle_event(&LogicalEvent::axis(0, 0.9));
        assert!(matches!(mapper.poll(start), Some(Intent::Jog { .. })));

        // Door came and went; only the Idle snapshot is observed
        let mut idle = status(RunState::Idle);
        idle.adverse_entries = 1;
        assert_eq!(mapper.on_status(Some(&idle)), Some(Intent::StopAll));
        assert_eq!(mapper.state().mode, ControlMode::Idle);

        // Same count again is not a new entry
        assert_eq!(mapper.on_status(Some(&idle)), None);
    }

    #[test]
    fn feed_override_is_clamped() {
        let mut mapper = ready_mapper();
        let start = Instant::now();
        for i in 0..15u64 {
            press(&mut mapper, FEED_UP);
            mapper.poll(ms(start, i * 10));
            release(&mut mapper, FEED_UP);
        }
        assert_eq!(mapper.state().feed_override_percent, 200);
        press(&mut mapper, FEED_UP);
        assert_eq!(mapper.poll(ms(start, 200)), None);

        for i in 0..30u64 {
            press(&mut mapper, FEED_DOWN);
            mapper.poll(ms(start, 300 + i * 10));
            release(&mut mapper, FEED_DOWN);
        }
        assert_eq!(mapper.state().feed_override_percent, 10);
    }

    #[test]
    fn lower_priority_edge_fires_next_cycle() {
        let mut mapper = ready_mapper();
        let start = Instant::now();
        press(&mut mapper, FEED_UP);
        press(&mut mapper, STOP);

        assert_eq!(mapper.poll(start), Some(Intent::StopAll));
        assert_eq!(
            mapper.poll(ms(start, 10)),
            Some(Intent::SetFeedOverride { percent: 110 })
        );
        assert_eq!(mapper.poll(ms(start, 20)), None);
    }

    #[test]
    fn disabled_axis_never_moves() {
        let mut mapper = ready_mapper();
        let start = Instant::now();
        press(&mut mapper, TOGGLE_Z);
        let Some(Intent::SelectAxis { axes }) = mapper.poll(start) else {
            panic!("expected axis selection");
        };
        assert!(!axes.contains(MachineAxis::Z));

        mapper.handle_event(&LogicalEvent::axis(4, -1.0));
        assert_eq!(mapper.poll(ms(start, 10)), None);
        assert!(mapper.state().jog_vector.is_zero());
    }

    #[test]
    fn step_while_jogging_releases_jog_first() {
        let mut mapper = ready_mapper();
        let start = Instant::now();
        mapper.handle_event(&LogicalEvent::axis(0, 0.7));
        assert!(matches!(mapper.poll(start), Some(Intent::Jog { .. })));

        press(&mut mapper, STEP_X_PLUS);
        let release = mapper.poll(ms(start, 10));
        assert!(matches!(release, Some(Intent::Jog { vector, .. }) if vector.is_zero()));
        assert!(matches!(
            mapper.poll(ms(start, 20)),
            Some(Intent::Step { .. })
        ));
    }

    #[test]
    fn opposing_bindings_sum_and_invert() {
        let config = ControlConfig {
            axes: vec![
                AxisBinding {
                    code: 0,
                    axis: MachineAxis::X,
                    invert: false,
                },
                AxisBinding {
                    code: 3,
                    axis: MachineAxis::X,
                    invert: true,
                },
            ],
            buttons: vec![ButtonBinding {
                code: 0,
                function: ButtonFunction::Step {
                    axis: MachineAxis::X,
                    direction: Direction::Positive,
                },
            }],
            ..ControlConfig::default()
        };
        let mut mapper = ControlMapper::new(config);
        mapper.on_status(Some(&status(RunState::Idle)));
        mapper.handle_event(&LogicalEvent::axis(0, 0.9));
        mapper.handle_event(&LogicalEvent::axis(3, 0.4));

        let Some(Intent::Jog { vector, feed_rate }) = mapper.poll(Instant::now()) else {
            panic!("expected jog");
        };
        assert!((vector.x - 0.5).abs() < 1e-9);
        assert!((feed_rate - 500.0).abs() < 1e-9);
    }
}
