//! Back-end for TMCM stepper-motor controllers (TMCM351, TMCM6110).
//!
//! Every axis parameter the instrument uses is exposed as a variable;
//! physical-unit variables have a `:raw` companion holding the value as
//! the controller reports it, and the physical one is derived from the
//! raw one. When a divisor or the microstep resolution changes, every
//! physical value of the affected axis is re-derived.
//!
//! Motion is single-axis per controller. End-of-motion is detected from
//! three independent conditions, each gated on variable timestamps
//! later than the MoveTo (or Stop) acknowledgement so stale reads are
//! never acted upon.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use beamctl_common::error::DeviceError;

use crate::backend::{BackendIo, DeviceProcedure};
use crate::conversion::AxisConverter;
use crate::message::{BusyKind, DeviceStatus};
use crate::tmcl::{self, axis_param, instruction};
use crate::variable::{VarSpec, VarValue};
use crate::varname::VarName;

/// Static description of a controller model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrinamicModel {
    pub name: &'static str,
    pub axes: u8,
    /// Top RMS current of the driver stage [A].
    pub top_rms_current: f64,
    /// Largest valid microstep resolution exponent.
    pub max_microsteps: u32,
    /// Module clock [Hz].
    pub clock_frequency: f64,
    /// Size of one full step [mm].
    pub full_step_size: f64,
}

/// 3-axis controller, 2.8 A drivers.
pub const TMCM351: TrinamicModel = TrinamicModel {
    name: "tmcm351",
    axes: 3,
    top_rms_current: 2.8,
    max_microsteps: 6,
    clock_frequency: 16_000_000.0,
    full_step_size: 1.0 / 200.0,
};

/// 6-axis controller, 1.1 A drivers.
pub const TMCM6110: TrinamicModel = TrinamicModel {
    name: "tmcm6110",
    axes: 6,
    top_rms_current: 1.1,
    max_microsteps: 8,
    clock_frequency: 16_000_000.0,
    full_step_size: 1.0 / 200.0,
};

/// Which conversion a variable family needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Converted {
    No,
    Position,
    Speed,
    Acceleration,
    Current,
}

/// (base name, urgent, auto-query interval, conversion family)
const AXIS_VARIABLES: &[(&str, bool, Option<Duration>, Converted)] = &[
    ("targetpositionreached", false, None, Converted::No),
    ("targetposition", false, None, Converted::Position),
    ("actualposition", false, None, Converted::Position),
    ("targetspeed", false, None, Converted::Speed),
    ("actualspeed", false, None, Converted::Speed),
    (
        "rightswitchstatus",
        false,
        Some(Duration::from_secs(1)),
        Converted::No,
    ),
    (
        "leftswitchstatus",
        false,
        Some(Duration::from_secs(1)),
        Converted::No,
    ),
    ("actualacceleration", false, None, Converted::Acceleration),
    ("load", false, None, Converted::No),
    (
        "drivererror",
        false,
        Some(Duration::from_secs(1)),
        Converted::No,
    ),
    ("rampmode", false, None, Converted::No),
    ("pulsedivisor", true, None, Converted::No),
    ("rampdivisor", true, None, Converted::No),
    ("microstepresolution", true, None, Converted::No),
    ("maxcurrent", false, None, Converted::Current),
    ("standbycurrent", false, None, Converted::Current),
    ("rightswitchenable", false, None, Converted::No),
    ("leftswitchenable", false, None, Converted::No),
    ("freewheelingdelay", false, None, Converted::No),
    ("maxspeed", false, None, Converted::Speed),
    ("maxacceleration", false, None, Converted::Acceleration),
];

/// Per-axis variables maintained by the back-end itself, never queried
/// from the controller.
const LOCAL_AXIS_VARIABLES: &[&str] = &[
    "softleft",
    "softright",
    "moving",
    "movestartposition",
    "lastmovewassuccessful",
];

/// Variables polled at the motion rate while an axis is moving.
const MOTION_POLL_VARIABLES: &[&str] = &[
    "actualspeed",
    "actualposition",
    "targetpositionreached",
    "leftswitchstatus",
    "rightswitchstatus",
    "load",
    "targetspeed",
    "rampmode",
    "actualacceleration",
];

fn conversion_of(base: &str) -> Converted {
    AXIS_VARIABLES
        .iter()
        .find(|(name, ..)| *name == base)
        .map_or(Converted::No, |(_, _, _, conv)| *conv)
}

/// The variable actually queried for a base name: the raw companion for
/// converted families, the variable itself otherwise.
fn queried_name(base: &str, axis: u8) -> VarName {
    let name = VarName::per_axis(base, axis);
    if conversion_of(base) == Converted::No {
        name
    } else {
        name.raw()
    }
}

/// Which way a motion is headed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Left,
    Right,
}

/// Lifetime record of one motion, created when the move command is
/// accepted and destroyed when a stop condition fires.
#[derive(Debug)]
struct MotionRecord {
    direction: Direction,
    /// Raw target captured from the controller after the MoveTo ack.
    target_raw: Option<i32>,
    cmd_enqueued_at: Instant,
    cmd_ack_at: Option<Instant>,
    stop_enqueued_at: Option<Instant>,
    stop_ack_at: Option<Instant>,
}

/// Initial per-axis state read from the position file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisSeed {
    pub position: f64,
    pub soft_left: f64,
    pub soft_right: f64,
}

impl Default for AxisSeed {
    fn default() -> Self {
        Self {
            position: 0.0,
            soft_left: 0.0,
            soft_right: 0.0,
        }
    }
}

/// Parse a motor position file: one `idx: position (left, right)` line
/// per axis.
pub fn read_position_file(path: &Path, naxes: u8) -> Result<Vec<AxisSeed>, DeviceError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| DeviceError::Device(format!("cannot read {}: {e}", path.display())))?;
    let re = regex::Regex::new(
        r"^\s*(?P<axis>\d+):\s*(?P<position>[+-]?\d+\.\d+)\s+\((?P<softleft>[+-]?\d+\.\d+)\s*,\s*(?P<softright>[+-]?\d+\.\d+)\s*\)\s*$",
    )
    .expect("the position file pattern is valid");
    let mut seeds = vec![AxisSeed::default(); naxes as usize];
    let mut seen = 0u8;
    for (lineno, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let Some(caps) = re.captures(line) else {
            tracing::warn!(
                file = %path.display(),
                line = lineno + 1,
                "cannot interpret motor position file line"
            );
            continue;
        };
        let axis: usize = caps["axis"].parse().unwrap_or(usize::MAX);
        if axis >= naxes as usize {
            continue;
        }
        seeds[axis] = AxisSeed {
            position: caps["position"].parse().unwrap_or(0.0),
            soft_left: caps["softleft"].parse().unwrap_or(0.0),
            soft_right: caps["softright"].parse().unwrap_or(0.0),
        };
        seen += 1;
    }
    if seen != naxes {
        return Err(DeviceError::Device(format!(
            "motor position file {} describes {seen} axes instead of {naxes}",
            path.display()
        )));
    }
    Ok(seeds)
}

/// Write a motor position file from `(position, left, right)` triples.
pub fn write_position_file(
    path: &Path,
    entries: &[(f64, f64, f64)],
) -> Result<(), DeviceError> {
    let mut content = String::new();
    for (axis, (position, left, right)) in entries.iter().enumerate() {
        content.push_str(&format!("{axis}: {position:.16} ({left:.16}, {right:.16})\n"));
    }
    std::fs::write(path, content)
        .map_err(|e| DeviceError::Device(format!("cannot write {}: {e}", path.display())))
}

/// TMCM controller back-end.
pub struct TrinamicBackend {
    model: TrinamicModel,
    converters: Vec<AxisConverter>,
    motions: BTreeMap<u8, MotionRecord>,
    position_file: PathBuf,
    seeds: Vec<AxisSeed>,
    motion_poll: Duration,
}

impl TrinamicBackend {
    /// Create the back-end, seeding soft limits and last known
    /// positions from the position file. A missing file starts all
    /// axes at zero with zero-width limits.
    pub fn new(model: TrinamicModel, position_file: impl Into<PathBuf>) -> Result<Self, DeviceError> {
        let position_file = position_file.into();
        let seeds = if position_file.exists() {
            read_position_file(&position_file, model.axes)?
        } else {
            tracing::warn!(
                file = %position_file.display(),
                "motor position file missing, starting from zero"
            );
            vec![AxisSeed::default(); model.axes as usize]
        };
        Ok(Self {
            model,
            converters: (0..model.axes)
                .map(|_| {
                    AxisConverter::new(
                        model.top_rms_current,
                        model.full_step_size,
                        model.clock_frequency,
                    )
                })
                .collect(),
            motions: BTreeMap::new(),
            position_file,
            seeds,
            motion_poll: Duration::from_millis(100),
        })
    }

    fn check_axis(&self, axis: i64) -> Result<u8, DeviceError> {
        if (0..i64::from(self.model.axes)).contains(&axis) {
            Ok(axis as u8)
        } else {
            Err(DeviceError::Device(format!("invalid motor index: {axis}")))
        }
    }

    fn gap(&self, io: &mut BackendIo, parameter: u8, axis: u8) -> Result<(), DeviceError> {
        io.send_paired(tmcl::pack(instruction::GET_AXIS_PARAMETER, parameter, axis, 0).to_vec())
    }

    fn sap(
        &self,
        io: &mut BackendIo,
        parameter: u8,
        axis: u8,
        value: i32,
    ) -> Result<(), DeviceError> {
        io.send_paired(tmcl::pack(instruction::SET_AXIS_PARAMETER, parameter, axis, value).to_vec())
    }

    fn auxstatus_of(&self, extra: Option<u8>) -> String {
        let mut axes: Vec<u8> = self.motions.keys().copied().collect();
        if let Some(axis) = extra {
            if !axes.contains(&axis) {
                axes.push(axis);
            }
        }
        axes.sort_unstable();
        axes.iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn set_motion_status(&self, io: &mut BackendIo) {
        if self.motions.is_empty() {
            io.set_status(DeviceStatus::Idle);
        } else {
            io.set_status(DeviceStatus::Busy(BusyKind::Moving));
        }
        io.set_auxstatus(self.auxstatus_of(None));
    }

    /// Re-derive every physical value of an axis from its cached raw
    /// counterpart (after a divisor/microstep change).
    fn reconvert_axis(&self, io: &mut BackendIo, axis: u8) {
        for (base, _, _, conv) in AXIS_VARIABLES {
            if *conv == Converted::No {
                continue;
            }
            let raw_name = VarName::per_axis(*base, axis).raw();
            let Some(raw) = io.i64_of(&raw_name) else {
                continue;
            };
            self.update_physical(io, base, axis, raw as i32);
        }
    }

    /// Store a raw reading and its derived physical value.
    fn update_raw_and_physical(&self, io: &mut BackendIo, base: &str, axis: u8, raw: i32) {
        io.update(&VarName::per_axis(base, axis).raw(), i64::from(raw));
        self.update_physical(io, base, axis, raw);
    }

    fn update_physical(&self, io: &mut BackendIo, base: &str, axis: u8, raw: i32) {
        let conv = &self.converters[axis as usize];
        let phys = match conversion_of(base) {
            Converted::Position => conv.position_to_phys(raw),
            Converted::Speed => conv.speed_to_phys(raw),
            Converted::Acceleration => conv.accel_to_phys(raw),
            Converted::Current => conv.current_to_phys(raw),
            Converted::No => return,
        };
        io.update(&VarName::per_axis(base, axis), phys);
    }

    fn persist_positions(&self, io: &BackendIo) {
        let mut entries = Vec::with_capacity(self.model.axes as usize);
        for axis in 0..self.model.axes {
            let position = io
                .f64_of(&VarName::per_axis("actualposition", axis))
                .unwrap_or(self.seeds[axis as usize].position);
            let left = io
                .f64_of(&VarName::per_axis("softleft", axis))
                .unwrap_or(self.seeds[axis as usize].soft_left);
            let right = io
                .f64_of(&VarName::per_axis("softright", axis))
                .unwrap_or(self.seeds[axis as usize].soft_right);
            entries.push((position, left, right));
        }
        if let Err(error) = write_position_file(&self.position_file, &entries) {
            tracing::warn!(device = io.device_name(), %error, "cannot persist motor positions");
        }
    }

    fn start_moving(
        &mut self,
        io: &mut BackendIo,
        command: &str,
        axis: u8,
        position: f64,
        relative: bool,
    ) -> Result<(), DeviceError> {
        if !self.motions.is_empty() {
            io.command_failed(
                command,
                format!(
                    "cannot move motor #{axis}: another motion is in progress on this controller"
                ),
            );
            return Ok(());
        }
        let actual_name = VarName::per_axis("actualposition", axis);
        let Some(actual) = io.f64_of(&actual_name) else {
            io.command_failed(command, format!("position of motor #{axis} not yet known"));
            return Ok(());
        };
        // Zero moves complete instantly with a synthetic event trace
        // and no wire traffic.
        if (relative && position == 0.0) || (!relative && position == actual) {
            io.set_status(DeviceStatus::Busy(BusyKind::Moving));
            io.set_auxstatus(self.auxstatus_of(Some(axis)));
            io.update(&VarName::per_axis("movestartposition", axis), actual);
            io.update_forced(&VarName::per_axis("moving", axis), true);
            io.command_finished(command, format!("simulating zero-move of motor #{axis}"));
            io.update_forced(&VarName::per_axis("lastmovewassuccessful", axis), true);
            self.set_motion_status(io);
            io.update_forced(&VarName::per_axis("moving", axis), false);
            return Ok(());
        }
        let soft_left = io
            .f64_of(&VarName::per_axis("softleft", axis))
            .unwrap_or(self.seeds[axis as usize].soft_left);
        let soft_right = io
            .f64_of(&VarName::per_axis("softright", axis))
            .unwrap_or(self.seeds[axis as usize].soft_right);
        let target = if relative { actual + position } else { position };
        if target < soft_left || target > soft_right {
            io.command_failed(
                command,
                format!(
                    "cannot move motor #{axis}: target position ({target}) is outside the software limits ({soft_left}, {soft_right})"
                ),
            );
            return Ok(());
        }
        if actual < soft_left || actual > soft_right {
            io.command_failed(
                command,
                format!(
                    "cannot move motor #{axis}: actual position ({actual}) is outside the software limits ({soft_left}, {soft_right})"
                ),
            );
            return Ok(());
        }
        let direction = if target < actual {
            Direction::Left
        } else {
            Direction::Right
        };
        let raw = match self.converters[axis as usize].position_to_raw(position) {
            Ok(raw) => raw,
            Err(error) => {
                io.command_failed(command, error.to_string());
                return Ok(());
            }
        };
        // Motion-relevant variables are polled much faster while the
        // axis is in flight.
        for base in MOTION_POLL_VARIABLES {
            io.boost_query_interval(&queried_name(base, axis), self.motion_poll);
        }
        self.motions.insert(
            axis,
            MotionRecord {
                direction,
                target_raw: None,
                cmd_enqueued_at: Instant::now(),
                cmd_ack_at: None,
                stop_enqueued_at: None,
                stop_ack_at: None,
            },
        );
        io.send_paired(
            tmcl::pack(
                instruction::MOVE_TO,
                u8::from(relative),
                axis,
                raw,
            )
            .to_vec(),
        )?;
        // The target register is not polled by default; fetch it once
        // so stop condition #1 has a post-ack reading.
        self.gap(io, axis_param::TARGET_POSITION, axis)?;
        io.update(&VarName::per_axis("movestartposition", axis), actual);
        io.set_status(DeviceStatus::Busy(BusyKind::Moving));
        io.set_auxstatus(self.auxstatus_of(None));
        io.update_forced(&VarName::per_axis("moving", axis), true);
        io.command_finished(command, format!("starting motor #{axis}"));
        Ok(())
    }

    fn motion_ended(&mut self, io: &mut BackendIo, axis: u8, successful: bool) {
        for base in MOTION_POLL_VARIABLES {
            io.reset_query_interval(&queried_name(base, axis));
        }
        if let Some(record) = self.motions.remove(&axis) {
            tracing::debug!(
                device = io.device_name(),
                axis,
                successful,
                travel_time = ?record.cmd_enqueued_at.elapsed(),
                "motion ended"
            );
        }
        self.set_motion_status(io);
        io.update_forced(
            &VarName::per_axis("lastmovewassuccessful", axis),
            successful,
        );
        io.update_forced(&VarName::per_axis("moving", axis), false);
        self.persist_positions(io);
    }

    /// Run the stop conditions for a moving axis. Only variable values
    /// timestamped after the relevant acknowledgement participate.
    fn check_motion(&mut self, io: &mut BackendIo, axis: u8) {
        let Some(record) = self.motions.get_mut(&axis) else {
            return;
        };
        let Some(ack) = record.cmd_ack_at else {
            // The controller has not yet acknowledged the MoveTo;
            // assume the motor is (about to be) moving.
            return;
        };
        let target_name = VarName::per_axis("targetposition", axis).raw();
        if record.target_raw.is_none() {
            if let Some(var) = io.var(&target_name) {
                if var.fresh_since(ack) {
                    record.target_raw = var
                        .value()
                        .and_then(VarValue::as_i64)
                        .map(|v| v as i32);
                }
            }
        }
        let target_raw = record.target_raw;
        let direction = record.direction;
        let stop_ack = record.stop_enqueued_at.and(record.stop_ack_at);

        let actual = io.var(&VarName::per_axis("actualposition", axis).raw());
        let speed = io.var(&VarName::per_axis("actualspeed", axis).raw());
        let reached = io.var(&VarName::per_axis("targetpositionreached", axis));

        // #1: target reached.
        if let (Some(actual), Some(reached), Some(target)) = (actual, reached, target_raw) {
            if actual.fresh_since(ack)
                && reached.fresh_since(ack)
                && actual.value().and_then(VarValue::as_i64) == Some(i64::from(target))
                && reached.value().and_then(VarValue::as_bool) == Some(true)
            {
                self.motion_ended(io, axis, true);
                return;
            }
        }

        // #2: the direction-appropriate end switch was hit.
        let (switch_base, enable_base) = match direction {
            Direction::Left => ("leftswitchstatus", "leftswitchenable"),
            Direction::Right => ("rightswitchstatus", "rightswitchenable"),
        };
        let switch = io.var(&VarName::per_axis(switch_base, axis));
        let enabled = io
            .bool_of(&VarName::per_axis(enable_base, axis))
            .unwrap_or(false);
        if let (Some(switch), Some(speed)) = (switch, speed) {
            if speed.fresh_since(ack)
                && switch.fresh_since(ack)
                && switch.value().and_then(VarValue::as_bool) == Some(true)
                && enabled
            {
                self.motion_ended(io, axis, false);
                return;
            }
        }

        // #3: user stop acknowledged and the axis has come to rest.
        if let (Some(stop_ack), Some(speed)) = (stop_ack, io.var(&VarName::per_axis("actualspeed", axis).raw())) {
            if speed.fresh_since(stop_ack)
                && speed.value().and_then(VarValue::as_i64) == Some(0)
            {
                self.motion_ended(io, axis, false);
            }
        }
    }

    fn calibrate_position(&self, io: &mut BackendIo, axis: u8, position: f64) -> Result<(), DeviceError> {
        // Speed mode first: writing position registers in positioning
        // mode would start a motion.
        self.sap(io, axis_param::RAMP_MODE, axis, 2)?;
        let raw = self.converters[axis as usize].position_to_raw(position)?;
        self.sap(io, axis_param::ACTUAL_POSITION, axis, raw)?;
        self.sap(io, axis_param::TARGET_POSITION, axis, raw)?;
        self.gap(io, axis_param::ACTUAL_POSITION, axis)?;
        self.gap(io, axis_param::TARGET_POSITION, axis)?;
        Ok(())
    }
}

impl DeviceProcedure for TrinamicBackend {
    fn device_type(&self) -> &'static str {
        self.model.name
    }

    fn variables(&self) -> Vec<VarSpec> {
        let mut specs = vec![VarSpec::new(VarName::plain("firmwareversion"))];
        for axis in 0..self.model.axes {
            for (base, urgent, timeout, conv) in AXIS_VARIABLES {
                let physical = VarName::per_axis(*base, axis);
                if *conv == Converted::No {
                    let mut spec = VarSpec::new(physical);
                    spec.urgent = *urgent;
                    spec.timeout = *timeout;
                    specs.push(spec);
                } else {
                    // The raw companion carries the query properties;
                    // the physical variable is derived from it.
                    let raw = physical.raw();
                    let mut raw_spec = VarSpec::new(raw.clone());
                    raw_spec.urgent = *urgent;
                    raw_spec.timeout = *timeout;
                    specs.push(raw_spec);
                    specs.push(VarSpec::new(physical).depends_on(raw));
                }
            }
            for base in LOCAL_AXIS_VARIABLES {
                specs.push(VarSpec::new(VarName::per_axis(*base, axis)));
            }
        }
        specs
    }

    fn query(&mut self, io: &mut BackendIo, name: &VarName) -> Result<(), DeviceError> {
        // Derived variables are refreshed through their sources.
        if let Some(var) = io.var(name) {
            let deps = var.spec().depends_from.clone();
            if !deps.is_empty() {
                for dep in deps {
                    self.query(io, &dep)?;
                }
                return Ok(());
            }
        }
        if name.base() == "firmwareversion" {
            return io.send_paired(
                tmcl::pack(instruction::GET_FIRMWARE_VERSION, 1, 0, 0).to_vec(),
            );
        }
        let axis = name
            .axis()
            .ok_or_else(|| DeviceError::UnknownVariable(name.to_string()))?;
        match name.base() {
            "targetpositionreached" => self.gap(io, axis_param::TARGET_POSITION_REACHED, axis),
            "targetposition:raw" => self.gap(io, axis_param::TARGET_POSITION, axis),
            "actualposition:raw" => self.gap(io, axis_param::ACTUAL_POSITION, axis),
            "targetspeed:raw" => self.gap(io, axis_param::TARGET_SPEED, axis),
            "actualspeed:raw" => self.gap(io, axis_param::ACTUAL_SPEED, axis),
            "rightswitchstatus" => self.gap(io, axis_param::RIGHT_LIMIT_SWITCH_STATUS, axis),
            "leftswitchstatus" => self.gap(io, axis_param::LEFT_LIMIT_SWITCH_STATUS, axis),
            "actualacceleration:raw" => self.gap(io, axis_param::ACTUAL_ACCELERATION, axis),
            "load" => self.gap(io, axis_param::ACTUAL_LOAD_VALUE, axis),
            "drivererror" => self.gap(io, axis_param::DRIVER_ERROR_FLAGS, axis),
            "rampmode" => self.gap(io, axis_param::RAMP_MODE, axis),
            "pulsedivisor" => self.gap(io, axis_param::PULSE_DIVISOR, axis),
            "rampdivisor" => self.gap(io, axis_param::RAMP_DIVISOR, axis),
            "microstepresolution" => self.gap(io, axis_param::MICROSTEP_RESOLUTION, axis),
            "maxcurrent:raw" => self.gap(io, axis_param::ABSOLUTE_MAX_CURRENT, axis),
            "standbycurrent:raw" => self.gap(io, axis_param::STANDBY_CURRENT, axis),
            "rightswitchenable" => self.gap(io, axis_param::RIGHT_LIMIT_SWITCH_DISABLE, axis),
            "leftswitchenable" => self.gap(io, axis_param::LEFT_LIMIT_SWITCH_DISABLE, axis),
            "freewheelingdelay" => self.gap(io, axis_param::FREEWHEELING_DELAY, axis),
            "maxspeed:raw" => self.gap(io, axis_param::MAX_POSITIONING_SPEED, axis),
            "maxacceleration:raw" => self.gap(io, axis_param::MAX_ACCELERATION, axis),
            "softleft" => {
                if io.value(name).is_none() {
                    io.update(name, self.seeds[axis as usize].soft_left);
                }
                Ok(())
            }
            "softright" => {
                if io.value(name).is_none() {
                    io.update(name, self.seeds[axis as usize].soft_right);
                }
                Ok(())
            }
            "moving" => {
                if io.value(name).is_none() {
                    io.update(name, false);
                }
                Ok(())
            }
            "movestartposition" => {
                if io.value(name).is_none() {
                    io.update(name, VarValue::None);
                }
                Ok(())
            }
            "lastmovewassuccessful" => {
                if io.value(name).is_none() {
                    io.update(name, true);
                }
                Ok(())
            }
            other => Err(DeviceError::UnknownVariable(format!("{other}${axis}"))),
        }
    }

    fn set(
        &mut self,
        io: &mut BackendIo,
        name: &VarName,
        value: &VarValue,
    ) -> Result<(), DeviceError> {
        let axis = name
            .axis()
            .ok_or_else(|| DeviceError::UnknownVariable(name.to_string()))?;
        self.check_axis(i64::from(axis))?;
        let conv = &self.converters[axis as usize];
        let need_f64 = || {
            value
                .as_f64()
                .ok_or_else(|| DeviceError::Device(format!("{name} needs a numeric value")))
        };
        let need_i64 = || {
            value
                .as_i64()
                .ok_or_else(|| DeviceError::Device(format!("{name} needs an integer value")))
        };
        let need_bool = || {
            value
                .as_bool()
                .ok_or_else(|| DeviceError::Device(format!("{name} needs a boolean value")))
        };
        match name.base() {
            "pulsedivisor" => {
                let v = need_i64()?;
                if !(0..=13).contains(&v) {
                    return Err(DeviceError::OutOfRange(format!("pulse divisor {v}")));
                }
                self.sap(io, axis_param::PULSE_DIVISOR, axis, v as i32)?;
                self.gap(io, axis_param::PULSE_DIVISOR, axis)
            }
            "rampdivisor" => {
                let v = need_i64()?;
                if !(0..=13).contains(&v) {
                    return Err(DeviceError::OutOfRange(format!("ramp divisor {v}")));
                }
                self.sap(io, axis_param::RAMP_DIVISOR, axis, v as i32)?;
                self.gap(io, axis_param::RAMP_DIVISOR, axis)
            }
            "microstepresolution" => {
                let v = need_i64()?;
                if !(0..=i64::from(self.model.max_microsteps)).contains(&v) {
                    return Err(DeviceError::OutOfRange(format!(
                        "microstep resolution {v} (max {})",
                        self.model.max_microsteps
                    )));
                }
                self.sap(io, axis_param::MICROSTEP_RESOLUTION, axis, v as i32)?;
                self.gap(io, axis_param::MICROSTEP_RESOLUTION, axis)
            }
            "maxspeed" => {
                let raw = conv.speed_to_raw(need_f64()?)?;
                self.sap(io, axis_param::MAX_POSITIONING_SPEED, axis, raw)?;
                self.gap(io, axis_param::MAX_POSITIONING_SPEED, axis)
            }
            "maxacceleration" => {
                let raw = conv.accel_to_raw(need_f64()?)?;
                self.sap(io, axis_param::MAX_ACCELERATION, axis, raw)?;
                self.gap(io, axis_param::MAX_ACCELERATION, axis)
            }
            "maxcurrent" => {
                let raw = conv.current_to_raw(need_f64()?)?;
                self.sap(io, axis_param::ABSOLUTE_MAX_CURRENT, axis, raw)?;
                self.gap(io, axis_param::ABSOLUTE_MAX_CURRENT, axis)
            }
            "standbycurrent" => {
                let raw = conv.current_to_raw(need_f64()?)?;
                self.sap(io, axis_param::STANDBY_CURRENT, axis, raw)?;
                self.gap(io, axis_param::STANDBY_CURRENT, axis)
            }
            "leftswitchenable" => {
                let enable = need_bool()?;
                self.sap(
                    io,
                    axis_param::LEFT_LIMIT_SWITCH_DISABLE,
                    axis,
                    i32::from(!enable),
                )?;
                self.gap(io, axis_param::LEFT_LIMIT_SWITCH_DISABLE, axis)
            }
            "rightswitchenable" => {
                let enable = need_bool()?;
                self.sap(
                    io,
                    axis_param::RIGHT_LIMIT_SWITCH_DISABLE,
                    axis,
                    i32::from(!enable),
                )?;
                self.gap(io, axis_param::RIGHT_LIMIT_SWITCH_DISABLE, axis)
            }
            "freewheelingdelay" => {
                let seconds = need_f64()?;
                if !(0.0..=65.535).contains(&seconds) {
                    return Err(DeviceError::OutOfRange(format!(
                        "freewheeling delay {seconds} s"
                    )));
                }
                self.sap(
                    io,
                    axis_param::FREEWHEELING_DELAY,
                    axis,
                    (seconds * 1000.0) as i32,
                )?;
                self.gap(io, axis_param::FREEWHEELING_DELAY, axis)
            }
            "rampmode" => {
                let v = need_i64()?;
                self.sap(io, axis_param::RAMP_MODE, axis, v as i32)?;
                self.gap(io, axis_param::RAMP_MODE, axis)
            }
            "softleft" | "softright" => {
                io.update(name, need_f64()?);
                self.persist_positions(io);
                Ok(())
            }
            _ => Err(DeviceError::UnknownVariable(name.to_string())),
        }
    }

    fn execute(
        &mut self,
        io: &mut BackendIo,
        command: &str,
        args: &[VarValue],
    ) -> Result<(), DeviceError> {
        let arg_i64 = |idx: usize| -> Result<i64, DeviceError> {
            args.get(idx)
                .and_then(VarValue::as_i64)
                .ok_or_else(|| DeviceError::Device(format!("{command}: argument #{idx} must be an integer")))
        };
        let arg_f64 = |idx: usize| -> Result<f64, DeviceError> {
            args.get(idx)
                .and_then(VarValue::as_f64)
                .ok_or_else(|| DeviceError::Device(format!("{command}: argument #{idx} must be a number")))
        };
        match command {
            "moveto" | "moverel" => {
                let axis = match self.check_axis(arg_i64(0)?) {
                    Ok(axis) => axis,
                    Err(error) => {
                        io.command_failed(command, error.to_string());
                        return Ok(());
                    }
                };
                let position = arg_f64(1)?;
                self.start_moving(io, command, axis, position, command == "moverel")
            }
            "stop" => {
                let axis = match self.check_axis(arg_i64(0)?) {
                    Ok(axis) => axis,
                    Err(error) => {
                        io.command_failed(command, error.to_string());
                        return Ok(());
                    }
                };
                io.send_paired(tmcl::pack(instruction::STOP, 0, axis, 0).to_vec())?;
                // Stopping must always be accepted, even when the
                // internal motion bookkeeping is inconsistent.
                if let Some(record) = self.motions.get_mut(&axis) {
                    record.stop_enqueued_at = Some(Instant::now());
                }
                io.command_finished(command, format!("stopping motor #{axis}"));
                Ok(())
            }
            "setposition" => {
                let axis = match self.check_axis(arg_i64(0)?) {
                    Ok(axis) => axis,
                    Err(error) => {
                        io.command_failed(command, error.to_string());
                        return Ok(());
                    }
                };
                let position = arg_f64(1)?;
                self.calibrate_position(io, axis, position)?;
                io.command_finished(
                    command,
                    format!("position of motor #{axis} set to {position}"),
                );
                Ok(())
            }
            "setlimits" => {
                let axis = match self.check_axis(arg_i64(0)?) {
                    Ok(axis) => axis,
                    Err(error) => {
                        io.command_failed(command, error.to_string());
                        return Ok(());
                    }
                };
                let left = arg_f64(1)?;
                let right = arg_f64(2)?;
                if left > right {
                    io.command_failed(command, "left limit is larger than the right one");
                    return Ok(());
                }
                io.update(&VarName::per_axis("softleft", axis), left);
                io.update(&VarName::per_axis("softright", axis), right);
                self.persist_positions(io);
                io.command_finished(command, format!("set limits for motor #{axis}"));
                Ok(())
            }
            _ => {
                io.command_failed(command, "unknown command");
                Ok(())
            }
        }
    }

    fn interpret(
        &mut self,
        io: &mut BackendIo,
        frame: &[u8],
        sent: Option<&[u8]>,
    ) -> Result<(), DeviceError> {
        let sent = sent.ok_or_else(|| {
            DeviceError::Communication("unsolicited TMCL frame".to_string())
        })?;
        let reply = tmcl::unpack(frame, Some(sent))?;
        // Every valid frame answers the pending request; advance the
        // wire before status handling so an error reply cannot stall
        // the send FIFO.
        io.complete_pending_sent()?;
        if !reply.status.is_ok() {
            return Err(DeviceError::Device(format!(
                "TMCM controller error: {}",
                reply.status.message()
            )));
        }
        let mut touched_axis: Option<u8> = None;
        match sent[1] {
            instruction::GET_FIRMWARE_VERSION => {
                let value = reply.value as u32;
                io.update(
                    &VarName::plain("firmwareversion"),
                    format!(
                        "TMCM{}, firmware v{}.{}",
                        value / 0x10000,
                        (value % 0x10000) / 0x100,
                        value % 0x100
                    ),
                );
            }
            instruction::MOVE_TO => {
                let axis = sent[3];
                if let Some(record) = self.motions.get_mut(&axis) {
                    record.cmd_ack_at = Some(Instant::now());
                }
                touched_axis = Some(axis);
            }
            instruction::STOP => {
                let axis = sent[3];
                if let Some(record) = self.motions.get_mut(&axis) {
                    record.stop_ack_at = Some(Instant::now());
                }
                touched_axis = Some(axis);
            }
            instruction::GET_AXIS_PARAMETER => {
                let parameter = sent[2];
                let axis = sent[3];
                touched_axis = Some(axis);
                let v = reply.value;
                match parameter {
                    axis_param::TARGET_POSITION_REACHED => {
                        io.update(
                            &VarName::per_axis("targetpositionreached", axis),
                            v != 0,
                        );
                    }
                    axis_param::TARGET_POSITION => {
                        self.update_raw_and_physical(io, "targetposition", axis, v);
                    }
                    axis_param::ACTUAL_POSITION => {
                        self.update_raw_and_physical(io, "actualposition", axis, v);
                    }
                    axis_param::TARGET_SPEED => {
                        self.update_raw_and_physical(io, "targetspeed", axis, v);
                    }
                    axis_param::ACTUAL_SPEED => {
                        self.update_raw_and_physical(io, "actualspeed", axis, v);
                    }
                    axis_param::RIGHT_LIMIT_SWITCH_STATUS => {
                        io.update(&VarName::per_axis("rightswitchstatus", axis), v != 0);
                    }
                    axis_param::LEFT_LIMIT_SWITCH_STATUS => {
                        io.update(&VarName::per_axis("leftswitchstatus", axis), v != 0);
                    }
                    axis_param::ACTUAL_ACCELERATION => {
                        self.update_raw_and_physical(io, "actualacceleration", axis, v);
                    }
                    axis_param::ACTUAL_LOAD_VALUE => {
                        io.update(&VarName::per_axis("load", axis), i64::from(v));
                    }
                    axis_param::DRIVER_ERROR_FLAGS => {
                        if io.update(&VarName::per_axis("drivererror", axis), i64::from(v))
                            && v != 0
                        {
                            let flags = tmcl::DriverError::from_bits_truncate(v as u8);
                            tracing::warn!(
                                device = io.device_name(),
                                axis,
                                ?flags,
                                "driver error flags raised"
                            );
                        }
                    }
                    axis_param::RAMP_MODE => {
                        io.update(&VarName::per_axis("rampmode", axis), i64::from(v));
                    }
                    axis_param::PULSE_DIVISOR => {
                        io.update(&VarName::per_axis("pulsedivisor", axis), i64::from(v));
                        self.converters[axis as usize].pulse_divisor = v.max(0) as u32;
                        self.reconvert_axis(io, axis);
                    }
                    axis_param::RAMP_DIVISOR => {
                        io.update(&VarName::per_axis("rampdivisor", axis), i64::from(v));
                        self.converters[axis as usize].ramp_divisor = v.max(0) as u32;
                        self.reconvert_axis(io, axis);
                    }
                    axis_param::MICROSTEP_RESOLUTION => {
                        io.update(
                            &VarName::per_axis("microstepresolution", axis),
                            i64::from(v),
                        );
                        self.converters[axis as usize].microstep_resolution = v.max(0) as u32;
                        self.reconvert_axis(io, axis);
                    }
                    axis_param::ABSOLUTE_MAX_CURRENT => {
                        self.update_raw_and_physical(io, "maxcurrent", axis, v);
                    }
                    axis_param::STANDBY_CURRENT => {
                        self.update_raw_and_physical(io, "standbycurrent", axis, v);
                    }
                    axis_param::RIGHT_LIMIT_SWITCH_DISABLE => {
                        io.update(&VarName::per_axis("rightswitchenable", axis), v == 0);
                    }
                    axis_param::LEFT_LIMIT_SWITCH_DISABLE => {
                        io.update(&VarName::per_axis("leftswitchenable", axis), v == 0);
                    }
                    axis_param::FREEWHEELING_DELAY => {
                        io.update(
                            &VarName::per_axis("freewheelingdelay", axis),
                            f64::from(v) / 1000.0,
                        );
                    }
                    axis_param::MAX_POSITIONING_SPEED => {
                        self.update_raw_and_physical(io, "maxspeed", axis, v);
                    }
                    axis_param::MAX_ACCELERATION => {
                        self.update_raw_and_physical(io, "maxacceleration", axis, v);
                    }
                    other => {
                        return Err(DeviceError::Device(format!(
                            "unexpected axis parameter {other} in TMCM reply"
                        )));
                    }
                }
            }
            instruction::SET_AXIS_PARAMETER => {}
            other => {
                return Err(DeviceError::Device(format!(
                    "TMCL instruction {other} not handled"
                )));
            }
        }
        if let Some(axis) = touched_axis {
            if self.motions.contains_key(&axis) {
                self.check_motion(io, axis);
            }
        }
        Ok(())
    }

    fn split_frames(&self, buffer: &mut Vec<u8>) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        while buffer.len() >= tmcl::FRAME_LEN {
            let rest = buffer.split_off(tmcl::FRAME_LEN);
            frames.push(std::mem::replace(buffer, rest));
        }
        frames
    }

    fn on_variables_ready(&mut self, io: &mut BackendIo) -> Result<(), DeviceError> {
        for axis in 0..self.model.axes {
            let seed = self.seeds[axis as usize];
            if io.value(&VarName::per_axis("softleft", axis)).is_none() {
                io.update(&VarName::per_axis("softleft", axis), seed.soft_left);
            }
            if io.value(&VarName::per_axis("softright", axis)).is_none() {
                io.update(&VarName::per_axis("softright", axis), seed.soft_right);
            }
            io.update(&VarName::per_axis("moving", axis), false);
            io.update(&VarName::per_axis("lastmovewassuccessful", axis), true);
            // The controller forgets its position over a power cycle;
            // the file carries the last known value.
            self.calibrate_position(io, axis, seed.position)?;
        }
        io.set_status(DeviceStatus::Idle);
        io.set_auxstatus("");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_file_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tmcm351.motorpos");
        let entries = [
            (0.0, 0.0, 0.0),
            (12.1435937500000009, -18.0, 17.0),
            (34.5499218750000026, 0.0, 73.0),
        ];
        write_position_file(&path, &entries).unwrap();
        let seeds = read_position_file(&path, 3).unwrap();
        for (seed, (pos, left, right)) in seeds.iter().zip(entries.iter()) {
            assert!((seed.position - pos).abs() < 1e-12);
            assert!((seed.soft_left - left).abs() < 1e-12);
            assert!((seed.soft_right - right).abs() < 1e-12);
        }
    }

    #[test]
    fn position_file_with_wrong_axis_count_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tmcm6110.motorpos");
        write_position_file(&path, &[(0.0, 0.0, 0.0)]).unwrap();
        assert!(read_position_file(&path, 6).is_err());
    }

    #[test]
    fn variable_table_fans_out_per_axis_with_raw_companions() {
        let dir = tempfile::tempdir().unwrap();
        let backend =
            TrinamicBackend::new(TMCM351, dir.path().join("missing.motorpos")).unwrap();
        let specs = backend.variables();
        let find = |name: &str| -> &VarSpec {
            specs
                .iter()
                .find(|s| s.name.to_string() == name)
                .unwrap_or_else(|| panic!("missing variable {name}"))
        };
        // One firmware version per controller, per-axis everything else.
        assert_eq!(
            specs.iter().filter(|s| s.name.base() == "firmwareversion").count(),
            1
        );
        for axis in 0..3 {
            let phys = find(&format!("actualposition${axis}"));
            assert_eq!(
                phys.depends_from,
                vec![VarName::per_axis("actualposition", axis).raw()]
            );
            let raw = find(&format!("actualposition:raw${axis}"));
            assert!(raw.depends_from.is_empty());
        }
        // Divisors are urgent: conversions need them before anything
        // physical makes sense.
        assert!(find("pulsedivisor$0").urgent);
        assert!(find("rampdivisor$2").urgent);
        assert!(find("microstepresolution$1").urgent);
        assert!(!find("load$0").urgent);
    }

    #[test]
    fn frames_are_cut_on_nine_byte_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let backend =
            TrinamicBackend::new(TMCM351, dir.path().join("missing.motorpos")).unwrap();
        let a = tmcl::pack_reply(100, instruction::GET_AXIS_PARAMETER, 1);
        let b = tmcl::pack_reply(100, instruction::GET_AXIS_PARAMETER, 2);
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&a);
        buffer.extend_from_slice(&b[..4]);
        let frames = backend.split_frames(&mut buffer);
        assert_eq!(frames, vec![a.to_vec()]);
        assert_eq!(buffer, b[..4].to_vec());
        buffer.extend_from_slice(&b[4..]);
        let frames = backend.split_frames(&mut buffer);
        assert_eq!(frames, vec![b.to_vec()]);
        assert!(buffer.is_empty());
    }
}
