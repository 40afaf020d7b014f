//! Commands understood by the controller and their ASCII wire form.

use crate::error::{StageError, StageResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;

/// Stage axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    /// Valid speed/acceleration values in device units.
    ///
    /// The focus drive stalls below 4, so Z has a raised floor.
    pub fn setting_range(&self) -> RangeInclusive<u8> {
        match self {
            Axis::X | Axis::Y => 0..=100,
            Axis::Z => 4..=100,
        }
    }

    fn letter(&self) -> char {
        match self {
            Axis::X => 'X',
            Axis::Y => 'Y',
            Axis::Z => 'Z',
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// Stage position in device length units (one step is about one micrometre).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: i64,
    pub y: i64,
    pub z: i64,
}

impl Position {
    /// Create a position from its three coordinates.
    pub const fn new(x: i64, y: i64, z: i64) -> Self {
        Self { x, y, z }
    }

    /// Coordinate along one axis.
    pub fn axis(&self, axis: Axis) -> i64 {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
        }
    }

    /// Position shifted by a relative move, or `None` if a coordinate overflows.
    pub fn checked_offset(&self, dx: i64, dy: i64, dz: i64) -> Option<Self> {
        Some(Self::new(
            self.x.checked_add(dx)?,
            self.y.checked_add(dy)?,
            self.z.checked_add(dz)?,
        ))
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// One request to the controller. Constructed per call and consumed by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    MoveAbsolute { x: i64, y: i64, z: Option<i64> },
    MoveRelative { dx: i64, dy: i64 },
    MoveRelativeZ { dz: i64 },
    Home,
    SetHome,
    IndexStage,
    EmergencyStop,
    StopMovement,
    SetSpeed { axis: Axis, value: u8 },
    SetAcceleration { axis: Axis, value: u8 },
    SetJoystick { enabled: bool },
    QueryPosition,
    QueryAxis(Axis),
    QueryBusy,
    SetAxisDirection { axis: Axis, dir: i8 },
    QuerySpeed(Axis),
    QueryAcceleration(Axis),
    SetSCurve(u8),
    SetCompatibilityMode(bool),
    QuerySerialNumber,
}

impl Command {
    /// Wire text without the terminator.
    pub fn encode(&self) -> String {
        match self {
            Command::MoveAbsolute { x, y, z: Some(z) } => format!("G,{x},{y},{z}"),
            Command::MoveAbsolute { x, y, z: None } => format!("G,{x},{y}"),
            Command::MoveRelative { dx, dy } => format!("GR,{dx},{dy}"),
            Command::MoveRelativeZ { dz } if *dz >= 0 => format!("U,{dz}"),
            Command::MoveRelativeZ { dz } => format!("D,{}", dz.unsigned_abs()),
            Command::Home => "M".to_string(),
            Command::SetHome => "Z".to_string(),
            Command::IndexStage => "SIS".to_string(),
            Command::EmergencyStop => "K".to_string(),
            Command::StopMovement => "I".to_string(),
            Command::SetSpeed { axis, value } => format!("{},{value}", speed_mnemonic(*axis)),
            Command::SetAcceleration { axis, value } => {
                format!("{},{value}", acceleration_mnemonic(*axis))
            }
            Command::SetJoystick { enabled: true } => "J".to_string(),
            Command::SetJoystick { enabled: false } => "H".to_string(),
            Command::QueryPosition => "P".to_string(),
            Command::QueryAxis(axis) => format!("P{}", axis.letter()),
            Command::QueryBusy => "$".to_string(),
            Command::SetAxisDirection { axis, dir } => format!("{}D,{dir}", axis.letter()),
            Command::QuerySpeed(axis) => speed_mnemonic(*axis).to_string(),
            Command::QueryAcceleration(axis) => acceleration_mnemonic(*axis).to_string(),
            Command::SetSCurve(value) => format!("SCS,{value}"),
            Command::SetCompatibilityMode(on) => format!("COMP,{}", u8::from(*on)),
            Command::QuerySerialNumber => "SERIAL".to_string(),
        }
    }

    /// Accepted immediately by the controller but acknowledged only on completion.
    pub fn is_motion(&self) -> bool {
        matches!(
            self,
            Command::MoveAbsolute { .. }
                | Command::MoveRelative { .. }
                | Command::MoveRelativeZ { .. }
                | Command::Home
                | Command::IndexStage
        )
    }

    /// Client-side range checks. Runs before any byte reaches the wire.
    pub fn validate(&self) -> StageResult<()> {
        match self {
            Command::SetSpeed { axis, value } => check_setting("speed", *axis, *value),
            Command::SetAcceleration { axis, value } => {
                check_setting("acceleration", *axis, *value)
            }
            Command::SetSCurve(value) if *value > 100 => Err(StageError::validation(format!(
                "s-curve {value} outside [0, 100]"
            ))),
            Command::SetAxisDirection { axis, dir } if *dir != 1 && *dir != -1 => Err(
                StageError::validation(format!("direction {dir} for axis {axis} must be 1 or -1")),
            ),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

fn speed_mnemonic(axis: Axis) -> &'static str {
    match axis {
        Axis::X | Axis::Y => "SMS",
        Axis::Z => "SMZ",
    }
}

fn acceleration_mnemonic(axis: Axis) -> &'static str {
    match axis {
        Axis::X | Axis::Y => "SAS",
        Axis::Z => "SAZ",
    }
}

fn check_setting(what: &str, axis: Axis, value: u8) -> StageResult<()> {
    let range = axis.setting_range();
    if range.contains(&value) {
        Ok(())
    } else {
        Err(StageError::validation(format!(
            "{what} {value} for axis {axis} outside [{}, {}]",
            range.start(),
            range.end()
        )))
    }
}
