//! Travel envelope and hard limits that keep bad input from reaching the
//! hardware or allocating without bound.

use crate::error::{StageError, StageResult};
use crate::protocol::{Axis, Position};
use serde::{Deserialize, Serialize};

/// Maximum number of anchors a single grid plan may contain.
pub const MAX_GRID_POINTS: usize = 100_000;

/// Closed range of legal coordinates on one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisRange {
    pub min: i64,
    pub max: i64,
}

impl AxisRange {
    /// Range from `min` to `max`, both inclusive.
    pub const fn new(min: i64, max: i64) -> Self {
        Self { min, max }
    }

    /// True when `value` lies inside the range.
    pub fn contains(&self, value: i64) -> bool {
        (self.min..=self.max).contains(&value)
    }
}

/// Per-axis travel envelope in device units.
///
/// Defaults cover the largest stage insert in use (288 mm by 80 mm) with
/// margin on both sides of the origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TravelLimits {
    pub x: AxisRange,
    pub y: AxisRange,
    pub z: AxisRange,
}

impl Default for TravelLimits {
    fn default() -> Self {
        Self {
            x: AxisRange::new(-300_000, 300_000),
            y: AxisRange::new(-100_000, 100_000),
            z: AxisRange::new(-50_000, 50_000),
        }
    }
}

impl TravelLimits {
    /// Range of one axis.
    pub fn range(&self, axis: Axis) -> AxisRange {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
        }
    }

    /// First axis whose coordinate lies outside the envelope.
    pub fn violation(&self, position: &Position) -> Option<Axis> {
        [Axis::X, Axis::Y, Axis::Z]
            .into_iter()
            .find(|&axis| !self.range(axis).contains(position.axis(axis)))
    }

    /// Reject a target outside the envelope.
    pub fn check(&self, position: &Position) -> StageResult<()> {
        match self.violation(position) {
            None => Ok(()),
            Some(axis) => {
                let range = self.range(axis);
                Err(StageError::validation(format!(
                    "target {position} outside travel envelope: {axis} must lie in [{}, {}]",
                    range.min, range.max
                )))
            }
        }
    }

    /// Envelope is non-empty on every axis.
    pub fn is_well_formed(&self) -> bool {
        [self.x, self.y, self.z].iter().all(|r| r.min < r.max)
    }
}

/// Validate a requested grid size before allocating it.
pub fn validate_grid_size(columns: u64, rows: u64) -> StageResult<usize> {
    let total = columns
        .checked_mul(rows)
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| StageError::validation("grid point count overflows"))?;
    if total > MAX_GRID_POINTS {
        return Err(StageError::validation(format!(
            "grid of {columns}x{rows} = {total} points exceeds the limit of {MAX_GRID_POINTS}"
        )));
    }
    Ok(total)
}
