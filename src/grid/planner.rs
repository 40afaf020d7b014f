//! Boustrophedon tile planner
//!
//! Covers a rectangle with overlapping camera tiles in a snake pattern. The
//! stage may not move diagonally, so consecutive anchors always differ along
//! exactly one axis, by exactly one step.
//!
//! The walker runs legs along one axis (the *leg* axis) and shifts one lane
//! sideways at each leg end (the *lateral* step):
//!
//! | Course    | Legs along | First leg | Lateral |
//! |-----------|------------|-----------|---------|
//! | `VRight`  | y          | +y        | +x      |
//! | `VLeft`   | y          | +y        | -x      |
//! | `HRight`  | x          | +x        | +y      |
//! | `HLeft`   | x          | -x        | +y      |

use super::geometry::{bounding_rect, translate, validate_path, GridPoint, Rect};
use crate::error::{StageError, StageResult};
use crate::limits::validate_grid_size;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, trace};

/// Sweep orientation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Course {
    HRight,
    HLeft,
    VRight,
    VLeft,
}

impl Course {
    fn vertical(self) -> bool {
        matches!(self, Course::VRight | Course::VLeft)
    }

    /// +1 when the course heads toward larger x.
    fn x_sign(self) -> i64 {
        match self {
            Course::HRight | Course::VRight => 1,
            Course::HLeft | Course::VLeft => -1,
        }
    }
}

impl fmt::Display for Course {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Course::HRight => "H_RIGHT",
            Course::HLeft => "H_LEFT",
            Course::VRight => "V_RIGHT",
            Course::VLeft => "V_LEFT",
        };
        f.write_str(name)
    }
}

impl FromStr for Course {
    type Err = StageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "H_RIGHT" => Ok(Course::HRight),
            "H_LEFT" => Ok(Course::HLeft),
            "V_RIGHT" => Ok(Course::VRight),
            "V_LEFT" => Ok(Course::VLeft),
            _ => Err(StageError::validation(format!(
                "unknown course '{s}' (expected H_RIGHT, H_LEFT, V_RIGHT or V_LEFT)"
            ))),
        }
    }
}

/// How far the grid reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GridExtent {
    /// Cover up to this point. Rows always grow toward +y; columns grow in
    /// the course's x direction.
    FinalPoint(GridPoint),
    /// Explicit tile counts.
    Matrix { columns: u32, rows: u32 },
}

/// Everything needed to plan one grid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridDefinition {
    pub start: GridPoint,
    /// Tile width and height in device units.
    pub tile_size: (i64, i64),
    /// Fraction of each tile dimension not shared with the neighbour, in (0, 1].
    pub non_overlap: (f64, f64),
    pub course: Course,
    pub extent: GridExtent,
}

impl GridDefinition {
    /// Step between neighbouring anchors, validated.
    pub fn steps(&self) -> StageResult<(i64, i64)> {
        let (w, h) = self.tile_size;
        if w <= 0 || h <= 0 {
            return Err(StageError::validation(format!(
                "tile size ({w}, {h}) must be positive"
            )));
        }
        let (fx, fy) = self.non_overlap;
        for f in [fx, fy] {
            if !(f > 0.0 && f <= 1.0) {
                return Err(StageError::validation(format!(
                    "non-overlap fraction {f} outside (0, 1]"
                )));
            }
        }
        let step = ((fx * w as f64).round() as i64, (fy * h as f64).round() as i64);
        if step.0 == 0 || step.1 == 0 {
            return Err(StageError::validation(format!(
                "tile step ({}, {}) rounds to zero",
                step.0, step.1
            )));
        }
        Ok(step)
    }
}

/// A finished plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GridPlan {
    /// What was planned.
    pub definition: GridDefinition,
    /// Distance between neighbouring anchors.
    pub step: (i64, i64),
    pub columns: u32,
    pub rows: u32,
    /// Anchors in visiting order.
    pub points: Vec<GridPoint>,
    /// Number of leading points that are tiles. Any points after them are
    /// the transit-only walk back to the start row.
    pub tiles: usize,
    /// Area covered by all tiles.
    pub bounds: Rect,
}

impl GridPlan {
    /// Same layout, moved so the first anchor sits at `new_start`.
    pub fn translated_to(&self, new_start: GridPoint) -> GridPlan {
        let points = translate(&self.points, new_start);
        let (dx, dy) = (
            new_start.0 - self.definition.start.0,
            new_start.1 - self.definition.start.1,
        );
        let extent = match self.definition.extent {
            GridExtent::FinalPoint((x, y)) => GridExtent::FinalPoint((x + dx, y + dy)),
            matrix => matrix,
        };
        GridPlan {
            definition: GridDefinition {
                start: new_start,
                extent,
                ..self.definition
            },
            step: self.step,
            columns: self.columns,
            rows: self.rows,
            tiles: self.tiles,
            bounds: Rect::new(
                self.bounds.min_x + dx,
                self.bounds.min_y + dy,
                self.bounds.max_x + dx,
                self.bounds.max_y + dy,
            ),
            points,
        }
    }

    /// Number of points, realignment tail included.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// True when the plan has no points.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Anchors to image, without the realignment tail.
    pub fn tile_points(&self) -> &[GridPoint] {
        &self.points[..self.tiles.min(self.points.len())]
    }
}

// =============================================================================
// Walker
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Along the leg axis, away from the start row.
    Advance,
    /// One lane sideways.
    Lateral,
    /// Along the leg axis, back toward the start row.
    Retreat,
    Done,
}

/// Where the walker stands on its current leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edge {
    Near,
    Inside,
    Far,
}

impl Phase {
    /// Transition table: (phase, edge, lanes remaining) -> phase.
    fn next(self, edge: Edge, lanes_left: bool) -> Phase {
        match (self, edge, lanes_left) {
            (Phase::Advance, Edge::Far, true) | (Phase::Retreat, Edge::Near, true) => Phase::Lateral,
            (Phase::Advance, Edge::Far, false) | (Phase::Retreat, Edge::Near, false) => Phase::Done,
            (Phase::Lateral, Edge::Far, _) => Phase::Retreat,
            (Phase::Lateral, _, _) => Phase::Advance,
            (phase, _, _) => phase,
        }
    }
}

struct Walker {
    origin: GridPoint,
    step: (i64, i64),
    course: Course,
    leg_len: u32,
    lanes: u32,
    index: u32,
    lane: u32,
    /// Legs finished so far.
    outward_count: u32,
}

impl Walker {
    fn edge(&self, phase: Phase) -> Edge {
        let last = self.leg_len - 1;
        match phase {
            Phase::Retreat if self.index == 0 => Edge::Near,
            Phase::Advance | Phase::Lateral if self.index == last => Edge::Far,
            Phase::Lateral => Edge::Near,
            _ => Edge::Inside,
        }
    }

    fn anchor(&self) -> GridPoint {
        let (x0, y0) = self.origin;
        let (sx, sy) = self.step;
        let sign = self.course.x_sign();
        let (index, lane) = (i64::from(self.index), i64::from(self.lane));
        if self.course.vertical() {
            (x0 + sign * lane * sx, y0 + index * sy)
        } else {
            (x0 + sign * index * sx, y0 + lane * sy)
        }
    }

    fn walk(mut self, capacity: usize, realign: bool) -> Vec<GridPoint> {
        let mut points = Vec::with_capacity(capacity);
        points.push(self.anchor());

        let mut phase = Phase::Advance;
        loop {
            let next = phase.next(self.edge(phase), self.lane + 1 < self.lanes);
            if next != phase {
                trace!("{:?} -> {:?} at {:?}", phase, next, self.anchor());
                if matches!(phase, Phase::Advance | Phase::Retreat) {
                    self.outward_count += 1;
                }
                phase = next;
                // A fresh leg is checked against its edge before moving.
                if matches!(phase, Phase::Advance | Phase::Retreat) {
                    continue;
                }
            }
            match phase {
                Phase::Advance => self.index += 1,
                Phase::Retreat => self.index -= 1,
                Phase::Lateral => self.lane += 1,
                Phase::Done => break,
            }
            points.push(self.anchor());
        }

        // An odd number of legs leaves the walker on the far row.
        if realign && self.outward_count % 2 == 1 {
            while self.index > 0 {
                self.index -= 1;
                points.push(self.anchor());
            }
        }
        points
    }
}

// =============================================================================
// Planner
// =============================================================================

/// Grid path planner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GridPathPlanner {
    /// After an odd number of legs, walk the last lane back to the start row
    /// so the next grid begins from a known row.
    pub realign_to_start_row: bool,
}

impl GridPathPlanner {
    /// Planner without realignment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable the walk back to the start row.
    pub fn with_realignment(mut self, enabled: bool) -> Self {
        self.realign_to_start_row = enabled;
        self
    }

    /// Plan a grid.
    pub fn plan(&self, definition: &GridDefinition) -> StageResult<GridPlan> {
        let step = definition.steps()?;
        let (columns, rows) = match definition.extent {
            GridExtent::Matrix { columns, rows } => {
                if columns == 0 || rows == 0 {
                    return Err(StageError::validation(format!(
                        "grid of {columns}x{rows} tiles is empty"
                    )));
                }
                (columns, rows)
            }
            GridExtent::FinalPoint(target) => counts_to_cover(definition, step, target)?,
        };
        let capacity = validate_grid_size(u64::from(columns), u64::from(rows))?;

        let (leg_len, lanes) = if definition.course.vertical() {
            (rows, columns)
        } else {
            (columns, rows)
        };
        let walker = Walker {
            origin: definition.start,
            step,
            course: definition.course,
            leg_len,
            lanes,
            index: 0,
            lane: 0,
            outward_count: 0,
        };
        let points = walker.walk(capacity, self.realign_to_start_row);
        debug_assert!(validate_path(&points, step).is_ok());

        let bounds = bounding_rect(&points, definition.tile_size)
            .ok_or_else(|| StageError::validation("planned grid is empty"))?;
        debug!(
            "Planned {} anchors ({}x{}, course {}, step {:?})",
            points.len(),
            columns,
            rows,
            definition.course,
            step
        );

        Ok(GridPlan {
            definition: *definition,
            step,
            columns,
            rows,
            points,
            tiles: capacity,
            bounds,
        })
    }

    /// Anchors covering `start` to `final_point`.
    pub fn grid_from_bounds(
        &self,
        start: GridPoint,
        final_point: GridPoint,
        tile_size: (i64, i64),
        non_overlap: (f64, f64),
        course: Course,
    ) -> StageResult<Vec<GridPoint>> {
        self.plan(&GridDefinition {
            start,
            tile_size,
            non_overlap,
            course,
            extent: GridExtent::FinalPoint(final_point),
        })
        .map(|plan| plan.points)
    }

    /// Anchors of an explicit `columns` by `rows` matrix.
    pub fn grid_from_matrix(
        &self,
        start: GridPoint,
        matrix: (u32, u32),
        tile_size: (i64, i64),
        non_overlap: (f64, f64),
        course: Course,
    ) -> StageResult<Vec<GridPoint>> {
        self.plan(&GridDefinition {
            start,
            tile_size,
            non_overlap,
            course,
            extent: GridExtent::Matrix {
                columns: matrix.0,
                rows: matrix.1,
            },
        })
        .map(|plan| plan.points)
    }
}

/// Plan with default settings and return just the anchors.
pub fn plan_grid(definition: &GridDefinition) -> StageResult<Vec<GridPoint>> {
    GridPathPlanner::default()
        .plan(definition)
        .map(|plan| plan.points)
}

/// Tile counts whose envelope reaches `target`.
fn counts_to_cover(
    definition: &GridDefinition,
    step: (i64, i64),
    target: GridPoint,
) -> StageResult<(u32, u32)> {
    let (x0, y0) = definition.start;
    let (w, h) = definition.tile_size;
    let (xf, yf) = target;

    if yf < y0 {
        return Err(StageError::validation(format!(
            "final point y {yf} lies before start y {y0}"
        )));
    }
    let x_gap = match definition.course.x_sign() {
        1 if xf < x0 => {
            return Err(StageError::validation(format!(
                "course {} heads right but final x {xf} lies left of start x {x0}",
                definition.course
            )))
        }
        1 => xf - (x0 + w),
        _ if xf > x0 => {
            return Err(StageError::validation(format!(
                "course {} heads left but final x {xf} lies right of start x {x0}",
                definition.course
            )))
        }
        _ => x0 - xf,
    };
    let y_gap = yf - (y0 + h);

    let count = |gap: i64, step: i64| -> StageResult<u32> {
        let extra = if gap <= 0 { 0 } else { (gap + step - 1) / step };
        u32::try_from(extra + 1)
            .map_err(|_| StageError::validation("grid extent too large for the tile step"))
    };
    Ok((count(x_gap, step.0)?, count(y_gap, step.1)?))
}
