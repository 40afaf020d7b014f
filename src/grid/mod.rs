//! Tile grid planning.
//!
//! [`planner`] turns a [`GridDefinition`] into an ordered, diagonal-free list
//! of tile anchors; [`geometry`] holds the helpers that operate on such lists.

/// Rectangles and path checks over anchors.
pub mod geometry;
/// Boustrophedon grid walker.
pub mod planner;

pub use geometry::{
    bounding_rect, dedupe_consecutive, swept_region, translate, validate_path, GridPoint, Rect,
};
pub use planner::{plan_grid, Course, GridDefinition, GridExtent, GridPathPlanner, GridPlan};
