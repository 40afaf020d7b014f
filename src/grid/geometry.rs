//! Geometry helpers over planned anchor lists.

use crate::error::{StageError, StageResult};
use serde::{Deserialize, Serialize};

/// Tile anchor (top-left corner of one camera field) in device units.
pub type GridPoint = (i64, i64);

/// Axis-aligned rectangle, `min` inclusive and `max` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    pub min_x: i64,
    pub min_y: i64,
    pub max_x: i64,
    pub max_y: i64,
}

impl Rect {
    /// Rectangle from its corners.
    pub const fn new(min_x: i64, min_y: i64, max_x: i64, max_y: i64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// Extent along X.
    pub fn width(&self) -> i64 {
        self.max_x - self.min_x
    }

    /// Extent along Y.
    pub fn height(&self) -> i64 {
        self.max_y - self.min_y
    }

    /// True when the rectangle has no area.
    pub fn is_empty(&self) -> bool {
        self.width() <= 0 || self.height() <= 0
    }

    /// True when `other` lies entirely inside `self`.
    pub fn contains_rect(&self, other: &Rect) -> bool {
        self.min_x <= other.min_x
            && self.min_y <= other.min_y
            && self.max_x >= other.max_x
            && self.max_y >= other.max_y
    }
}

/// Envelope of all tiles, including the full extent of the farthest ones.
pub fn bounding_rect(points: &[GridPoint], tile_size: (i64, i64)) -> Option<Rect> {
    let (first, rest) = points.split_first()?;
    let init = Rect::new(first.0, first.1, first.0, first.1);
    let anchors = rest.iter().fold(init, |r, &(x, y)| {
        Rect::new(r.min_x.min(x), r.min_y.min(y), r.max_x.max(x), r.max_y.max(y))
    });
    Some(Rect::new(
        anchors.min_x,
        anchors.min_y,
        anchors.max_x + tile_size.0,
        anchors.max_y + tile_size.1,
    ))
}

/// Rigidly move a layout so its first anchor lands on `new_start`.
pub fn translate(points: &[GridPoint], new_start: GridPoint) -> Vec<GridPoint> {
    let Some(&(x0, y0)) = points.first() else {
        return Vec::new();
    };
    let (ox, oy) = (x0 - new_start.0, y0 - new_start.1);
    points.iter().map(|&(x, y)| (x - ox, y - oy)).collect()
}

/// Drop anchors equal to their predecessor.
pub fn dedupe_consecutive(points: &[GridPoint]) -> Vec<GridPoint> {
    let mut out = points.to_vec();
    out.dedup();
    out
}

/// Area newly brought into view when the camera moves from `prev` to `next`.
///
/// Only axis-aligned moves are allowed.
pub fn swept_region(prev: GridPoint, next: GridPoint, tile_size: (i64, i64)) -> StageResult<Rect> {
    let (w, h) = tile_size;
    let (dx, dy) = (next.0 - prev.0, next.1 - prev.1);

    match (dx, dy) {
        (0, 0) => Ok(Rect::new(next.0, next.1, next.0, next.1)),
        (0, dy) if dy > 0 => Ok(Rect::new(
            next.0,
            (prev.1 + h).max(next.1),
            next.0 + w,
            next.1 + h,
        )),
        (0, _) => Ok(Rect::new(
            next.0,
            next.1,
            next.0 + w,
            prev.1.min(next.1 + h),
        )),
        (dx, 0) if dx > 0 => Ok(Rect::new(
            (prev.0 + w).max(next.0),
            next.1,
            next.0 + w,
            next.1 + h,
        )),
        (_, 0) => Ok(Rect::new(
            next.0,
            next.1,
            prev.0.min(next.0 + w),
            next.1 + h,
        )),
        _ => Err(StageError::validation(format!(
            "diagonal move from {prev:?} to {next:?} is not allowed"
        ))),
    }
}

/// Check that every step changes exactly one coordinate by exactly its step.
pub fn validate_path(points: &[GridPoint], step: (i64, i64)) -> StageResult<()> {
    for (i, pair) in points.windows(2).enumerate() {
        let (a, b) = (pair[0], pair[1]);
        let (dx, dy) = ((b.0 - a.0).abs(), (b.1 - a.1).abs());
        let ok = (dx == step.0 && dy == 0) || (dx == 0 && dy == step.1);
        if !ok {
            return Err(StageError::validation(format!(
                "step {} from {a:?} to {b:?} is not a single axis move of ({}, {})",
                i + 1,
                step.0,
                step.1
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounding_rect_includes_tile_extent() {
        let points = vec![(0, 0), (0, 50), (50, 50), (50, 0)];
        assert_eq!(
            bounding_rect(&points, (100, 80)),
            Some(Rect::new(0, 0, 150, 130))
        );
        assert_eq!(bounding_rect(&[], (100, 80)), None);
    }

    #[test]
    fn test_translate_round_trip() {
        let points = vec![(10, 20), (10, 30), (20, 30)];
        assert_eq!(translate(&points, (10, 20)), points);

        let moved = translate(&points, (-5, 100));
        assert_eq!(moved, vec![(-5, 100), (-5, 110), (5, 110)]);
        assert_eq!(translate(&moved, points[0]), points);
    }

    #[test]
    fn test_dedupe_keeps_non_adjacent_repeats() {
        let points = vec![(0, 0), (0, 0), (0, 5), (0, 0), (0, 0)];
        assert_eq!(dedupe_consecutive(&points), vec![(0, 0), (0, 5), (0, 0)]);
    }

    #[test]
    fn test_swept_region() {
        let tile = (100, 100);
        // Down by half a tile: the lower half of the new tile is new.
        assert_eq!(
            swept_region((0, 0), (0, 50), tile).unwrap(),
            Rect::new(0, 100, 100, 150)
        );
        // Up.
        assert_eq!(
            swept_region((0, 50), (0, 0), tile).unwrap(),
            Rect::new(0, 0, 100, 50)
        );
        // Right, no overlap.
        assert_eq!(
            swept_region((0, 0), (150, 0), tile).unwrap(),
            Rect::new(150, 0, 250, 100)
        );
        // Left.
        assert_eq!(
            swept_region((50, 0), (0, 0), tile).unwrap(),
            Rect::new(0, 0, 50, 100)
        );
        assert!(swept_region((0, 0), (0, 0), tile).unwrap().is_empty());
        assert!(swept_region((0, 0), (50, 50), tile).is_err());
    }

    #[test]
    fn test_validate_path() {
        assert!(validate_path(&[(0, 0), (0, 5), (5, 5), (5, 0)], (5, 5)).is_ok());
        assert!(validate_path(&[(0, 0), (5, 5)], (5, 5)).is_err());
        assert!(validate_path(&[(0, 0), (0, 10)], (5, 5)).is_err());
        assert!(validate_path(&[(0, 0), (0, 0)], (5, 5)).is_err());
        assert!(validate_path(&[], (5, 5)).is_ok());
    }
}
