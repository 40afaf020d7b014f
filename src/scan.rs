//! Tile acquisition sequencing
//!
//! Walks a planned grid: move to each anchor, wait for the stage to settle,
//! then hand the tile to a [`TileHandler`] (camera capture lives outside this
//! crate). A scan can be aborted cooperatively between tiles.

use crate::engine::ProtocolEngine;
use crate::error::{StageError, StageResult};
use crate::grid::{swept_region, Course, GridPlan, GridPoint, Rect};
use crate::protocol::Position;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Scan defaults and pacing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    /// Poll interval while waiting for the stage to become idle.
    #[serde(with = "humantime_serde")]
    pub settle_poll: Duration,
    /// Default tile (camera field) size in device units.
    pub tile_size: (i64, i64),
    /// Default non-overlap fraction per axis.
    pub non_overlap: (f64, f64),
    pub course: Course,
    pub realign_to_start_row: bool,
    /// Focus height for every tile; `None` keeps the current Z.
    pub focus_z: Option<i64>,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            settle_poll: Duration::from_millis(20),
            tile_size: (1000, 1000),
            non_overlap: (0.9, 0.9),
            course: Course::VRight,
            realign_to_start_row: false,
            focus_z: None,
        }
    }
}

/// One tile reached during a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tile {
    /// Position in the plan.
    pub index: usize,
    pub anchor: GridPoint,
    /// Where the stage was sent.
    pub position: Position,
    /// Area that came into view with this tile; `None` for the first one.
    pub newly_covered: Option<Rect>,
}

/// Receives each tile once the stage has settled on it.
#[async_trait]
pub trait TileHandler: Send {
    async fn on_tile(&mut self, tile: &Tile) -> anyhow::Result<()>;
}

/// Outcome of [`ScanExecutor::run`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    /// Tiles handed to the handler.
    pub tiles_visited: usize,
    /// Tiles in the plan, realignment tail excluded.
    pub tiles_planned: usize,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    /// True when the run stopped on an abort request.
    pub aborted: bool,
}

/// Cloneable handle that stops a running scan before its next tile.
#[derive(Debug, Clone, Default)]
pub struct ScanAbort(Arc<AtomicBool>);

impl ScanAbort {
    /// Request the scan to stop.
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// True once an abort was requested.
    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Runs grid plans against one engine.
pub struct ScanExecutor {
    engine: Arc<ProtocolEngine>,
    settings: ScanSettings,
    abort: ScanAbort,
}

impl ScanExecutor {
    /// Executor driving `engine`.
    pub fn new(engine: Arc<ProtocolEngine>, settings: ScanSettings) -> Self {
        Self {
            engine,
            settings,
            abort: ScanAbort::default(),
        }
    }

    /// Handle that aborts the current or next run.
    pub fn abort_handle(&self) -> ScanAbort {
        self.abort.clone()
    }

    /// Visit every anchor of `plan` in order.
    ///
    /// The whole plan is checked against the travel envelope before the
    /// first move, so a scan never stops halfway on a bad anchor. Points past
    /// [`GridPlan::tiles`] are driven through without calling the handler.
    pub async fn run(
        &self,
        plan: &GridPlan,
        handler: &mut dyn TileHandler,
    ) -> StageResult<ScanReport> {
        self.abort.reset();
        let started = Instant::now();
        let tracker = self.engine.tracker();
        let z = self
            .settings
            .focus_z
            .or_else(|| self.engine.last_known_position().map(|p| p.z))
            .unwrap_or_default();

        for &(x, y) in &plan.points {
            self.engine.limits().check(&Position::new(x, y, z))?;
        }

        info!(
            "Scanning {} tiles ({}x{}, course {})",
            plan.tiles,
            plan.columns,
            plan.rows,
            plan.definition.course
        );

        let mut visited = 0;
        let mut previous: Option<GridPoint> = None;
        for (index, &anchor) in plan.points.iter().enumerate() {
            if self.abort.is_aborted() {
                warn!("Scan aborted after {} of {} tiles", visited, plan.tiles);
                return Ok(self.report(visited, plan.tiles, started, true));
            }

            let position = Position::new(anchor.0, anchor.1, z);
            self.engine.move_to(position).await?;
            tracker.wait_until_idle(self.settings.settle_poll).await?;
            if index >= plan.tiles {
                debug!("Realigning through {}", position);
                continue;
            }

            let newly_covered = match previous {
                Some(prev) => Some(swept_region(prev, anchor, plan.definition.tile_size)?),
                None => None,
            };
            let tile = Tile {
                index,
                anchor,
                position,
                newly_covered,
            };
            debug!("Tile {} at {}", index, position);
            handler
                .on_tile(&tile)
                .await
                .map_err(|e| StageError::Handler {
                    index,
                    message: format!("{e:#}"),
                })?;

            visited += 1;
            previous = Some(anchor);
        }

        let report = self.report(visited, plan.tiles, started, false);
        info!("Scan complete: {} tiles in {:?}", visited, report.elapsed);
        Ok(report)
    }

    fn report(&self, visited: usize, planned: usize, started: Instant, aborted: bool) -> ScanReport {
        ScanReport {
            tiles_visited: visited,
            tiles_planned: planned,
            elapsed: started.elapsed(),
            aborted,
        }
    }
}
