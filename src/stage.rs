//! Stage facade
//!
//! Wires one [`ProtocolEngine`] to one [`PositionPoller`] and exposes the
//! small surface UI and acquisition code need. Everything else is reachable
//! through [`Stage::engine`].

use crate::engine::ProtocolEngine;
use crate::error::StageResult;
use crate::grid::{GridDefinition, GridPathPlanner, GridPoint};
use crate::poller::{PollerSettings, PositionEvent, PositionPoller};
use crate::protocol::Position;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

/// One controller with its position poller and grid planner.
pub struct Stage {
    engine: Arc<ProtocolEngine>,
    poller: PositionPoller,
    planner: GridPathPlanner,
}

impl Stage {
    /// Start polling `engine` and wrap both.
    pub fn new(engine: Arc<ProtocolEngine>, poller: PollerSettings, planner: GridPathPlanner) -> Self {
        let poller = PositionPoller::spawn(Arc::clone(&engine), poller);
        Self {
            engine,
            poller,
            planner,
        }
    }

    /// Full typed command surface.
    pub fn engine(&self) -> &Arc<ProtocolEngine> {
        &self.engine
    }

    /// The background position poller.
    pub fn poller(&self) -> &PositionPoller {
        &self.poller
    }

    /// Absolute move; returns once the stage has arrived.
    pub async fn move_to(&self, target: Position) -> StageResult<()> {
        self.engine.move_to(target).await
    }

    /// Relative XY move.
    pub async fn move_relative(&self, dx: i64, dy: i64) -> StageResult<()> {
        self.engine.move_relative(dx, dy).await
    }

    /// Freshest known position.
    ///
    /// The engine's recall is updated by every completed move and by every
    /// plausible query, the poller's included, so it is never older than the
    /// poller's reading. The poller's last good value is only a fallback after
    /// an emergency stop or a transport reset cleared the recall.
    pub fn current_position(&self) -> Option<Position> {
        self.engine
            .last_known_position()
            .or_else(|| self.poller.current_position())
    }

    /// True while a motion is outstanding.
    pub fn is_busy(&self) -> bool {
        self.engine.is_busy()
    }

    /// Plan a grid and return its anchors in visiting order.
    pub fn plan_grid(&self, definition: &GridDefinition) -> StageResult<Vec<GridPoint>> {
        self.planner.plan(definition).map(|plan| plan.points)
    }

    /// Call `callback` with every polled position.
    pub fn subscribe_position<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(Position) + Send + 'static,
    {
        self.poller.subscribe_position(callback)
    }

    /// Receiver of poller updates and faults.
    pub fn subscribe_events(&self) -> broadcast::Receiver<PositionEvent> {
        self.poller.subscribe()
    }

    /// Stop the poller and wait for it.
    pub async fn shutdown(&self) {
        self.poller.stop();
        self.poller.join().await;
        info!("Stage shut down");
    }
}
