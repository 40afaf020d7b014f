//! Core library for the stage-scan application.
//!
//! This library drives a serial XY(Z) microscope stage controller and plans
//! the tile grids acquisition code walks with it. It is used by the
//! `stage-scan` command-line tool and by the integration tests, which run
//! against the in-process [`adapters::SimulatedStage`].
//!
//! Layers, bottom up:
//! - [`adapters`]: line framing over serial, TCP or in-memory streams
//! - [`protocol`]: typed commands, reply parsing and the error taxonomy
//! - [`engine`]: the single serialized command path to the controller
//! - [`motion`], [`poller`]: motion state and background position polling
//! - [`grid`], [`scan`]: tile grid planning and sequencing
//! - [`stage`]: the facade wiring engine and poller together

/// Transports: line framing, serial port, simulated controller.
pub mod adapters;
/// Layered configuration.
pub mod config;
/// Serialized command/response engine.
pub mod engine;
/// Error types.
pub mod error;
/// Retry policy for transport failures.
pub mod error_recovery;
/// Tile grid planning.
pub mod grid;
/// Travel envelope.
pub mod limits;
/// Motion state machine.
pub mod motion;
/// Background position polling.
pub mod poller;
/// Wire commands, replies and controller error codes.
pub mod protocol;
/// Scan sequencing over a planned grid.
pub mod scan;
/// Engine plus poller facade.
pub mod stage;

pub use engine::{EngineSettings, ProtocolEngine};
pub use error::{StageError, StageResult, TransportError};
pub use grid::{Course, GridDefinition, GridPathPlanner, GridPlan, GridPoint};
pub use motion::{MotionState, MotionStateTracker};
pub use poller::{PositionEvent, PositionPoller};
pub use protocol::{Axis, Command, ErrorKind, Position, Response};
pub use stage::Stage;
