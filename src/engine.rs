//! Protocol engine for the stage controller
//!
//! Owns the single transport handle and serializes every exchange on it.
//!
//! Protocol overview:
//! - ASCII commands terminated by `\r`, one reply line per command
//! - `R` acknowledges, `E<n>` reports an error, integers carry values
//! - Motion commands (`G`, `GR`, `U`/`D`, `M`, `SIS`) are accepted at once but
//!   answer `R` only when the move completes; the controller may emit other
//!   lines (stale positions) before that
//! - No request identifier exists, so the serialization guard is held across
//!   the whole write and read, and across the whole wait for a motion's `R`
//!
//! # Example Usage
//!
//! ```no_run
//! use stage_scan::adapters::serial_adapter::SerialTransportBuilder;
//! use stage_scan::engine::{EngineSettings, ProtocolEngine};
//! use stage_scan::protocol::Position;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let transport = SerialTransportBuilder::new("/dev/ttyUSB0", 9600).open()?;
//!     let engine = ProtocolEngine::new(Box::new(transport), EngineSettings::default());
//!
//!     engine.move_to(Position::new(3500, -1200, 0)).await?;
//!     let pos = engine.query_position().await?;
//!     println!("Position: {pos}");
//!     Ok(())
//! }
//! ```

use crate::adapters::Transport;
use crate::error::{StageError, StageResult, TransportError};
use crate::error_recovery::RetryPolicy;
use crate::limits::TravelLimits;
use crate::motion::{MotionEvent, MotionState, MotionStateTracker};
use crate::protocol::{parse_response, Axis, Command, Position, Response};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Tunables for [`ProtocolEngine`].
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// Retry budget for non-motion exchanges.
    pub retry: RetryPolicy,
    /// Timeout for one reply line.
    pub read_timeout: Duration,
    /// Time budget for a motion command's completion `R`.
    pub motion_timeout: Duration,
    /// Number of driven axes, 2 (XY) or 3 (XYZ).
    pub axes: u8,
    /// Travel envelope checked before any move is sent.
    pub limits: TravelLimits,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            read_timeout: Duration::from_millis(500),
            motion_timeout: Duration::from_secs(60),
            axes: 3,
            limits: TravelLimits::default(),
        }
    }
}

/// Positions the engine has learned from the controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Recall {
    last_known: Option<Position>,
    home: Option<Position>,
}

/// Command/response engine over one [`Transport`].
///
/// Construct exactly one per physical controller and share it by `Arc`.
pub struct ProtocolEngine {
    /// Serialization guard; holding it is the only way to touch the wire.
    link: Mutex<Box<dyn Transport>>,
    tracker: Arc<MotionStateTracker>,
    recall: watch::Sender<Recall>,
    settings: EngineSettings,
    preempt: Notify,
    /// Emergency stops waiting for the link; motions queued meanwhile are dropped.
    pending_stops: AtomicUsize,
}

/// Marks one emergency stop as pending until it holds the link or is dropped.
struct PendingStop<'a>(&'a AtomicUsize);

impl<'a> PendingStop<'a> {
    fn raise(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count)
    }
}

impl Drop for PendingStop<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ProtocolEngine {
    /// Take ownership of a transport.
    pub fn new(transport: Box<dyn Transport>, settings: EngineSettings) -> Self {
        info!("Protocol engine on {}", transport.describe());
        let (recall, _) = watch::channel(Recall::default());
        Self {
            link: Mutex::new(transport),
            tracker: Arc::new(MotionStateTracker::new()),
            recall,
            settings,
            preempt: Notify::new(),
            pending_stops: AtomicUsize::new(0),
        }
    }

    /// Shared handle to the motion state.
    pub fn tracker(&self) -> Arc<MotionStateTracker> {
        Arc::clone(&self.tracker)
    }

    /// Current motion state.
    pub fn state(&self) -> MotionState {
        self.tracker.state()
    }

    /// True while an accepted motion has not completed.
    pub fn is_busy(&self) -> bool {
        self.tracker.is_busy()
    }

    /// Settings the engine was built with.
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Travel envelope checked before every move.
    pub fn limits(&self) -> &TravelLimits {
        &self.settings.limits
    }

    /// Last position confirmed by a query or a completed move.
    pub fn last_known_position(&self) -> Option<Position> {
        self.recall.borrow().last_known
    }

    /// Home reference recorded by [`set_home`](Self::set_home) or
    /// [`index_stage`](Self::index_stage).
    pub fn home_position(&self) -> Option<Position> {
        self.recall.borrow().home
    }

    /// Name of the underlying transport.
    pub async fn describe(&self) -> String {
        self.link.lock().await.describe()
    }

    // =========================================================================
    // Exchange core
    // =========================================================================

    /// Send one command and return the controller's reply.
    ///
    /// Controller errors come back as `Ok(Response::ErrorCode(_))`; the typed
    /// wrappers turn them into [`StageError::Protocol`]. For motion commands
    /// this returns only after the completion `R` (or an error) arrived.
    pub async fn send(&self, command: Command) -> StageResult<Response> {
        command.validate()?;
        if self.tracker.is_faulted() {
            return Err(StageError::Faulted);
        }

        let mut link = self.link.lock().await;
        if self.tracker.is_faulted() {
            return Err(StageError::Faulted);
        }

        let response = if command.is_motion() {
            self.exchange_motion(&mut **link, &command).await?
        } else {
            self.exchange(&mut **link, &command).await?
        };
        self.remember(&command, &response);
        Ok(response)
    }

    /// Non-motion exchange with the retry budget.
    async fn exchange(&self, transport: &mut dyn Transport, command: &Command) -> StageResult<Response> {
        let wire = command.encode();
        let policy = &self.settings.retry;
        let mut attempts = 0;

        loop {
            attempts += 1;
            let failure = match self.round_trip(transport, &wire).await {
                Ok(Response::Malformed(raw)) => TransportError::Malformed { raw },
                Ok(response) => return Ok(response),
                Err(e) => e,
            };

            if !policy.allows(attempts) {
                error!(
                    command = %wire,
                    attempts,
                    "Retry budget exhausted: {}", failure
                );
                self.tracker.apply(MotionEvent::RetryBudgetExhausted);
                return Err(failure.into());
            }

            let delay = policy.delay(attempts);
            warn!(
                command = %wire,
                attempt = attempts,
                "Exchange failed ({}); retrying in {:?}", failure, delay
            );
            if let Err(e) = transport.clear().await {
                warn!("Failed to clear transport before retry: {}", e);
            }
            tokio::time::sleep(delay).await;
        }
    }

    async fn round_trip(&self, transport: &mut dyn Transport, wire: &str) -> Result<Response, TransportError> {
        transport.write_line(wire).await?;
        let line = tokio::time::timeout(self.settings.read_timeout, transport.read_line())
            .await
            .map_err(|_| TransportError::Timeout {
                command: wire.to_string(),
                after: self.settings.read_timeout,
            })??;
        parse_response(&line)
    }

    /// Motion exchange: write once, then read until `R` or `E<n>`.
    ///
    /// Motion commands are never re-sent, so a lost completion faults the
    /// stage instead of retrying.
    async fn exchange_motion(
        &self,
        transport: &mut dyn Transport,
        command: &Command,
    ) -> StageResult<Response> {
        let wire = command.encode();

        let preempted = self.preempt.notified();
        tokio::pin!(preempted);
        preempted.as_mut().enable();
        if self.pending_stops.load(Ordering::SeqCst) > 0 {
            return Err(StageError::Preempted { command: wire });
        }

        if let Err(e) = transport.write_line(&wire).await {
            error!(command = %wire, "Failed to send motion command: {}", e);
            self.tracker.apply(MotionEvent::RetryBudgetExhausted);
            return Err(e.into());
        }
        self.tracker.apply(MotionEvent::MotionAccepted);

        let started = Instant::now();
        let deadline = started + self.settings.motion_timeout;
        let mut discarded = 0usize;

        loop {
            let read = tokio::select! {
                biased;
                _ = &mut preempted => {
                    warn!(command = %wire, "Motion wait preempted by emergency stop");
                    return Err(StageError::Preempted { command: wire });
                }
                read = tokio::time::timeout_at(deadline, transport.read_line()) => read,
            };

            let line = match read {
                Ok(Ok(line)) => line,
                Ok(Err(e)) => {
                    error!(command = %wire, "Transport failed during motion: {}", e);
                    self.tracker.apply(MotionEvent::RetryBudgetExhausted);
                    return Err(e.into());
                }
                Err(_) => {
                    error!(
                        command = %wire,
                        discarded,
                        "No completion within {:?}", self.settings.motion_timeout
                    );
                    self.tracker.apply(MotionEvent::RetryBudgetExhausted);
                    return Err(TransportError::Timeout {
                        command: wire,
                        after: self.settings.motion_timeout,
                    }
                    .into());
                }
            };

            match parse_response(&line) {
                Ok(Response::Ack) => {
                    self.tracker.apply(MotionEvent::Acknowledged);
                    info!(
                        command = %wire,
                        discarded,
                        "Motion complete in {:?}", started.elapsed()
                    );
                    return Ok(Response::Ack);
                }
                Ok(Response::ErrorCode(kind)) => {
                    self.tracker.apply(MotionEvent::Rejected);
                    warn!(command = %wire, "Motion rejected: {}", kind);
                    return Ok(Response::ErrorCode(kind));
                }
                Ok(other) => {
                    discarded += 1;
                    debug!(command = %wire, "Discarding line during motion: {:?}", other);
                }
                Err(e) => {
                    discarded += 1;
                    debug!(command = %wire, "Discarding line during motion: {}", e);
                }
            }
        }
    }

    /// Update the recalled positions after a successful exchange.
    fn remember(&self, command: &Command, response: &Response) {
        if !response.is_success() && !matches!(response, Response::PositionTriple(..)) {
            return;
        }
        self.recall.send_modify(|recall| match (command, response) {
            (Command::QueryPosition, Response::PositionTriple(x, y, z)) => {
                let reading = Position::new(*x, *y, *z);
                // An implausible reading is returned to the caller but never recalled.
                if self.settings.limits.violation(&reading).is_none() {
                    recall.last_known = Some(reading);
                }
            }
            (Command::MoveAbsolute { x, y, z }, _) => {
                let z = z.or(recall.last_known.map(|p| p.z)).unwrap_or_default();
                recall.last_known = Some(Position::new(*x, *y, z));
            }
            (Command::MoveRelative { dx, dy }, _) => {
                recall.last_known = recall.last_known.and_then(|p| p.checked_offset(*dx, *dy, 0));
            }
            (Command::MoveRelativeZ { dz }, _) => {
                recall.last_known = recall.last_known.and_then(|p| p.checked_offset(0, 0, *dz));
            }
            (Command::Home, _) => {
                recall.last_known = Some(Position::default());
            }
            (Command::IndexStage, _) => {
                recall.last_known = Some(Position::default());
                recall.home = Some(Position::default());
            }
            (Command::SetHome, _) => {
                recall.last_known = Some(Position::default());
            }
            (Command::EmergencyStop | Command::StopMovement, _) => {
                recall.last_known = None;
            }
            _ => {}
        });
    }

    /// Send and turn a controller error into [`StageError::Protocol`].
    async fn request(&self, command: Command) -> StageResult<Response> {
        let wire = command.encode();
        match self.send(command).await? {
            Response::ErrorCode(kind) => Err(StageError::Protocol { command: wire, kind }),
            other => Ok(other),
        }
    }

    /// Send a command whose only good answer is `R` or `0`.
    async fn expect_success(&self, command: Command) -> StageResult<()> {
        let wire = command.encode();
        match self.request(command).await? {
            response if response.is_success() => Ok(()),
            other => Err(unexpected(wire, &other)),
        }
    }

    async fn query_int(&self, command: Command) -> StageResult<i64> {
        let wire = command.encode();
        match self.request(command).await? {
            Response::IntValue(v) => Ok(v),
            other => Err(unexpected(wire, &other)),
        }
    }

    async fn query_setting(&self, command: Command) -> StageResult<u8> {
        let wire = command.encode();
        let value = self.query_int(command).await?;
        u8::try_from(value).map_err(|_| StageError::UnexpectedResponse {
            command: wire,
            response: value.to_string(),
        })
    }

    // =========================================================================
    // Motion
    // =========================================================================

    /// Absolute move. Z is sent only on three-axis stages.
    pub async fn move_to(&self, target: Position) -> StageResult<()> {
        self.settings.limits.check(&target)?;
        let z = (self.settings.axes >= 3).then_some(target.z);
        self.expect_success(Command::MoveAbsolute {
            x: target.x,
            y: target.y,
            z,
        })
        .await
    }

    /// Relative XY move. Checked against the envelope when the position is known.
    pub async fn move_relative(&self, dx: i64, dy: i64) -> StageResult<()> {
        if let Some(current) = self.last_known_position() {
            let target = current
                .checked_offset(dx, dy, 0)
                .ok_or_else(|| StageError::validation(format!("relative move ({dx}, {dy}) overflows")))?;
            self.settings.limits.check(&target)?;
        }
        self.expect_success(Command::MoveRelative { dx, dy }).await
    }

    /// Relative focus move; positive is up.
    pub async fn move_relative_z(&self, dz: i64) -> StageResult<()> {
        if self.settings.axes < 3 {
            return Err(StageError::validation("no Z axis configured"));
        }
        if let Some(current) = self.last_known_position() {
            let target = current
                .checked_offset(0, 0, dz)
                .ok_or_else(|| StageError::validation(format!("focus move of {dz} overflows")))?;
            self.settings.limits.check(&target)?;
        }
        self.expect_success(Command::MoveRelativeZ { dz }).await
    }

    /// Return to the home position.
    pub async fn home(&self) -> StageResult<()> {
        self.expect_success(Command::Home).await
    }

    /// Make the current position the origin and record it as home.
    pub async fn set_home(&self) -> StageResult<()> {
        self.expect_success(Command::SetHome).await?;
        let home = self.query_position().await?;
        self.recall.send_modify(|recall| recall.home = Some(home));
        info!("Home set at {}", home);
        Ok(())
    }

    /// Drive to the limit switches and re-zero. Resets the home reference.
    pub async fn index_stage(&self) -> StageResult<()> {
        self.expect_success(Command::IndexStage).await
    }

    /// Stop immediately, preempting any motion wait in progress.
    ///
    /// Pending input is discarded before `K` is written. A garbled or missing
    /// reply is retried like any other exchange; if the budget runs out the
    /// stage is `Faulted`. Any answer from the controller leaves `Busy`.
    pub async fn emergency_stop(&self) -> StageResult<()> {
        let pending = PendingStop::raise(&self.pending_stops);
        self.preempt.notify_waiters();

        let mut link = self.link.lock().await;
        drop(pending);
        warn!("Emergency stop");

        if let Err(e) = link.clear().await {
            warn!("Failed to flush transport before emergency stop: {}", e);
        }

        let command = Command::EmergencyStop;
        let wire = command.encode();
        let response = self.exchange(&mut **link, &command).await?;
        self.tracker.apply(MotionEvent::Stopped);
        self.recall.send_modify(|recall| recall.last_known = None);
        match response {
            response if response.is_success() => Ok(()),
            Response::ErrorCode(kind) => Err(StageError::Protocol { command: wire, kind }),
            other => Err(unexpected(wire, &other)),
        }
    }

    /// Orderly stop of the current movement.
    pub async fn stop(&self) -> StageResult<()> {
        self.expect_success(Command::StopMovement).await?;
        self.tracker.apply(MotionEvent::Stopped);
        Ok(())
    }

    /// Poll `$` until the controller reports no axis moving.
    ///
    /// Covers motion the tracker cannot see, such as joystick moves.
    pub async fn wait_until_settled(&self, poll: Duration, budget: Duration) -> StageResult<()> {
        let deadline = Instant::now() + budget;
        loop {
            if !self.query_busy().await? {
                return Ok(());
            }
            if Instant::now() + poll > deadline {
                return Err(TransportError::Timeout {
                    command: Command::QueryBusy.encode(),
                    after: budget,
                }
                .into());
            }
            tokio::time::sleep(poll).await;
        }
    }

    // =========================================================================
    // Settings
    // =========================================================================

    /// Set the speed of an axis (XY share one setting).
    pub async fn set_speed(&self, axis: Axis, value: u8) -> StageResult<()> {
        self.expect_success(Command::SetSpeed { axis, value }).await
    }

    /// Set the acceleration of an axis (XY share one setting).
    pub async fn set_acceleration(&self, axis: Axis, value: u8) -> StageResult<()> {
        self.expect_success(Command::SetAcceleration { axis, value })
            .await
    }

    /// Current speed setting of an axis.
    pub async fn speed(&self, axis: Axis) -> StageResult<u8> {
        self.query_setting(Command::QuerySpeed(axis)).await
    }

    /// Current acceleration setting of an axis.
    pub async fn acceleration(&self, axis: Axis) -> StageResult<u8> {
        self.query_setting(Command::QueryAcceleration(axis)).await
    }

    /// Enable or disable the joystick.
    pub async fn set_joystick(&self, enabled: bool) -> StageResult<()> {
        self.expect_success(Command::SetJoystick { enabled }).await
    }

    /// Reverse (`-1`) or restore (`1`) an axis direction.
    pub async fn set_axis_direction(&self, axis: Axis, dir: i8) -> StageResult<()> {
        self.expect_success(Command::SetAxisDirection { axis, dir })
            .await
    }

    /// S-curve acceleration profile, 0 (off) to 100.
    pub async fn set_s_curve(&self, value: u8) -> StageResult<()> {
        self.expect_success(Command::SetSCurve(value)).await
    }

    /// Switch the controller's command compatibility mode.
    pub async fn set_compatibility_mode(&self, enabled: bool) -> StageResult<()> {
        self.expect_success(Command::SetCompatibilityMode(enabled))
            .await
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Read the position of all axes.
    pub async fn query_position(&self) -> StageResult<Position> {
        let wire = Command::QueryPosition.encode();
        match self.request(Command::QueryPosition).await? {
            Response::PositionTriple(x, y, z) => Ok(Position::new(x, y, z)),
            other => Err(unexpected(wire, &other)),
        }
    }

    /// Coordinate of a single axis.
    pub async fn query_axis(&self, axis: Axis) -> StageResult<i64> {
        self.query_int(Command::QueryAxis(axis)).await
    }

    /// True while any axis is moving.
    pub async fn query_busy(&self) -> StageResult<bool> {
        Ok(self.query_int(Command::QueryBusy).await? != 0)
    }

    /// Controller serial number.
    pub async fn serial_number(&self) -> StageResult<String> {
        let wire = Command::QuerySerialNumber.encode();
        match self.request(Command::QuerySerialNumber).await? {
            Response::IntValue(n) => Ok(n.to_string()),
            other => Err(unexpected(wire, &other)),
        }
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Swap in a freshly opened transport. This is the only way out of `Faulted`.
    pub async fn reopen(&self, transport: Box<dyn Transport>) -> StageResult<()> {
        let mut link = self.link.lock().await;
        info!("Re-opening transport: {} -> {}", link.describe(), transport.describe());
        *link = transport;
        self.recall.send_modify(|recall| recall.last_known = None);
        self.tracker.apply(MotionEvent::TransportReset);
        Ok(())
    }
}

fn unexpected(command: String, response: &Response) -> StageError {
    StageError::UnexpectedResponse {
        command,
        response: format!("{response:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{SimulatedStage, SimulatorSettings};

    fn engine_with(settings: SimulatorSettings) -> (SimulatedStage, ProtocolEngine) {
        let (sim, transport) = SimulatedStage::spawn(settings);
        let engine = ProtocolEngine::new(
            Box::new(transport),
            EngineSettings {
                retry: RetryPolicy {
                    max_attempts: 3,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(5),
                },
                read_timeout: Duration::from_millis(100),
                motion_timeout: Duration::from_secs(2),
                ..EngineSettings::default()
            },
        );
        (sim, engine)
    }

    #[tokio::test]
    async fn test_move_and_query() {
        let (sim, engine) = engine_with(SimulatorSettings::default());
        engine.move_to(Position::new(3500, -1200, 10)).await.unwrap();
        assert_eq!(engine.state(), MotionState::Idle);
        assert_eq!(sim.position().await, Position::new(3500, -1200, 10));
        assert_eq!(
            engine.query_position().await.unwrap(),
            Position::new(3500, -1200, 10)
        );
        assert_eq!(
            engine.last_known_position(),
            Some(Position::new(3500, -1200, 10))
        );
    }

    #[tokio::test]
    async fn test_validation_never_reaches_wire() {
        let (sim, engine) = engine_with(SimulatorSettings::default());
        let err = engine.set_speed(Axis::X, 101).await.unwrap_err();
        assert!(matches!(err, StageError::Validation(_)));
        let err = engine.set_speed(Axis::Z, 2).await.unwrap_err();
        assert!(matches!(err, StageError::Validation(_)));
        let err = engine.move_to(Position::new(0, 500_000, 0)).await.unwrap_err();
        assert!(matches!(err, StageError::Validation(_)));
        assert!(sim.commands().await.is_empty());
    }

    #[tokio::test]
    async fn test_controller_error_is_surfaced() {
        let (_sim, engine) = engine_with(SimulatorSettings {
            has_focus: false,
            ..Default::default()
        });
        let err = engine.query_axis(Axis::Z).await.unwrap_err();
        assert!(matches!(
            err,
            StageError::Protocol {
                kind: crate::protocol::ErrorKind::NoFocus,
                ..
            }
        ));
        assert_eq!(engine.state(), MotionState::Idle);
    }

    #[tokio::test]
    async fn test_noise_lines_are_discarded() {
        let (_sim, engine) = engine_with(SimulatorSettings {
            noise_lines: 3,
            ..Default::default()
        });
        engine.move_relative(400, 0).await.unwrap();
        assert_eq!(engine.query_position().await.unwrap(), Position::new(400, 0, 0));
    }

    #[tokio::test]
    async fn test_garbage_is_retried() {
        let (sim, engine) = engine_with(SimulatorSettings::default());
        sim.inject_garbage(2).await;
        assert_eq!(engine.query_position().await.unwrap(), Position::default());
        assert_eq!(engine.state(), MotionState::Idle);
        assert_eq!(sim.commands().await.len(), 3);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_retry_is_logged() {
        let (sim, engine) = engine_with(SimulatorSettings::default());
        sim.inject_garbage(1).await;
        engine.query_busy().await.unwrap();
        assert!(logs_contain("retrying"));
        assert!(!logs_contain("Retry budget exhausted"));
    }

    #[tokio::test]
    async fn test_exhausted_budget_faults_until_reopen() {
        let (sim, engine) = engine_with(SimulatorSettings::default());
        sim.inject_silence(3).await;

        let err = engine.query_position().await.unwrap_err();
        assert!(matches!(
            err,
            StageError::Transport(TransportError::Timeout { .. })
        ));
        assert_eq!(engine.state(), MotionState::Faulted);
        assert!(matches!(
            engine.query_busy().await,
            Err(StageError::Faulted)
        ));

        engine.reopen(Box::new(sim.connect())).await.unwrap();
        assert_eq!(engine.state(), MotionState::Idle);
        assert!(!engine.query_busy().await.unwrap());
    }

    #[tokio::test]
    async fn test_settings_round_trip() {
        let (_sim, engine) = engine_with(SimulatorSettings::default());
        engine.set_speed(Axis::Y, 30).await.unwrap();
        engine.set_acceleration(Axis::Z, 20).await.unwrap();
        assert_eq!(engine.speed(Axis::X).await.unwrap(), 30);
        assert_eq!(engine.acceleration(Axis::Z).await.unwrap(), 20);
        engine.set_s_curve(40).await.unwrap();
        engine.set_compatibility_mode(false).await.unwrap();
        engine.set_axis_direction(Axis::Z, -1).await.unwrap();
        engine.set_joystick(false).await.unwrap();
        assert_eq!(engine.serial_number().await.unwrap(), "40817");
    }

    #[tokio::test]
    async fn test_home_tracking() {
        let (sim, engine) = engine_with(SimulatorSettings::default());
        sim.set_position(Position::new(120, 340, 5)).await;
        engine.set_home().await.unwrap();
        assert_eq!(engine.home_position(), Some(Position::default()));

        engine.move_to(Position::new(50, 50, 0)).await.unwrap();
        engine.home().await.unwrap();
        assert_eq!(sim.position().await, Position::default());

        engine.index_stage().await.unwrap();
        assert_eq!(engine.home_position(), Some(Position::default()));
    }

    #[tokio::test]
    async fn test_two_axis_move_omits_z() {
        let (sim, transport) = SimulatedStage::spawn(SimulatorSettings::default());
        let engine = ProtocolEngine::new(
            Box::new(transport),
            EngineSettings {
                axes: 2,
                ..EngineSettings::default()
            },
        );
        engine.move_to(Position::new(10, 20, 99)).await.unwrap();
        assert_eq!(sim.commands().await, vec!["G,10,20"]);
        assert!(engine.move_relative_z(5).await.is_err());
    }
}
