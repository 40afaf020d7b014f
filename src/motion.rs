//! Motion state tracking
//!
//! Small Idle/Busy/Faulted state machine driven by the protocol engine. The
//! current state lives in a `tokio::sync::watch` channel so any number of
//! tasks (the poller, a scan, a UI) can read it or wait for it to change.
//!
//! Transitions are an explicit table over `(state, event)`; see
//! [`MotionState::on`].

use crate::error::{StageError, StageResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

/// Motion state of the stage as seen by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MotionState {
    /// No accepted motion is outstanding.
    Idle,
    /// A motion command was accepted and its completion `R` has not arrived.
    Busy,
    /// The retry budget was exhausted. Only a transport reset leaves this state.
    Faulted,
}

/// Inputs to the state machine, emitted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionEvent {
    /// A motion command was written.
    MotionAccepted,
    /// Completion `R` received.
    Acknowledged,
    /// The controller answered with an error code.
    Rejected,
    /// Emergency stop or stop acknowledged.
    Stopped,
    /// Too many transport failures in a row, or a motion never completed.
    RetryBudgetExhausted,
    /// The transport was re-opened.
    TransportReset,
}

impl MotionState {
    /// Transition table.
    pub fn on(self, event: MotionEvent) -> MotionState {
        use MotionEvent::*;
        use MotionState::*;
        match (self, event) {
            (Faulted, TransportReset) => Idle,
            (Faulted, _) => Faulted,
            (_, RetryBudgetExhausted) => Faulted,
            (_, MotionAccepted) => Busy,
            (Busy, Acknowledged | Rejected) => Idle,
            (_, Stopped | TransportReset) => Idle,
            (Idle, Acknowledged | Rejected) => Idle,
        }
    }
}

impl fmt::Display for MotionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MotionState::Idle => "idle",
            MotionState::Busy => "busy",
            MotionState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Shared holder of the current [`MotionState`].
#[derive(Debug)]
pub struct MotionStateTracker {
    sender: watch::Sender<MotionState>,
}

impl Default for MotionStateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl MotionStateTracker {
    /// Start in `Idle`.
    pub fn new() -> Self {
        let (sender, _) = watch::channel(MotionState::Idle);
        Self { sender }
    }

    /// Current state.
    pub fn state(&self) -> MotionState {
        *self.sender.borrow()
    }

    /// True while a motion is outstanding.
    pub fn is_busy(&self) -> bool {
        self.state() == MotionState::Busy
    }

    /// True once the retry budget ran out.
    pub fn is_faulted(&self) -> bool {
        self.state() == MotionState::Faulted
    }

    /// Receiver notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<MotionState> {
        self.sender.subscribe()
    }

    /// Feed one event through the transition table and return the new state.
    pub fn apply(&self, event: MotionEvent) -> MotionState {
        let mut next = MotionState::Idle;
        self.sender.send_if_modified(|state| {
            let previous = *state;
            next = previous.on(event);
            if next == previous {
                return false;
            }
            *state = next;
            if next == MotionState::Faulted {
                error!("Motion state {} -> {} on {:?}", previous, next, event);
            } else {
                info!("Motion state {} -> {} on {:?}", previous, next, event);
            }
            true
        });
        next
    }

    /// Wait until the stage is idle.
    ///
    /// Wakes on every state change and at least once per `poll_interval`.
    /// Fails with [`StageError::Faulted`] instead of waiting forever on a
    /// faulted stage.
    pub async fn wait_until_idle(&self, poll_interval: Duration) -> StageResult<()> {
        let mut rx = self.sender.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                MotionState::Idle => return Ok(()),
                MotionState::Faulted => return Err(StageError::Faulted),
                MotionState::Busy => {
                    // Timeout just means "check again".
                    let _ = tokio::time::timeout(poll_interval, rx.changed()).await;
                }
            }
        }
    }
}
