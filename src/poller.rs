//! Background position polling
//!
//! Periodically asks the engine for the stage position and publishes it. The
//! poller goes through the engine's serialization guard like every other
//! caller, so its `P` queries can never be paired with another request's
//! reply. While a motion is outstanding it does not query at all.
//!
//! A reading that fails to parse or lies outside the travel envelope is never
//! published as a position; subscribers get a [`PositionEvent::Fault`] and the
//! last good value is kept.

use crate::engine::ProtocolEngine;
use crate::motion::MotionState;
use crate::protocol::Position;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Poller tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerSettings {
    /// Sleep between queries.
    #[serde(with = "humantime_serde")]
    pub period: Duration,
    /// Capacity of the event broadcast channel.
    pub channel_capacity: usize,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(200),
            channel_capacity: 256,
        }
    }
}

/// Published by the poller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PositionEvent {
    /// A plausible position was read.
    Updated {
        position: Position,
        at: DateTime<Utc>,
    },
    /// The query failed or returned an implausible value.
    Fault { reason: String, at: DateTime<Utc> },
}

/// Handle to the running poll loop.
pub struct PositionPoller {
    stop: Arc<AtomicBool>,
    events: broadcast::Sender<PositionEvent>,
    latest: watch::Receiver<Option<Position>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PositionPoller {
    /// Start polling `engine` every `settings.period`.
    pub fn spawn(engine: Arc<ProtocolEngine>, settings: PollerSettings) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let (events, _) = broadcast::channel(settings.channel_capacity.max(1));
        let (latest_tx, latest) = watch::channel(engine.last_known_position());

        let task = tokio::spawn(poll_loop(
            engine,
            settings,
            Arc::clone(&stop),
            events.clone(),
            latest_tx,
        ));

        Self {
            stop,
            events,
            latest,
            task: Mutex::new(Some(task)),
        }
    }

    /// Last good position, if any has been read.
    pub fn current_position(&self) -> Option<Position> {
        *self.latest.borrow()
    }

    /// Receiver of every event from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PositionEvent> {
        self.events.subscribe()
    }

    /// Watch of the last good position.
    pub fn watch_position(&self) -> watch::Receiver<Option<Position>> {
        self.latest.clone()
    }

    /// Call `callback` with every new good position.
    ///
    /// The callback runs on its own task, which ends once the poller is dropped.
    pub fn subscribe_position<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(Position) + Send + 'static,
    {
        let mut rx = self.events.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(PositionEvent::Updated { position, .. }) => callback(position),
                    Ok(PositionEvent::Fault { .. }) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Position subscriber lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Ask the loop to exit after its current iteration.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// True once [`stop`](Self::stop) was called or the poller was dropped.
    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Wait for the loop to exit. Returns immediately if already joined.
    pub async fn join(&self) {
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Position poller task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for PositionPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn poll_loop(
    engine: Arc<ProtocolEngine>,
    settings: PollerSettings,
    stop: Arc<AtomicBool>,
    events: broadcast::Sender<PositionEvent>,
    latest: watch::Sender<Option<Position>>,
) {
    info!("Position poller started ({:?} period)", settings.period);
    let tracker = engine.tracker();

    while !stop.load(Ordering::SeqCst) {
        tokio::time::sleep(settings.period).await;
        if stop.load(Ordering::SeqCst) {
            break;
        }

        match tracker.state() {
            MotionState::Idle => {}
            state => {
                trace!("Skipping position query while {}", state);
                continue;
            }
        }

        let event = match engine.query_position().await {
            Ok(position) => match engine.limits().violation(&position) {
                None => {
                    latest.send_replace(Some(position));
                    PositionEvent::Updated {
                        position,
                        at: Utc::now(),
                    }
                }
                Some(axis) => {
                    warn!("Discarding position {} outside the {} envelope", position, axis);
                    PositionEvent::Fault {
                        reason: format!("position {position} outside the {axis} travel envelope"),
                        at: Utc::now(),
                    }
                }
            },
            Err(e) => {
                warn!("Position query failed: {}", e);
                PositionEvent::Fault {
                    reason: e.to_string(),
                    at: Utc::now(),
                }
            }
        };

        // No subscribers is fine.
        let _ = events.send(event);
    }
    debug!("Position poller stopped");
}
