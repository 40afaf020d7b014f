//! Protocol engine behaviour against the simulated controller.

use stage_scan::adapters::{SimulatedStage, SimulatorSettings};
use stage_scan::error_recovery::RetryPolicy;
use stage_scan::motion::MotionState;
use stage_scan::protocol::{Command, ErrorKind, Position, Response};
use stage_scan::{EngineSettings, ProtocolEngine, StageError, TransportError};
use std::sync::Arc;
use std::time::Duration;

fn fast_settings() -> EngineSettings {
    EngineSettings {
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        },
        read_timeout: Duration::from_millis(100),
        motion_timeout: Duration::from_secs(5),
        ..EngineSettings::default()
    }
}

fn connect(settings: SimulatorSettings) -> (SimulatedStage, Arc<ProtocolEngine>) {
    let (sim, transport) = SimulatedStage::spawn(settings);
    let engine = Arc::new(ProtocolEngine::new(Box::new(transport), fast_settings()));
    (sim, engine)
}

#[tokio::test]
async fn emergency_stop_preempts_long_move() {
    let (sim, engine) = connect(SimulatorSettings {
        move_delay: Duration::from_secs(2),
        ..SimulatorSettings::default()
    });

    let mover = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.move_to(Position::new(10_000, 0, 0)).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(engine.state(), MotionState::Busy);

    let started = std::time::Instant::now();
    engine.emergency_stop().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));

    let result = mover.await.unwrap();
    assert!(matches!(result, Err(StageError::Preempted { .. })));
    assert_eq!(engine.state(), MotionState::Idle);
    assert_eq!(engine.last_known_position(), None);

    let stopped_at = sim.position().await;
    assert!(stopped_at.x > 0 && stopped_at.x < 10_000, "{stopped_at}");
    assert_eq!(sim.commands().await, vec!["G,10000,0,0", "K"]);

    // The link is usable again and reports where the stage stopped.
    assert_eq!(engine.query_position().await.unwrap(), stopped_at);
}

#[tokio::test]
async fn queued_motion_is_dropped_by_emergency_stop() {
    let (sim, engine) = connect(SimulatorSettings {
        move_delay: Duration::from_millis(500),
        ..SimulatorSettings::default()
    });

    let first = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.move_to(Position::new(2000, 0, 0)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.move_to(Position::new(0, 2000, 0)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    engine.emergency_stop().await.unwrap();

    assert!(matches!(first.await.unwrap(), Err(StageError::Preempted { .. })));
    // The queued move takes the link before the stop does and sees the flag.
    assert!(matches!(second.await.unwrap(), Err(StageError::Preempted { .. })));
    let commands = sim.commands().await;
    assert!(!commands.iter().any(|c| c == "G,0,2000,0"), "{commands:?}");
}

#[tokio::test]
async fn cancelled_emergency_stop_does_not_block_later_moves() {
    let (sim, engine) = connect(SimulatorSettings::default());

    // An unanswered query keeps the link for one read timeout before retrying.
    sim.inject_silence(1).await;
    let query = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.query_position().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let cancelled = tokio::time::timeout(Duration::from_millis(40), engine.emergency_stop()).await;
    assert!(cancelled.is_err(), "stop should still be waiting for the link");

    assert_eq!(query.await.unwrap().unwrap(), Position::default());
    engine.move_to(Position::new(100, 0, 0)).await.unwrap();
    engine.move_to(Position::new(200, 0, 0)).await.unwrap();
    assert_eq!(engine.state(), MotionState::Idle);
    assert_eq!(sim.position().await, Position::new(200, 0, 0));
    assert!(!sim.commands().await.iter().any(|c| c == "K"));
}

#[tokio::test]
async fn garbled_stop_reply_is_retried() {
    let (sim, engine) = connect(SimulatorSettings {
        move_delay: Duration::from_millis(400),
        ..SimulatorSettings::default()
    });

    let mover = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.move_to(Position::new(2000, 0, 0)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    sim.inject_garbage(1).await;

    engine.emergency_stop().await.unwrap();
    assert!(matches!(mover.await.unwrap(), Err(StageError::Preempted { .. })));
    assert_eq!(engine.state(), MotionState::Idle);
    tokio::time::timeout(
        Duration::from_secs(1),
        engine.tracker().wait_until_idle(Duration::from_millis(10)),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(sim.commands().await, vec!["G,2000,0,0", "K", "K"]);
}

#[tokio::test]
async fn unanswered_stop_faults_the_stage() {
    let (sim, engine) = connect(SimulatorSettings::default());
    sim.inject_silence(3).await;

    let err = engine.emergency_stop().await.unwrap_err();
    assert!(matches!(
        err,
        StageError::Transport(TransportError::Timeout { .. })
    ));
    assert_eq!(engine.state(), MotionState::Faulted);
    assert!(matches!(
        engine.tracker().wait_until_idle(Duration::from_millis(10)).await,
        Err(StageError::Faulted)
    ));

    engine.reopen(Box::new(sim.connect())).await.unwrap();
    engine.move_to(Position::new(0, 50, 0)).await.unwrap();
    assert_eq!(engine.state(), MotionState::Idle);
}

#[tokio::test]
async fn overflowing_relative_move_is_rejected() {
    let (sim, engine) = connect(SimulatorSettings::default());
    engine.move_to(Position::new(100, 0, 0)).await.unwrap();

    assert!(matches!(
        engine.move_relative(i64::MAX, 0).await,
        Err(StageError::Validation(_))
    ));
    assert!(matches!(
        engine.move_relative_z(i64::MAX).await,
        Err(StageError::Validation(_))
    ));
    assert_eq!(sim.commands().await, vec!["G,100,0,0"]);
    assert_eq!(engine.last_known_position(), Some(Position::new(100, 0, 0)));
}

#[tokio::test]
async fn stop_is_an_ordinary_command() {
    let (sim, engine) = connect(SimulatorSettings::default());
    engine.move_to(Position::new(100, 100, 0)).await.unwrap();
    engine.stop().await.unwrap();
    assert_eq!(engine.state(), MotionState::Idle);
    assert_eq!(sim.commands().await.last().map(String::as_str), Some("I"));
}

#[tokio::test]
async fn wait_until_settled_rides_out_external_motion() {
    let (sim, engine) = connect(SimulatorSettings::default());
    sim.simulate_external_motion(3).await;

    engine
        .wait_until_settled(Duration::from_millis(1), Duration::from_secs(1))
        .await
        .unwrap();

    let polls = sim.commands().await.iter().filter(|c| *c == "$").count();
    assert_eq!(polls, 4);
}

#[tokio::test]
async fn wait_until_settled_gives_up_after_budget() {
    let (sim, engine) = connect(SimulatorSettings::default());
    sim.simulate_external_motion(1000).await;

    let err = engine
        .wait_until_settled(Duration::from_millis(5), Duration::from_millis(30))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StageError::Transport(TransportError::Timeout { .. })
    ));
    // A settle timeout is not a link failure.
    assert_eq!(engine.state(), MotionState::Idle);
}

#[tokio::test]
async fn lost_motion_completion_faults() {
    let (sim, transport) = SimulatedStage::spawn(SimulatorSettings::default());
    let engine = ProtocolEngine::new(
        Box::new(transport),
        EngineSettings {
            motion_timeout: Duration::from_millis(100),
            ..fast_settings()
        },
    );
    sim.inject_silence(1).await;

    let err = engine.move_to(Position::new(500, 0, 0)).await.unwrap_err();
    assert!(matches!(
        err,
        StageError::Transport(TransportError::Timeout { .. })
    ));
    assert_eq!(engine.state(), MotionState::Faulted);
    assert!(err.is_fatal());

    // Motion commands are never re-sent.
    assert_eq!(sim.commands().await, vec!["G,500,0,0"]);
    assert!(matches!(
        engine.move_to(Position::new(0, 0, 0)).await,
        Err(StageError::Faulted)
    ));

    engine.reopen(Box::new(sim.connect())).await.unwrap();
    engine.move_to(Position::new(0, 300, 0)).await.unwrap();
    assert_eq!(sim.position().await, Position::new(0, 300, 0));
}

#[tokio::test]
async fn rejected_motion_returns_to_idle() {
    let (_sim, engine) = connect(SimulatorSettings {
        has_focus: false,
        ..SimulatorSettings::default()
    });

    let response = engine.send(Command::MoveRelativeZ { dz: 10 }).await.unwrap();
    assert_eq!(response, Response::ErrorCode(ErrorKind::NoFocus));
    assert_eq!(engine.state(), MotionState::Idle);

    let err = engine.move_relative_z(10).await.unwrap_err();
    assert!(matches!(
        err,
        StageError::Protocol {
            kind: ErrorKind::NoFocus,
            ..
        }
    ));
    assert!(!err.is_fatal());
}

#[tokio::test]
async fn concurrent_callers_are_serialized() {
    let (sim, engine) = connect(SimulatorSettings {
        move_delay: Duration::from_millis(20),
        ..SimulatorSettings::default()
    });

    let mut tasks = Vec::new();
    for i in 0..8i64 {
        let engine = Arc::clone(&engine);
        tasks.push(tokio::spawn(async move {
            if i % 2 == 0 {
                engine.move_to(Position::new(i * 100, 0, 0)).await.map(|_| ())
            } else {
                engine.query_position().await.map(|_| ())
            }
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(sim.overlaps(), 0);
    assert_eq!(sim.commands().await.len(), 8);
    assert_eq!(engine.state(), MotionState::Idle);
}
