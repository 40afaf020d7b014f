//! Mover and poller sharing one link must never cross replies.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use stage_scan::adapters::{SimulatedStage, SimulatorSettings};
use stage_scan::poller::{PollerSettings, PositionEvent, PositionPoller};
use stage_scan::protocol::Position;
use stage_scan::{EngineSettings, ProtocolEngine};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mover_and_poller_never_interleave() {
    let (sim, transport) = SimulatedStage::spawn(SimulatorSettings {
        move_delay: Duration::from_millis(15),
        move_jitter: Duration::from_millis(10),
        noise_lines: 2,
        ..SimulatorSettings::default()
    });
    let engine = Arc::new(ProtocolEngine::new(
        Box::new(transport),
        EngineSettings::default(),
    ));
    let poller = PositionPoller::spawn(
        Arc::clone(&engine),
        PollerSettings {
            period: Duration::from_millis(3),
            channel_capacity: 4096,
        },
    );
    let mut events = poller.subscribe();

    let mover = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(2024);
            let mut targets = Vec::new();
            for _ in 0..30 {
                let target = Position::new(
                    rng.gen_range(-20_000..20_000),
                    rng.gen_range(-20_000..20_000),
                    rng.gen_range(-1_000..1_000),
                );
                engine.move_to(target).await?;
                targets.push(target);
                tokio::time::sleep(Duration::from_millis(rng.gen_range(0..5))).await;
            }
            Ok::<_, stage_scan::StageError>(targets)
        })
    };

    let targets = mover.await.unwrap().unwrap();
    poller.stop();
    poller.join().await;

    let mut observed = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            PositionEvent::Updated { position, .. } => observed.push(position),
            PositionEvent::Fault { reason, .. } => panic!("unexpected fault: {reason}"),
        }
    }

    assert_eq!(sim.overlaps(), 0);
    assert_eq!(sim.position_replies().await, observed);
    assert!(!observed.is_empty());

    // Every move completed and the stage rests on the last target.
    let moves = sim
        .commands()
        .await
        .iter()
        .filter(|c| c.starts_with("G,"))
        .count();
    assert_eq!(moves, targets.len());
    assert_eq!(sim.position().await, *targets.last().unwrap());

    // Each published position is either a target or the starting point.
    for p in &observed {
        assert!(
            *p == Position::default() || targets.contains(p),
            "poller saw an intermediate position {p}"
        );
    }
}
