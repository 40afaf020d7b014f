//! stage-scan CLI
//!
//! Drives a stage controller from the command line, or an in-process
//! simulator with `--simulate`.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use stage_scan::adapters::serial_adapter::{discover_controller, SerialTransportBuilder};
use stage_scan::adapters::{SimulatedStage, SimulatorSettings, Transport};
use stage_scan::config::StageConfig;
use stage_scan::grid::{Course, GridDefinition, GridExtent};
use stage_scan::poller::PositionEvent;
use stage_scan::protocol::{Axis, Position};
use stage_scan::scan::{ScanExecutor, Tile, TileHandler};
use stage_scan::{ProtocolEngine, Stage};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// stage-scan
#[derive(Parser, Debug)]
#[command(name = "stage-scan")]
#[command(about = "Control a serial microscope stage and plan tile scans")]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = stage_scan::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Talk to a built-in simulated controller instead of a serial port
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Probe serial ports for a controller
    Discover,

    /// Print the current position
    Position,

    /// Move to an absolute position, or by an offset with --relative
    Move {
        x: i64,
        y: i64,
        /// Focus position (absolute moves only)
        #[arg(long)]
        z: Option<i64>,
        #[arg(long)]
        relative: bool,
    },

    /// Move to the home position
    Home,

    /// Make the current position the new origin
    SetHome,

    /// Run the controller's stage indexing routine
    Index,

    /// Halt all motion immediately
    Estop,

    /// Print speed and acceleration settings
    Settings,

    /// Print position updates from the background poller
    Watch {
        /// How long to watch
        #[arg(long, default_value = "5s", value_parser = humantime_serde::re::humantime::parse_duration)]
        duration: Duration,
    },

    /// Print a grid plan as JSON without moving
    Plan(GridArgs),

    /// Visit every tile of a grid
    Scan(GridArgs),
}

#[derive(Args, Debug)]
struct GridArgs {
    /// First anchor as x,y
    #[arg(long, value_parser = parse_point, default_value = "0,0")]
    start: (i64, i64),

    /// Cover up to this point (x,y)
    #[arg(long, value_parser = parse_point, conflicts_with = "matrix")]
    to: Option<(i64, i64)>,

    /// Explicit tile counts as columns,rows
    #[arg(long, value_parser = parse_matrix)]
    matrix: Option<(u32, u32)>,

    /// Course: V_RIGHT, V_LEFT, H_RIGHT or H_LEFT
    #[arg(long)]
    course: Option<Course>,
}

fn parse_point(s: &str) -> Result<(i64, i64), String> {
    let (x, y) = s.split_once(',').ok_or("expected x,y")?;
    Ok((
        x.trim().parse().map_err(|e| format!("{e}"))?,
        y.trim().parse().map_err(|e| format!("{e}"))?,
    ))
}

fn parse_matrix(s: &str) -> Result<(u32, u32), String> {
    let (c, r) = s.split_once(',').ok_or("expected columns,rows")?;
    Ok((
        c.trim().parse().map_err(|e| format!("{e}"))?,
        r.trim().parse().map_err(|e| format!("{e}"))?,
    ))
}

impl GridArgs {
    fn definition(&self, config: &StageConfig) -> Result<GridDefinition> {
        let extent = match (self.to, self.matrix) {
            (Some(point), None) => GridExtent::FinalPoint(point),
            (None, Some((columns, rows))) => GridExtent::Matrix { columns, rows },
            _ => bail!("give exactly one of --to or --matrix"),
        };
        Ok(GridDefinition {
            start: self.start,
            tile_size: config.scan.tile_size,
            non_overlap: config.scan.non_overlap,
            course: self.course.unwrap_or(config.scan.course),
            extent,
        })
    }
}

/// Logs each tile; acquisition hooks in here.
struct LogTiles;

#[async_trait]
impl TileHandler for LogTiles {
    async fn on_tile(&mut self, tile: &Tile) -> Result<()> {
        info!(index = tile.index, "tile at {}", tile.position);
        Ok(())
    }
}

/// Open the configured link. The simulator handle must outlive the engine.
async fn open_transport(
    cli: &Cli,
    config: &StageConfig,
) -> Result<(Box<dyn Transport>, Option<SimulatedStage>)> {
    if cli.simulate {
        let settings = SimulatorSettings {
            move_delay: Duration::from_millis(200),
            move_jitter: Duration::from_millis(50),
            has_focus: config.protocol.axes >= 3,
            ..SimulatorSettings::default()
        };
        let (sim, transport) = SimulatedStage::spawn(settings);
        info!("Using simulated stage controller");
        return Ok((Box::new(transport), Some(sim)));
    }

    let (port, baud_rate) = match &config.serial.port {
        Some(port) => (port.clone(), config.serial.baud_rate),
        None => {
            let found = discover_controller(
                &config.serial.probe_baud_rates,
                config.serial.probe_timeout,
            )
            .await?
            .context("no stage controller found; set serial.port in the config")?;
            (found.port_name, found.baud_rate)
        }
    };

    let transport = SerialTransportBuilder::new(port, baud_rate)
        .with_timeout(config.serial.read_timeout)
        .with_line_terminator(config.serial.command_terminator.clone())
        .with_response_delimiter(config.serial.delimiter_byte()?)
        .open()?;
    Ok((Box::new(transport), None))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = StageConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.application.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Commands::Discover = cli.command {
        match discover_controller(&config.serial.probe_baud_rates, config.serial.probe_timeout)
            .await?
        {
            Some(port) => println!(
                "{} @ {} baud (serial {})",
                port.port_name, port.baud_rate, port.reply
            ),
            None => println!("No stage controller found"),
        }
        return Ok(());
    }

    if let Commands::Plan(args) = &cli.command {
        let plan = config.planner().plan(&args.definition(&config)?)?;
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    let (transport, _sim) = open_transport(&cli, &config).await?;
    let engine = Arc::new(ProtocolEngine::new(transport, config.engine_settings()));
    info!("{} connected via {}", config.application.name, engine.describe().await);

    match &cli.command {
        Commands::Position => println!("{}", engine.query_position().await?),
        Commands::Move { x, y, z, relative } => {
            if *relative {
                engine.move_relative(*x, *y).await?;
            } else {
                let z = match z {
                    Some(z) => *z,
                    None => engine.query_position().await?.z,
                };
                engine.move_to(Position::new(*x, *y, z)).await?;
            }
            println!("{}", engine.query_position().await?);
        }
        Commands::Home => engine.home().await?,
        Commands::SetHome => engine.set_home().await?,
        Commands::Index => engine.index_stage().await?,
        Commands::Estop => engine.emergency_stop().await?,
        Commands::Settings => {
            let mut axes = vec![("XY", Axis::X)];
            if config.protocol.axes >= 3 {
                axes.push(("Z", Axis::Z));
            }
            for (label, axis) in axes {
                println!(
                    "{label}: speed {} acceleration {}",
                    engine.speed(axis).await?,
                    engine.acceleration(axis).await?
                );
            }
        }
        Commands::Watch { duration } => {
            let stage = Stage::new(Arc::clone(&engine), config.poller.clone(), config.planner());
            let mut events = stage.subscribe_events();
            let deadline = tokio::time::sleep(*duration);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    event = events.recv() => match event {
                        Ok(PositionEvent::Updated { position, .. }) => println!("{position}"),
                        Ok(PositionEvent::Fault { reason, .. }) => warn!("poll fault: {}", reason),
                        Err(broadcast::error::RecvError::Lagged(n)) => warn!("skipped {} updates", n),
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            stage.shutdown().await;
        }
        Commands::Scan(args) => {
            let plan = config.planner().plan(&args.definition(&config)?)?;
            let executor = ScanExecutor::new(Arc::clone(&engine), config.scan.clone());
            let abort = executor.abort_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, stopping after the current tile");
                    abort.abort();
                }
            });
            let report = executor.run(&plan, &mut LogTiles).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Discover | Commands::Plan(_) => {}
    }

    Ok(())
}
