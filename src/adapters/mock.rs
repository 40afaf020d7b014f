//! Simulated stage controller
//!
//! Provides an in-process controller that speaks the serial protocol over a
//! `tokio::io::duplex` pair, so the engine, poller and scan code can run
//! without hardware. All timing uses `tokio::time::sleep`.
//!
//! # Behaviour
//!
//! - Motion commands (`G`, `GR`, `U`, `D`, `M`, `SIS`) take `move_delay` plus a
//!   random jitter, optionally emit intermediate position lines, then reply `R`
//! - `K` or `I` arriving during a move aborts it where it stands; only the
//!   stop is acknowledged
//! - Any other bytes arriving before the current reply is written count as an
//!   overlap (the client broke request/response pairing)
//! - Faults can be injected: garbled replies and swallowed commands

use super::LineTransport;
use crate::protocol::{Axis, Position};
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{
    AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Reply sent in place of a real one while garbage injection is active.
const GARBAGE: &str = "#?\u{7f}!";

/// Knobs for [`SimulatedStage`].
#[derive(Debug, Clone)]
pub struct SimulatorSettings {
    /// Base duration of every motion command.
    pub move_delay: Duration,
    /// Upper bound of the random extra delay added to each motion.
    pub move_jitter: Duration,
    /// Intermediate position lines sent before a motion's `R`.
    pub noise_lines: usize,
    /// Whether a focus (Z) drive is fitted. Without it Z commands fail with E7.
    pub has_focus: bool,
    /// Reply to `SERIAL`.
    pub serial_number: String,
    /// Capacity of the duplex pipe in bytes.
    pub buffer_size: usize,
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            move_delay: Duration::from_millis(5),
            move_jitter: Duration::ZERO,
            noise_lines: 0,
            has_focus: true,
            serial_number: "40817".to_string(),
            buffer_size: 4096,
        }
    }
}

/// Controller registers the simulator keeps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatorSnapshot {
    pub position: Position,
    pub speed_xy: u8,
    pub speed_z: u8,
    pub acceleration_xy: u8,
    pub acceleration_z: u8,
    pub s_curve: u8,
    pub compatibility_mode: bool,
    pub joystick: bool,
    pub directions: [i8; 3],
}

impl Default for SimulatorSnapshot {
    fn default() -> Self {
        Self {
            position: Position::default(),
            speed_xy: 50,
            speed_z: 50,
            acceleration_xy: 50,
            acceleration_z: 50,
            s_curve: 0,
            compatibility_mode: false,
            joystick: true,
            directions: [1, 1, 1],
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    garbage: usize,
    silence: usize,
    external_busy: usize,
}

struct Shared {
    settings: SimulatorSettings,
    registers: Mutex<SimulatorSnapshot>,
    faults: Mutex<Faults>,
    commands: Mutex<Vec<String>>,
    position_replies: Mutex<Vec<Position>>,
    overlaps: AtomicUsize,
}

/// What a received command asks the controller to do.
enum Action {
    Reply(String),
    Move(Position),
    /// Set registers to the origin after moving there.
    Index,
    Silent,
}

enum MoveEnd {
    Completed,
    /// A stop command arrived mid-move; carries that command.
    Interrupted(String),
    Closed,
}

/// Handle to a running simulated controller.
///
/// # Example
///
/// ```rust,ignore
/// let (sim, transport) = SimulatedStage::spawn(SimulatorSettings::default());
/// let engine = ProtocolEngine::new(Box::new(transport), EngineSettings::default());
/// engine.move_to(Position::new(100, 200, 0)).await?;
/// assert_eq!(sim.position().await, Position::new(100, 200, 0));
/// ```
pub struct SimulatedStage {
    shared: Arc<Shared>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl SimulatedStage {
    /// Start a simulator and return the client end of its link.
    pub fn spawn(settings: SimulatorSettings) -> (Self, LineTransport<DuplexStream>) {
        let stage = Self {
            shared: Arc::new(Shared {
                settings,
                registers: Mutex::new(SimulatorSnapshot::default()),
                faults: Mutex::new(Faults::default()),
                commands: Mutex::new(Vec::new()),
                position_replies: Mutex::new(Vec::new()),
                overlaps: AtomicUsize::new(0),
            }),
            tasks: std::sync::Mutex::new(Vec::new()),
        };
        let transport = stage.connect();
        (stage, transport)
    }

    /// Open a fresh link to the same controller (as after a cable replug).
    pub fn connect(&self) -> LineTransport<DuplexStream> {
        let (client, device) = tokio::io::duplex(self.shared.settings.buffer_size);
        let task = tokio::spawn(serve(Arc::clone(&self.shared), device));
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(task);
        }
        LineTransport::new(client, "simulator")
    }

    /// Current physical position.
    pub async fn position(&self) -> Position {
        self.shared.registers.lock().await.position
    }

    /// Teleport the stage (test setup).
    pub async fn set_position(&self, position: Position) {
        self.shared.registers.lock().await.position = position;
    }

    /// Copy of every register.
    pub async fn snapshot(&self) -> SimulatorSnapshot {
        self.shared.registers.lock().await.clone()
    }

    /// Every command line received, in order.
    pub async fn commands(&self) -> Vec<String> {
        self.shared.commands.lock().await.clone()
    }

    /// Positions reported in answer to `P`, in order.
    pub async fn position_replies(&self) -> Vec<Position> {
        self.shared.position_replies.lock().await.clone()
    }

    /// Commands that arrived while a reply was still owed.
    pub fn overlaps(&self) -> usize {
        self.shared.overlaps.load(Ordering::SeqCst)
    }

    /// Replace the next `n` replies with unparseable bytes.
    pub async fn inject_garbage(&self, n: usize) {
        self.shared.faults.lock().await.garbage += n;
    }

    /// Swallow the next `n` commands without replying or acting.
    pub async fn inject_silence(&self, n: usize) {
        self.shared.faults.lock().await.silence += n;
    }

    /// Report busy to the next `n` `$` queries, as if the joystick were moving.
    pub async fn simulate_external_motion(&self, n: usize) {
        self.shared.faults.lock().await.external_busy += n;
    }
}

impl Drop for SimulatedStage {
    fn drop(&mut self) {
        if let Ok(tasks) = self.tasks.lock() {
            for task in tasks.iter() {
                task.abort();
            }
        }
    }
}

// =============================================================================
// Server loop
// =============================================================================

async fn serve(shared: Arc<Shared>, device: DuplexStream) {
    let (read_half, mut writer) = tokio::io::split(device);
    let mut reader = BufReader::new(read_half);
    let mut deferred: VecDeque<String> = VecDeque::new();

    loop {
        let line = match deferred.pop_front() {
            Some(line) => line,
            None => match read_command(&mut reader).await {
                Some(line) => line,
                None => break,
            },
        };
        if line.is_empty() {
            continue;
        }
        trace!("simulator <- {}", line);
        shared.commands.lock().await.push(line.clone());

        let lines = match shared.execute(&line).await {
            Action::Silent => continue,
            Action::Reply(reply) => {
                if input_pending(&mut reader) {
                    shared.note_overlap(&line);
                }
                vec![reply]
            }
            Action::Move(target) => {
                match run_move(&shared, target, &mut reader, &mut writer, &mut deferred).await {
                    MoveEnd::Completed => vec!["R".to_string()],
                    MoveEnd::Interrupted(stop) => {
                        shared.commands.lock().await.push(stop.clone());
                        debug!("simulator: '{}' aborted by '{}'", line, stop);
                        vec!["R".to_string()]
                    }
                    MoveEnd::Closed => break,
                }
            }
            Action::Index => {
                match run_move(&shared, Position::default(), &mut reader, &mut writer, &mut deferred)
                    .await
                {
                    MoveEnd::Completed => vec!["R".to_string()],
                    MoveEnd::Interrupted(stop) => {
                        shared.commands.lock().await.push(stop);
                        vec!["R".to_string()]
                    }
                    MoveEnd::Closed => break,
                }
            }
        };

        for reply in lines {
            let garbled = shared.take_garbage().await;
            let text = if garbled { GARBAGE.to_string() } else { reply };
            if line == "P" && !garbled {
                let position = shared.registers.lock().await.position;
                shared.position_replies.lock().await.push(position);
            }
            if write_reply(&mut writer, &text).await.is_err() {
                return;
            }
        }
    }
    debug!("simulator link closed");
}

async fn read_command(reader: &mut BufReader<ReadHalf<DuplexStream>>) -> Option<String> {
    let mut raw = Vec::new();
    match reader.read_until(b'\r', &mut raw).await {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(String::from_utf8_lossy(&raw).trim().to_string()),
    }
}

async fn write_reply(writer: &mut WriteHalf<DuplexStream>, line: &str) -> std::io::Result<()> {
    trace!("simulator -> {}", line);
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\r").await?;
    writer.flush().await
}

/// True when command bytes are already waiting.
fn input_pending(reader: &mut BufReader<ReadHalf<DuplexStream>>) -> bool {
    use futures::FutureExt;
    matches!(reader.fill_buf().now_or_never(), Some(Ok(buf)) if !buf.is_empty())
}

async fn has_input(reader: &mut BufReader<ReadHalf<DuplexStream>>) -> bool {
    matches!(reader.fill_buf().await, Ok(buf) if !buf.is_empty())
}

async fn run_move(
    shared: &Shared,
    target: Position,
    reader: &mut BufReader<ReadHalf<DuplexStream>>,
    writer: &mut WriteHalf<DuplexStream>,
    deferred: &mut VecDeque<String>,
) -> MoveEnd {
    let settings = &shared.settings;
    let jitter_ms = settings.move_jitter.as_millis() as u64;
    let jitter = if jitter_ms == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    };
    let segments = settings.noise_lines as u32 + 1;
    let total = settings.move_delay + jitter;
    let segment = total / segments;
    let origin = shared.registers.lock().await.position;
    let started = tokio::time::Instant::now();

    for step in 1..=segments {
        let deadline = tokio::time::Instant::now() + segment;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                input = has_input(reader) => {
                    if !input {
                        return MoveEnd::Closed;
                    }
                    let Some(line) = read_command(reader).await else {
                        return MoveEnd::Closed;
                    };
                    if line == "K" || line == "I" {
                        let elapsed = started.elapsed().min(total).as_millis() as i64;
                        let span = (total.as_millis() as i64).max(1);
                        let reached = interpolate(origin, target, elapsed, span);
                        shared.registers.lock().await.position = reached;
                        return MoveEnd::Interrupted(line);
                    }
                    shared.note_overlap(&line);
                    deferred.push_back(line);
                }
            }
        }

        if step < segments {
            let p = interpolate(origin, target, i64::from(step), i64::from(segments));
            let telemetry = format!("{},{},{}", p.x, p.y, p.z);
            if write_reply(writer, &telemetry).await.is_err() {
                return MoveEnd::Closed;
            }
        }
    }

    shared.registers.lock().await.position = target;
    MoveEnd::Completed
}

/// Point `num / den` of the way from `from` to `to`.
fn interpolate(from: Position, to: Position, num: i64, den: i64) -> Position {
    let lerp = |a: i64, b: i64| a + (b - a) * num / den;
    Position::new(lerp(from.x, to.x), lerp(from.y, to.y), lerp(from.z, to.z))
}

// =============================================================================
// Command interpreter
// =============================================================================

impl Shared {
    fn note_overlap(&self, line: &str) {
        let n = self.overlaps.fetch_add(1, Ordering::SeqCst) + 1;
        warn!("simulator: command '{}' overlapped an exchange ({} so far)", line, n);
    }

    async fn take_garbage(&self) -> bool {
        let mut faults = self.faults.lock().await;
        if faults.garbage > 0 {
            faults.garbage -= 1;
            true
        } else {
            false
        }
    }

    async fn execute(&self, line: &str) -> Action {
        {
            let mut faults = self.faults.lock().await;
            if faults.silence > 0 {
                faults.silence -= 1;
                return Action::Silent;
            }
        }

        let mut fields = line.split(',').map(str::trim);
        let mnemonic = fields.next().unwrap_or_default().to_ascii_uppercase();
        let args: Result<Vec<i64>, _> = fields.map(str::parse::<i64>).collect();
        let Ok(args) = args else {
            return reply("E4");
        };

        let focus = self.settings.has_focus;
        let mut regs = self.registers.lock().await;
        let here = regs.position;

        match (mnemonic.as_str(), args.as_slice()) {
            ("G", [x, y]) => Action::Move(Position::new(*x, *y, here.z)),
            ("G", [x, y, z]) if focus => Action::Move(Position::new(*x, *y, *z)),
            ("G", [_, _, _]) => reply("E7"),
            ("GR", [dx, dy]) => here.checked_offset(*dx, *dy, 0).map_or_else(|| reply("E8"), Action::Move),
            ("U", [dz]) if focus => here.checked_offset(0, 0, *dz).map_or_else(|| reply("E8"), Action::Move),
            ("D", [dz]) if focus => dz
                .checked_neg()
                .and_then(|dz| here.checked_offset(0, 0, dz))
                .map_or_else(|| reply("E8"), Action::Move),
            ("U" | "D", [_]) => reply("E7"),
            ("M", []) => Action::Move(Position::default()),
            ("SIS", []) => Action::Index,
            ("Z", []) => {
                regs.position = Position::default();
                reply("0")
            }
            ("K" | "I", []) => reply("R"),
            ("J", []) => {
                regs.joystick = true;
                reply("R")
            }
            ("H", []) => {
                regs.joystick = false;
                reply("R")
            }
            ("P", []) => reply(&format!("{},{},{}", here.x, here.y, here.z)),
            ("PX", []) => reply(&here.x.to_string()),
            ("PY", []) => reply(&here.y.to_string()),
            ("PZ", []) if focus => reply(&here.z.to_string()),
            ("PZ", []) => reply("E7"),
            ("$", []) => {
                drop(regs);
                let mut faults = self.faults.lock().await;
                if faults.external_busy > 0 {
                    faults.external_busy -= 1;
                    reply("3")
                } else {
                    reply("0")
                }
            }
            ("SMS", []) => reply(&regs.speed_xy.to_string()),
            ("SMZ", []) if focus => reply(&regs.speed_z.to_string()),
            ("SAS", []) => reply(&regs.acceleration_xy.to_string()),
            ("SAZ", []) if focus => reply(&regs.acceleration_z.to_string()),
            ("SMS", [v]) => set_register(*v, Axis::X, &mut regs.speed_xy),
            ("SMZ", [v]) if focus => set_register(*v, Axis::Z, &mut regs.speed_z),
            ("SAS", [v]) => set_register(*v, Axis::X, &mut regs.acceleration_xy),
            ("SAZ", [v]) if focus => set_register(*v, Axis::Z, &mut regs.acceleration_z),
            ("SMZ" | "SAZ", _) if !focus => reply("E7"),
            ("SCS", [v]) if (0..=100).contains(v) => {
                regs.s_curve = *v as u8;
                reply("0")
            }
            ("SCS", [_]) => reply("E8"),
            ("COMP", [m]) if *m == 0 || *m == 1 => {
                regs.compatibility_mode = *m == 1;
                reply("0")
            }
            ("XD" | "YD" | "ZD", [d]) if *d == 1 || *d == -1 => {
                let slot = match mnemonic.as_str() {
                    "XD" => 0,
                    "YD" => 1,
                    _ => 2,
                };
                regs.directions[slot] = *d as i8;
                reply("0")
            }
            ("XD" | "YD" | "ZD" | "COMP", _) => reply("E4"),
            ("SERIAL", []) => reply(&self.settings.serial_number),
            (
                "G" | "GR" | "U" | "D" | "M" | "SIS" | "Z" | "K" | "I" | "J" | "H" | "P" | "PX"
                | "PY" | "PZ" | "$" | "SMS" | "SMZ" | "SAS" | "SAZ" | "SCS" | "SERIAL",
                _,
            ) => reply("E4"),
            _ => reply("E5"),
        }
    }
}

fn reply(text: &str) -> Action {
    Action::Reply(text.to_string())
}

fn set_register(value: i64, axis: Axis, register: &mut u8) -> Action {
    match u8::try_from(value) {
        Ok(v) if axis.setting_range().contains(&v) => {
            *register = v;
            reply("0")
        }
        _ => reply("E8"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::Transport;

    async fn exchange(transport: &mut LineTransport<DuplexStream>, cmd: &str) -> String {
        transport.write_line(cmd).await.unwrap();
        transport.read_line().await.unwrap()
    }

    #[tokio::test]
    async fn test_queries_and_setters() {
        let (sim, mut link) = SimulatedStage::spawn(SimulatorSettings::default());
        sim.set_position(Position::new(3500, -1200, 7)).await;

        assert_eq!(exchange(&mut link, "P").await, "3500,-1200,7");
        assert_eq!(exchange(&mut link, "PY").await, "-1200");
        assert_eq!(exchange(&mut link, "SMS,40").await, "0");
        assert_eq!(exchange(&mut link, "SMS").await, "40");
        assert_eq!(exchange(&mut link, "SMZ,2").await, "E8");
        assert_eq!(exchange(&mut link, "XD,-1").await, "0");
        assert_eq!(exchange(&mut link, "SERIAL").await, "40817");
        assert_eq!(exchange(&mut link, "FOO").await, "E5");
        assert_eq!(exchange(&mut link, "G,abc").await, "E4");

        let regs = sim.snapshot().await;
        assert_eq!(regs.speed_xy, 40);
        assert_eq!(regs.directions, [-1, 1, 1]);
        assert_eq!(sim.position_replies().await, vec![Position::new(3500, -1200, 7)]);
        assert_eq!(sim.overlaps(), 0);
    }

    #[tokio::test]
    async fn test_move_emits_noise_then_ack() {
        let settings = SimulatorSettings {
            noise_lines: 2,
            ..Default::default()
        };
        let (sim, mut link) = SimulatedStage::spawn(settings);

        link.write_line("G,300,600").await.unwrap();
        assert_eq!(link.read_line().await.unwrap(), "100,200,0");
        assert_eq!(link.read_line().await.unwrap(), "200,400,0");
        assert_eq!(link.read_line().await.unwrap(), "R");
        assert_eq!(sim.position().await, Position::new(300, 600, 0));
    }

    #[tokio::test]
    async fn test_stop_aborts_move() {
        let settings = SimulatorSettings {
            move_delay: Duration::from_secs(5),
            ..Default::default()
        };
        let (sim, mut link) = SimulatedStage::spawn(settings);

        link.write_line("G,1000,0").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        link.write_line("K").await.unwrap();
        assert_eq!(link.read_line().await.unwrap(), "R");
        let stopped = sim.position().await;
        assert!(stopped.x < 1000 && stopped.y == 0, "{stopped}");
        assert_eq!(sim.overlaps(), 0);
        assert_eq!(sim.commands().await, vec!["G,1000,0", "K"]);
    }

    #[tokio::test]
    async fn test_overlap_is_counted() {
        let settings = SimulatorSettings {
            move_delay: Duration::from_millis(100),
            ..Default::default()
        };
        let (sim, mut link) = SimulatedStage::spawn(settings);

        link.write_line("G,10,10").await.unwrap();
        link.write_line("P").await.unwrap();
        assert_eq!(link.read_line().await.unwrap(), "R");
        assert_eq!(link.read_line().await.unwrap(), "10,10,0");
        assert_eq!(sim.overlaps(), 1);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let (sim, mut link) = SimulatedStage::spawn(SimulatorSettings::default());
        sim.inject_garbage(1).await;
        assert_eq!(exchange(&mut link, "P").await, GARBAGE);
        assert_eq!(exchange(&mut link, "P").await, "0,0,0");

        sim.simulate_external_motion(1).await;
        assert_eq!(exchange(&mut link, "$").await, "3");
        assert_eq!(exchange(&mut link, "$").await, "0");

        sim.inject_silence(1).await;
        link.write_line("P").await.unwrap();
        let silent = tokio::time::timeout(Duration::from_millis(30), link.read_line()).await;
        assert!(silent.is_err());
    }

    #[tokio::test]
    async fn test_missing_focus_drive() {
        let settings = SimulatorSettings {
            has_focus: false,
            ..Default::default()
        };
        let (_sim, mut link) = SimulatedStage::spawn(settings);
        assert_eq!(exchange(&mut link, "PZ").await, "E7");
        assert_eq!(exchange(&mut link, "U,10").await, "E7");
        assert_eq!(exchange(&mut link, "SMZ,50").await, "E7");
    }
}
