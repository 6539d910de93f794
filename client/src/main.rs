mod demo;

use chrono::Utc;
use clap::Parser;
use client::{
    Connection, ConnectionState, ConnectionTarget, EchoConnection, NetworkConnection,
    OrderManager, RecordingConnection, ReplayConnection, Simulation, TickTime,
};
use demo::{DemoWorld, ATTACK, JOIN, MOVE};
use log::{error, info, warn};
use rand::Rng;
use shared::{
    CellPos, Client, ClientState, GameSave, Order, ReplayMetadata, ReplayRecorder, Session, Slot,
};
use std::error::Error;
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Relay address(es) to connect to, comma separated. Plays alone when omitted.
    #[arg(short = 's', long)]
    server: Option<String>,

    /// Player name announced in the lobby
    #[arg(short = 'n', long, default_value = "Player")]
    name: String,

    /// Players the host waits for before starting the game
    #[arg(short = 'p', long, default_value = "2")]
    players: usize,

    /// Number of frames to simulate before exiting
    #[arg(short = 'f', long, default_value = "200")]
    frames: i32,

    /// Real-time length of one frame in milliseconds
    #[arg(short = 't', long, default_value = "40")]
    timestep: u64,

    /// Frames of order latency announced by the host
    #[arg(long, default_value = "3")]
    order_latency: i32,

    /// Shared random seed announced by the host
    #[arg(long)]
    seed: Option<i32>,

    /// Keep per-frame sync reports for desync diagnostics
    #[arg(long)]
    sync_reports: bool,

    /// Record a replay into this directory
    #[arg(long)]
    record_dir: Option<PathBuf>,

    /// Write a game save here on exit
    #[arg(long)]
    save: Option<PathBuf>,

    /// Resume a single-player game save
    #[arg(long, conflicts_with_all = ["server", "replay"])]
    resume: Option<PathBuf>,

    /// Play back a replay file
    #[arg(long, conflicts_with = "server")]
    replay: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let connection = open_connection(&args)?;

    // A resumed save is matched against the rejoined lobby: the local
    // player back in the first slot.
    let session = match &args.resume {
        Some(_) => build_session(&[(connection.local_client_id(), args.name.clone())], 0, &args),
        None => Session::default(),
    };
    let mut manager = OrderManager::new(session, connection);
    let mut world = DemoWorld::new();

    if let Some(path) = &args.resume {
        info!("Resuming saved game from {}", path.display());
        manager.resume(&mut world, GameSave::load(path)?)?;
    } else if args.save.is_some() {
        manager.attach_game_save(GameSave::new());
    }

    run(&args, &mut manager, &mut world)?;

    info!(
        "Stopped at frame {} with sync hash {:#010x}",
        manager.net_frame_number(),
        world.sync_hash()
    );

    if let Some(path) = &args.save {
        match manager.game_save() {
            Some(save) => {
                save.save(path)?;
                info!("Game saved to {}", path.display());
            }
            None => warn!("No game save was recorded"),
        }
    }
    Ok(())
}

fn open_connection(args: &Args) -> Result<Box<dyn Connection>, Box<dyn Error>> {
    if let Some(path) = &args.replay {
        info!("Playing back {}", path.display());
        return Ok(Box::new(ReplayConnection::open(path)?));
    }

    match &args.server {
        Some(server) => {
            let target: ConnectionTarget = server.parse()?;
            info!("Connecting to {}", target);
            Ok(with_recording(NetworkConnection::connect(target)?, args))
        }
        None => Ok(with_recording(EchoConnection::new(), args)),
    }
}

fn with_recording<C: Connection + 'static>(connection: C, args: &Args) -> Box<dyn Connection> {
    let Some(dir) = &args.record_dir else {
        return Box::new(connection);
    };

    let name = format!("lockstep-{}", Utc::now().format("%Y%m%d-%H%M%S"));
    let mut recorder = ReplayRecorder::new(dir.clone(), name);
    recorder.set_metadata(ReplayMetadata::new("demo", vec![args.name.clone()]));
    Box::new(RecordingConnection::new(connection, recorder))
}

fn run(args: &Args, manager: &mut OrderManager, world: &mut DemoWorld) -> Result<(), Box<dyn Error>> {
    let start = Instant::now();
    let now_ms = || start.elapsed().as_millis() as u64;
    let mut tick_time = TickTime::new(args.timestep, now_ms());
    let mut lobby = Lobby::new(args);
    let mut rng = rand::thread_rng();

    loop {
        if let Err(e) = manager.tick_immediate(world) {
            if e.is_fatal() {
                error!("{}", e);
                return Err(e.into());
            }
            warn!("{}", e);
        }

        if !manager.is_game_started() {
            lobby.update(args, manager, world);
        }

        if manager.net_frame_number() > args.frames {
            break;
        }

        if manager.connection_state() == ConnectionState::NotConnected
            && !manager.is_ready_for_next_frame()
        {
            info!("Connection closed");
            break;
        }

        let now = now_ms();
        if !tick_time.should_advance(now) {
            std::thread::sleep(Duration::from_millis(1));
            continue;
        }

        if manager.is_ready_for_next_frame() {
            if args.replay.is_none() {
                manager.issue_orders(random_orders(&mut rng, manager.local_client_id(), world));
            }
            manager.tick(world)?;
        }
        tick_time.advance(now);
    }
    Ok(())
}

/// Drives the pre-game handshake: every client announces itself and the
/// host (client 1) starts the game once enough players have joined.
struct Lobby {
    announced: bool,
    started: bool,
    seed: i32,
}

impl Lobby {
    fn new(args: &Args) -> Self {
        Self {
            // Replays and resumed saves bring their own lobby orders.
            announced: args.replay.is_some() || args.resume.is_some(),
            started: args.replay.is_some() || args.resume.is_some(),
            seed: args.seed.unwrap_or_else(|| rand::thread_rng().gen()),
        }
    }

    fn update(&mut self, args: &Args, manager: &mut OrderManager, world: &DemoWorld) {
        if manager.connection_state() != ConnectionState::Connected && args.server.is_some() {
            return;
        }

        if !self.announced {
            manager.issue_order(Order::immediate(JOIN, args.name.clone()));
            self.announced = true;
        }

        let required = if args.server.is_some() { args.players.max(1) } else { 1 };
        let is_host = manager.local_client_id() == 1;
        if self.started || !is_host || world.joined().len() < required {
            return;
        }

        let session = build_session(world.joined(), self.seed, args);
        info!(
            "Starting game with {} players (seed {})",
            session.clients.len(),
            self.seed
        );
        manager.issue_orders([Order::sync_info(session.to_text()), Order::start_game("")]);
        self.started = true;
    }
}

fn build_session(joined: &[(i32, String)], seed: i32, args: &Args) -> Session {
    let mut session = Session::default();
    session.global.map = "demo".to_string();
    session.global.random_seed = seed;
    session.global.order_latency = args.order_latency.max(1);
    session.global.enable_sync_reports = args.sync_reports;

    for (n, (index, name)) in joined.iter().enumerate() {
        let reference = format!("Multi{}", n);
        session.slots.push(Slot::new(reference.clone()));

        let mut client = Client::new(*index, name.clone());
        client.slot = Some(reference);
        client.team = n as i32 + 1;
        client.state = ClientState::Ready;
        session.clients.push(client);
    }
    session
}

/// Simulated player input: now and then move our unit or attack another.
fn random_orders(rng: &mut impl Rng, local_client: i32, world: &DemoWorld) -> Vec<Order> {
    let unit = DemoWorld::unit_for(local_client);
    if !world.has_unit(unit) || !rng.gen_bool(0.3) {
        return Vec::new();
    }

    let targets: Vec<u32> = world.unit_ids().into_iter().filter(|&id| id != unit).collect();
    if !targets.is_empty() && rng.gen_bool(0.25) {
        let target = targets[rng.gen_range(0..targets.len())];
        return vec![Order::new(ATTACK, Some(unit)).with_target_actor(target)];
    }

    let cell = CellPos::new(rng.gen_range(0..64), rng.gen_range(0..64));
    vec![Order::new(MOVE, Some(unit)).with_target_location(cell)]
}
