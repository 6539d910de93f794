//! Integration tests for the lockstep layer
//!
//! These tests run real relays on loopback sockets and drive several
//! order managers side by side, the way independent game clients would.

use client::{
    Connection, ConnectionState, ConnectionTarget, DesyncKind, EchoConnection, LockstepError,
    NetworkConnection, OrderManager, RecordingConnection, ReplayConnection, Simulation,
};
use server::RelayServer;
use shared::{Client, GameSave, Order, ReplayRecorder, Session, Slot};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

const TIMEOUT: Duration = Duration::from_secs(10);

/// Adds the subject of every `Add` order to a running total. A non-zero
/// `bias` makes the world diverge from its peers.
#[derive(Default)]
struct CounterWorld {
    total: i32,
    bias: i32,
    orders_seen: usize,
}

impl CounterWorld {
    fn with_bias(bias: i32) -> Self {
        Self {
            bias,
            ..Default::default()
        }
    }
}

impl Simulation for CounterWorld {
    fn sync_hash(&self) -> i32 {
        self.total
    }

    fn process_order(&mut self, _session: &Session, _client: i32, order: &Order) {
        if order.order_string == "Add" {
            self.total += order.subject.unwrap_or(0) as i32 + self.bias;
            self.orders_seen += 1;
        }
    }
}

fn add(amount: u32) -> Order {
    Order::new("Add", Some(amount))
}

fn session_for(clients: &[i32]) -> Session {
    let mut session = Session::default();
    for (n, index) in clients.iter().enumerate() {
        let reference = format!("Multi{}", n);
        session.slots.push(Slot::new(reference.clone()));
        let mut client = Client::new(*index, format!("Player {}", index));
        client.slot = Some(reference);
        session.clients.push(client);
    }
    session
}

/// A relay running on its own thread and runtime, stopped on drop.
struct RelayHandle {
    addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl RelayHandle {
    fn start(max_clients: usize, record_dir: Option<PathBuf>) -> Self {
        let (addr_tx, addr_rx) = std::sync::mpsc::channel();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let thread = thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async move {
                let mut relay = RelayServer::bind("127.0.0.1:0", max_clients).await.unwrap();
                if let Some(dir) = record_dir {
                    relay = relay.with_recorder(ReplayRecorder::new(dir, "relay"));
                }
                addr_tx.send(relay.local_addr().unwrap()).unwrap();
                relay
                    .run_until(async {
                        let _ = stop_rx.await;
                    })
                    .await
                    .unwrap();
            });
        });

        Self {
            addr: addr_rx.recv().unwrap(),
            stop: Some(stop_tx),
            thread: Some(thread),
        }
    }

    fn target(&self) -> ConnectionTarget {
        self.addr.to_string().parse().unwrap()
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < TIMEOUT {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}

fn connect(relay: &RelayHandle) -> OrderManager {
    let connection = NetworkConnection::connect(relay.target()).unwrap();
    let manager = OrderManager::new(Session::default(), Box::new(connection));
    assert!(
        wait_until(|| manager.connection_state() == ConnectionState::Connected),
        "client failed to connect"
    );
    manager
}

/// Drives one manager for a single real-time tick.
fn step(
    manager: &mut OrderManager,
    world: &mut CounterWorld,
    orders: impl FnOnce(i32) -> Vec<Order>,
) -> Result<(), LockstepError> {
    manager.tick_immediate(world)?;
    if manager.is_ready_for_next_frame() {
        manager.issue_orders(orders(manager.net_frame_number()));
        manager.tick(world)?;
    }
    Ok(())
}

fn first_replay_in(dir: &Path) -> PathBuf {
    std::fs::read_dir(dir)
        .unwrap()
        .next()
        .expect("no replay was written")
        .unwrap()
        .path()
}

/// RELAY PROTOCOL TESTS
mod relay_tests {
    use super::*;

    /// Tests the handshake hands out ids in connection order
    #[test]
    fn handshake_assigns_ids_in_order() {
        let relay = RelayHandle::start(4, None);
        let first = connect(&relay);
        let second = connect(&relay);

        assert_eq!(first.local_client_id(), 1);
        assert_eq!(second.local_client_id(), 2);
    }

    /// Tests immediate orders reach the other client and are echoed locally
    #[test]
    fn immediate_orders_reach_every_client() {
        let relay = RelayHandle::start(4, None);
        let mut a = NetworkConnection::connect(relay.target()).unwrap();
        let mut b = NetworkConnection::connect(relay.target()).unwrap();
        assert!(wait_until(|| a.connection_state() == ConnectionState::Connected
            && b.connection_state() == ConnectionState::Connected));

        a.send_immediate(&[Order::chat("hello")]).unwrap();

        let mut at_a = Vec::new();
        let mut at_b = Vec::new();
        assert!(wait_until(|| {
            at_a.extend(a.receive());
            at_b.extend(b.receive());
            !at_a.is_empty() && !at_b.is_empty()
        }));

        let sender = a.local_client_id();
        assert_eq!(at_a[0].from, sender);
        assert_eq!(at_b[0].from, sender);
        assert_eq!(at_a[0].packet, at_b[0].packet);
    }

    /// Tests a failing endpoint leaves the connection NotConnected with an error
    #[test]
    fn unreachable_relay_reports_error() {
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let target: ConnectionTarget = addr.to_string().parse().unwrap();
        let connection = NetworkConnection::connect(target).unwrap();

        assert!(wait_until(|| connection.connection_state() == ConnectionState::NotConnected));
        assert!(connection.error().is_some());
    }

    /// Tests a relay speaking another protocol version is refused
    #[test]
    fn protocol_version_mismatch_is_refused() {
        use std::io::{Read, Write};

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let stub = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream
                .write_all(&(shared::PROTOCOL_VERSION + 1).to_le_bytes())
                .unwrap();
            stream.write_all(&1i32.to_le_bytes()).unwrap();
            let mut buf = [0u8; 1];
            let _ = stream.read(&mut buf);
        });

        let target: ConnectionTarget = addr.to_string().parse().unwrap();
        let connection = NetworkConnection::connect(target).unwrap();
        assert!(wait_until(|| connection.connection_state() == ConnectionState::NotConnected));

        let error = connection.error().expect("handshake error");
        assert!(error.contains("version mismatch"), "{}", error);
        assert_eq!(connection.local_client_id(), 0);

        drop(connection);
        stub.join().unwrap();
    }
}

/// MULTIPLAYER LOCKSTEP TESTS
mod lockstep_tests {
    use super::*;

    fn start_two_player_game(relay: &RelayHandle) -> (OrderManager, OrderManager) {
        let mut host = connect(relay);
        let guest = connect(relay);
        let session = session_for(&[host.local_client_id(), guest.local_client_id()]);
        host.issue_orders([Order::sync_info(session.to_text()), Order::start_game("")]);
        (host, guest)
    }

    /// Tests two clients simulate identical worlds over a real relay
    #[test]
    fn two_clients_stay_in_sync() {
        let relay = RelayHandle::start(4, None);
        let (mut host, mut guest) = start_two_player_game(&relay);
        let mut host_world = CounterWorld::default();
        let mut guest_world = CounterWorld::default();

        let reached = wait_until(|| {
            step(&mut host, &mut host_world, |f| vec![add(f as u32)]).unwrap();
            step(&mut guest, &mut guest_world, |f| {
                if f % 2 == 0 {
                    vec![add(100)]
                } else {
                    Vec::new()
                }
            })
            .unwrap();
            host.net_frame_number() > 20 && guest.net_frame_number() > 20
        });
        assert!(reached, "clients did not reach frame 20");

        // Drain the last frames so both have applied the same set.
        while host.net_frame_number() != guest.net_frame_number() {
            let (behind, world) = if host.net_frame_number() < guest.net_frame_number() {
                (&mut host, &mut host_world)
            } else {
                (&mut guest, &mut guest_world)
            };
            assert!(wait_until(|| {
                behind.tick_immediate(world).unwrap();
                behind.is_ready_for_next_frame()
            }));
            behind.tick(world).unwrap();
        }

        assert!(host_world.orders_seen > 0);
        assert_eq!(host_world.total, guest_world.total);
        assert!(host.out_of_sync_frame().is_none());
        assert!(guest.out_of_sync_frame().is_none());
    }

    /// Tests a diverging world is caught and the culprit order is named
    #[test]
    fn diverging_world_is_detected() {
        let relay = RelayHandle::start(4, None);
        let (mut host, mut guest) = start_two_player_game(&relay);
        let host_id = host.local_client_id();
        let mut host_world = CounterWorld::default();
        let mut guest_world = CounterWorld::with_bias(1);

        let mut sent = false;
        let mut desync = None;
        assert!(wait_until(|| {
            let host_result = step(&mut host, &mut host_world, |_| {
                if sent {
                    Vec::new()
                } else {
                    sent = true;
                    vec![add(5)]
                }
            });
            let guest_result = step(&mut guest, &mut guest_world, |_| Vec::new());
            desync = host_result.err().or(guest_result.err());
            desync.is_some()
        }));

        match desync {
            Some(LockstepError::Desync {
                kind: DesyncKind::Order { index, culprit },
                ..
            }) => {
                assert_eq!(index, 0);
                let culprit = culprit.expect("culprit order");
                assert_eq!(culprit.client, host_id);
                assert_eq!(culprit.order.order_string, "Add");
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert!(host.out_of_sync_frame().is_some() || guest.out_of_sync_frame().is_some());
    }

    /// Tests a disconnecting client stops blocking the remaining one
    #[test]
    fn quitting_client_unblocks_frames() {
        let relay = RelayHandle::start(4, None);
        let (mut host, mut guest) = start_two_player_game(&relay);
        let mut host_world = CounterWorld::default();
        let mut guest_world = CounterWorld::default();

        assert!(wait_until(|| {
            step(&mut host, &mut host_world, |_| Vec::new()).unwrap();
            step(&mut guest, &mut guest_world, |_| Vec::new()).unwrap();
            host.net_frame_number() > 5 && guest.net_frame_number() > 5
        }));
        drop(guest);

        assert!(wait_until(|| {
            step(&mut host, &mut host_world, |_| vec![add(1)]).unwrap();
            host.net_frame_number() > 40
        }));
    }
}

/// SAVE AND REPLAY TESTS
mod persistence_tests {
    use super::*;

    fn start_single_player(connection: Box<dyn Connection>) -> OrderManager {
        let mut manager = OrderManager::new(Session::default(), connection);
        manager.issue_orders([
            Order::sync_info(session_for(&[1]).to_text()),
            Order::start_game(""),
        ]);
        manager
    }

    /// Tests a saved game resumes into the same world and keeps going
    #[test]
    fn save_then_resume_matches_original() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("game.orasav");

        let mut original = start_single_player(Box::new(EchoConnection::new()));
        original.attach_game_save(GameSave::new());
        let mut world = CounterWorld::default();
        while original.net_frame_number() <= 10 {
            step(&mut original, &mut world, |f| vec![add(f as u32)]).unwrap();
        }
        original.game_save().unwrap().save(&path).unwrap();

        // The rejoined lobby: the same client back in its old slot.
        let mut resumed = OrderManager::new(session_for(&[1]), Box::new(EchoConnection::new()));
        let mut resumed_world = CounterWorld::default();
        resumed
            .resume(&mut resumed_world, GameSave::load(&path).unwrap())
            .unwrap();
        assert!(resumed.is_game_started());
        assert_eq!(resumed.session().clients.len(), 1);

        while resumed.net_frame_number() <= 10 {
            step(&mut resumed, &mut resumed_world, |_| Vec::new()).unwrap();
        }
        assert_eq!(resumed_world.total, world.total);

        // Both continue with identical input past the saved frames.
        for _ in 0..10 {
            step(&mut original, &mut world, |f| vec![add(f as u32 * 2)]).unwrap();
            step(&mut resumed, &mut resumed_world, |f| vec![add(f as u32 * 2)]).unwrap();
        }
        assert_eq!(original.net_frame_number(), resumed.net_frame_number());
        assert_eq!(resumed_world.total, world.total);
    }

    /// Tests resuming into a world that no longer matches the save is caught
    /// at the saved sync frame
    #[test]
    fn resume_into_diverged_world_desyncs() {
        let mut original = start_single_player(Box::new(EchoConnection::new()));
        original.attach_game_save(GameSave::new());
        let mut world = CounterWorld::default();
        while original.net_frame_number() <= 10 {
            step(&mut original, &mut world, |f| vec![add(f as u32)]).unwrap();
        }
        let save = original.take_game_save().unwrap();
        let saved_sync_frame = save.last_sync_frame();
        assert!(saved_sync_frame > 5);

        let mut resumed = OrderManager::new(session_for(&[1]), Box::new(EchoConnection::new()));
        let mut resumed_world = CounterWorld::with_bias(1);
        resumed.resume(&mut resumed_world, save).unwrap();

        let mut desync = None;
        for _ in 0..50 {
            if let Err(e) = step(&mut resumed, &mut resumed_world, |_| Vec::new()) {
                desync = Some(e);
                break;
            }
        }

        match desync {
            Some(LockstepError::Desync { frame, .. }) => assert_eq!(frame, saved_sync_frame),
            other => panic!("expected a desync, got {:?}", other),
        }
        assert_eq!(resumed.out_of_sync_frame(), Some(saved_sync_frame));
    }

    /// Tests a recorded game plays back to the same result
    #[test]
    fn recorded_game_plays_back() {
        let dir = tempfile::tempdir().unwrap();

        let recording = RecordingConnection::new(
            EchoConnection::new(),
            ReplayRecorder::new(dir.path(), "game"),
        );
        let mut manager = start_single_player(Box::new(recording));
        let mut world = CounterWorld::default();
        while manager.net_frame_number() <= 15 {
            step(&mut manager, &mut world, |f| {
                if f <= 10 {
                    vec![add(f as u32)]
                } else {
                    Vec::new()
                }
            })
            .unwrap();
        }
        drop(manager);

        let replay = ReplayConnection::open(first_replay_in(dir.path())).unwrap();
        assert!(replay.remaining() > 0);
        let mut playback = OrderManager::new(Session::default(), Box::new(replay));
        let mut playback_world = CounterWorld::default();
        for _ in 0..1000 {
            playback.tick_immediate(&mut playback_world).unwrap();
            if playback.is_ready_for_next_frame() {
                playback.tick(&mut playback_world).unwrap();
            } else if playback.connection_state() == ConnectionState::NotConnected {
                break;
            }
        }

        assert!(playback.net_frame_number() > 15);
        assert_eq!(playback_world.total, world.total);
    }

    /// Tests the relay records a multiplayer game that a client can play back
    #[test]
    fn relay_recording_plays_back() {
        let dir = tempfile::tempdir().unwrap();
        let total = {
            let relay = RelayHandle::start(4, Some(dir.path().to_path_buf()));
            let mut host = connect(&relay);
            let mut guest = connect(&relay);
            let session = session_for(&[host.local_client_id(), guest.local_client_id()]);
            host.issue_orders([Order::sync_info(session.to_text()), Order::start_game("")]);

            let mut host_world = CounterWorld::default();
            let mut guest_world = CounterWorld::default();
            assert!(wait_until(|| {
                step(&mut host, &mut host_world, |f| {
                    if f <= 5 {
                        vec![add(3)]
                    } else {
                        Vec::new()
                    }
                })
                .unwrap();
                step(&mut guest, &mut guest_world, |_| Vec::new()).unwrap();
                host.net_frame_number() > 12 && guest.net_frame_number() > 12
            }));
            drop(host);
            drop(guest);
            host_world.total
        };

        let replay = ReplayConnection::open(first_replay_in(dir.path())).unwrap();
        let mut playback = OrderManager::new(Session::default(), Box::new(replay));
        let mut playback_world = CounterWorld::default();
        for _ in 0..1000 {
            playback.tick_immediate(&mut playback_world).unwrap();
            if playback.is_ready_for_next_frame() {
                playback.tick(&mut playback_world).unwrap();
            } else if playback.connection_state() == ConnectionState::NotConnected {
                break;
            }
        }

        assert_eq!(playback_world.total, total);
    }
}
