//! Performance benchmarks for the hot paths of the lockstep layer

use client::{EchoConnection, FrameData, OrderManager, Simulation};
use shared::order::{decode_orders, encode_orders};
use shared::packet::sync_payload;
use shared::{CellPos, Client, GameSave, Order, Session, Slot};
use std::io::Cursor;
use std::time::Instant;

fn sample_orders(count: usize) -> Vec<Order> {
    (0..count)
        .map(|i| {
            Order::new("Move", Some(i as u32))
                .with_target_location(CellPos::new(i as i32, -(i as i32)))
                .queued(i % 2 == 0)
        })
        .collect()
}

fn lobby(players: i32) -> Session {
    let mut session = Session::default();
    for index in 1..=players {
        let reference = format!("Multi{}", index - 1);
        session.slots.push(Slot::new(reference.clone()));
        let mut client = Client::new(index, format!("Player {}", index));
        client.slot = Some(reference);
        session.clients.push(client);
    }
    session
}

/// Benchmarks order encoding and decoding
#[test]
fn benchmark_order_codec() {
    let orders = sample_orders(100);
    let iterations = 1_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let payload = encode_orders(&orders);
        let decoded = decode_orders(1, 1, &payload);
        assert_eq!(decoded.len(), orders.len());
    }

    let duration = start.elapsed();
    println!(
        "Order codec: {} batches of {} orders in {:?} ({:.2} μs/batch)",
        iterations,
        orders.len(),
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    // Should complete in under 5 seconds even in debug builds
    assert!(duration.as_millis() < 5000);
}

/// Benchmarks frame readiness checks with a full lobby
#[test]
fn benchmark_frame_data() {
    let clients = 8;
    let frames = 5_000;
    let payload = encode_orders(&sample_orders(4));
    let mut frame_data = FrameData::new();
    for client in 1..=clients {
        frame_data.add_client(client);
    }

    let start = Instant::now();
    let mut applied = 0;
    for frame in 1..=frames {
        for client in 1..=clients {
            assert!(!frame_data.is_ready_for_frame(frame));
            frame_data.add_frame_orders(client, frame, payload.clone());
        }
        assert!(frame_data.is_ready_for_frame(frame));
        applied += frame_data.orders_for_frame(frame).len();
    }

    let duration = start.elapsed();
    println!(
        "Frame data: {} frames x {} clients in {:?}",
        frames, clients, duration
    );

    assert_eq!(applied, frames as usize * clients as usize * 4);
    assert!(duration.as_millis() < 5000);
}

/// Benchmarks recording a long game into a save and loading it back
#[test]
fn benchmark_game_save() {
    let session = lobby(4);
    let payload = encode_orders(&sample_orders(8));
    let frames = 10_000;

    let start = Instant::now();
    let mut save = GameSave::new();
    save.start_game(&session);
    for frame in 1..=frames {
        for client in 1..=4 {
            save.dispatch_orders(client, frame, &payload);
        }
        save.dispatch_orders(1, frame, &sync_payload(&[frame, frame + 1]));
    }

    let mut bytes = Vec::new();
    save.write_to(&mut bytes).unwrap();
    let loaded = GameSave::read_from(&mut Cursor::new(&bytes)).unwrap();
    let duration = start.elapsed();

    println!(
        "Game save: {} frames, {} bytes, {:?}",
        frames,
        bytes.len(),
        duration
    );

    assert_eq!(loaded.last_orders_frame(), frames);
    assert_eq!(loaded.entries().unwrap().len(), frames as usize * 4);
    assert!(duration.as_millis() < 5000);
}

#[derive(Default)]
struct Accumulator(i32);

impl Simulation for Accumulator {
    fn sync_hash(&self) -> i32 {
        self.0
    }

    fn process_order(&mut self, _session: &Session, client: i32, order: &Order) {
        self.0 = self
            .0
            .wrapping_mul(31)
            .wrapping_add(client)
            .wrapping_add(order.subject.unwrap_or(0) as i32);
    }
}

/// Benchmarks the full scheduler loop over a local connection
#[test]
fn benchmark_single_player_lockstep() {
    let mut manager = OrderManager::new(Session::default(), Box::new(EchoConnection::new()));
    let mut world = Accumulator::default();
    manager.issue_orders([
        Order::sync_info(lobby(1).to_text()),
        Order::start_game(""),
    ]);

    let frames = 2_000;
    let start = Instant::now();
    while manager.net_frame_number() <= frames {
        manager.tick_immediate(&mut world).unwrap();
        if manager.is_ready_for_next_frame() {
            manager.issue_orders(sample_orders(2));
            manager.tick(&mut world).unwrap();
        }
    }

    let duration = start.elapsed();
    println!(
        "Lockstep: {} frames in {:?} ({:.2} μs/frame)",
        frames,
        duration,
        duration.as_micros() as f64 / frames as f64
    );

    assert!(manager.out_of_sync_frame().is_none());
    assert!(duration.as_millis() < 5000);
}
