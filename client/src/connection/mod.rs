//! Transports that move framed packets between clients.
//!
//! Every implementation hands the [`OrderManager`](crate::OrderManager) the
//! same thing: `(from, packet)` pairs where `packet` is `[frame:i32][payload]`.

mod echo;
mod network;
mod recording;
mod replay;
mod target;

pub use echo::EchoConnection;
pub use network::NetworkConnection;
pub use recording::RecordingConnection;
pub use replay::ReplayConnection;
pub use target::ConnectionTarget;

use parking_lot::Mutex;
use shared::Order;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::ConnectionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    PreConnecting,
    NotConnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    fn to_u8(self) -> u8 {
        match self {
            ConnectionState::PreConnecting => 0,
            ConnectionState::NotConnected => 1,
            ConnectionState::Connecting => 2,
            ConnectionState::Connected => 3,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::PreConnecting,
            2 => ConnectionState::Connecting,
            3 => ConnectionState::Connected,
            _ => ConnectionState::NotConnected,
        }
    }
}

/// Connection state readable from the I/O task and the simulation thread.
///
/// `NotConnected` is terminal: once stored, later transitions are ignored.
#[derive(Debug)]
pub struct AtomicConnectionState(AtomicU8);

impl AtomicConnectionState {
    pub fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state.to_u8()))
    }

    pub fn load(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: ConnectionState) {
        let terminal = ConnectionState::NotConnected.to_u8();
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != terminal).then_some(state.to_u8())
            });
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPacket {
    pub from: i32,
    pub packet: Vec<u8>,
}

/// The only state shared between a reader task and the simulation thread.
#[derive(Debug, Default)]
pub struct PacketQueue {
    packets: Mutex<Vec<ReceivedPacket>>,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, from: i32, packet: Vec<u8>) {
        self.packets.lock().push(ReceivedPacket { from, packet });
    }

    /// Takes everything queued so far, leaving an empty queue behind.
    pub fn drain(&self) -> Vec<ReceivedPacket> {
        std::mem::take(&mut *self.packets.lock())
    }

    pub fn len(&self) -> usize {
        self.packets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A bidirectional framed-packet transport to the relay.
pub trait Connection: Send {
    /// Client id assigned by the relay; 0 until the handshake completes.
    fn local_client_id(&self) -> i32;

    fn connection_state(&self) -> ConnectionState;

    /// Sends the local orders scheduled for `frame`. An empty slice still
    /// sends a packet so other clients know this frame is complete.
    fn send(&mut self, frame: i32, orders: &[Order]) -> Result<(), ConnectionError>;

    fn send_immediate(&mut self, orders: &[Order]) -> Result<(), ConnectionError>;

    /// Queues a sync payload (`[0x65][hashes]`) for `frame`.
    fn send_sync(&mut self, frame: i32, payload: &[u8]) -> Result<(), ConnectionError>;

    /// Drains packets received since the last call.
    fn receive(&mut self) -> Vec<ReceivedPacket>;

    /// Idempotent.
    fn close(&mut self);
}
