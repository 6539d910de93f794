use shared::packet::packet_frame;
use shared::{Order, ProtocolError, ReplayMetadata, ReplayReader};
use std::collections::VecDeque;
use std::path::Path;

use super::{Connection, ConnectionState, ReceivedPacket};
use crate::error::ConnectionError;

/// Plays a recorded replay back as if it were a live relay.
///
/// Packets are released in file order as the local simulation catches up:
/// `send(frame, _)` opens the window up to `frame`, frame-0 packets are
/// always released.
pub struct ReplayConnection {
    packets: VecDeque<(i32, Vec<u8>)>,
    metadata: Option<ReplayMetadata>,
    delivery_frame: i32,
    closed: bool,
}

impl ReplayConnection {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ProtocolError> {
        Ok(Self::from_reader(ReplayReader::open(path)?))
    }

    pub fn from_reader(reader: ReplayReader) -> Self {
        let metadata = reader.metadata().cloned();
        Self {
            packets: reader.into_packets().into(),
            metadata,
            delivery_frame: 0,
            closed: false,
        }
    }

    pub fn metadata(&self) -> Option<&ReplayMetadata> {
        self.metadata.as_ref()
    }

    pub fn remaining(&self) -> usize {
        self.packets.len()
    }
}

impl Connection for ReplayConnection {
    fn local_client_id(&self) -> i32 {
        0
    }

    fn connection_state(&self) -> ConnectionState {
        if self.closed || self.packets.is_empty() {
            ConnectionState::NotConnected
        } else {
            ConnectionState::Connected
        }
    }

    fn send(&mut self, frame: i32, _orders: &[Order]) -> Result<(), ConnectionError> {
        self.delivery_frame = self.delivery_frame.max(frame);
        Ok(())
    }

    fn send_immediate(&mut self, _orders: &[Order]) -> Result<(), ConnectionError> {
        Ok(())
    }

    fn send_sync(&mut self, _frame: i32, _payload: &[u8]) -> Result<(), ConnectionError> {
        Ok(())
    }

    fn receive(&mut self) -> Vec<ReceivedPacket> {
        let mut released = Vec::new();
        if self.closed {
            return released;
        }

        while let Some((_, packet)) = self.packets.front() {
            let frame = packet_frame(packet).unwrap_or(0);
            if frame != 0 && frame > self.delivery_frame {
                break;
            }
            if let Some((from, packet)) = self.packets.pop_front() {
                released.push(ReceivedPacket { from, packet });
            }
        }
        released
    }

    fn close(&mut self) {
        self.closed = true;
        self.packets.clear();
    }
}
