use shared::packet::{frame_packet, with_frame};
use shared::Order;

use super::{Connection, ConnectionState, PacketQueue, ReceivedPacket};
use crate::error::ConnectionError;

/// Local client id of a single-player game.
pub const ECHO_CLIENT_ID: i32 = 1;

/// Loops every sent packet straight back to its own receive queue.
///
/// Used for single-player games and for resuming saves locally.
#[derive(Debug)]
pub struct EchoConnection {
    queue: PacketQueue,
    closed: bool,
}

impl Default for EchoConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl EchoConnection {
    pub fn new() -> Self {
        Self {
            queue: PacketQueue::new(),
            closed: false,
        }
    }

    /// Delivers a packet as if another client had sent it.
    pub fn inject(&mut self, from: i32, packet: Vec<u8>) {
        self.queue.push(from, packet);
    }

    fn echo(&mut self, packet: Vec<u8>) -> Result<(), ConnectionError> {
        if self.closed {
            return Err(ConnectionError::Closed);
        }
        self.queue.push(ECHO_CLIENT_ID, packet);
        Ok(())
    }
}

impl Connection for EchoConnection {
    fn local_client_id(&self) -> i32 {
        ECHO_CLIENT_ID
    }

    fn connection_state(&self) -> ConnectionState {
        if self.closed {
            ConnectionState::NotConnected
        } else {
            ConnectionState::PreConnecting
        }
    }

    fn send(&mut self, frame: i32, orders: &[Order]) -> Result<(), ConnectionError> {
        self.echo(frame_packet(frame, orders))
    }

    fn send_immediate(&mut self, orders: &[Order]) -> Result<(), ConnectionError> {
        for order in orders {
            self.echo(frame_packet(0, std::slice::from_ref(order)))?;
        }
        Ok(())
    }

    fn send_sync(&mut self, frame: i32, payload: &[u8]) -> Result<(), ConnectionError> {
        if payload.is_empty() {
            return Err(ConnectionError::EmptyPacket);
        }
        self.echo(with_frame(frame, payload))
    }

    fn receive(&mut self) -> Vec<ReceivedPacket> {
        self.queue.drain()
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::packet::{classify, sync_payload};
    use shared::PacketKind;

    #[test]
    fn test_sent_packets_echo_back() {
        let mut conn = EchoConnection::new();
        conn.send(1, &[]).unwrap();
        conn.send_immediate(&[Order::chat("a"), Order::chat("b")]).unwrap();
        conn.send_sync(1, &sync_payload(&[5])).unwrap();

        let packets = conn.receive();
        let kinds: Vec<PacketKind> = packets.iter().map(|p| classify(&p.packet).unwrap()).collect();
        assert_eq!(
            kinds,
            vec![
                PacketKind::Orders { frame: 1 },
                PacketKind::Immediate,
                PacketKind::Immediate,
                PacketKind::Sync { frame: 1 },
            ]
        );
        assert!(packets.iter().all(|p| p.from == ECHO_CLIENT_ID));
        assert!(conn.receive().is_empty());
    }

    #[test]
    fn test_empty_sync_rejected() {
        let mut conn = EchoConnection::new();
        assert!(matches!(
            conn.send_sync(1, &[]),
            Err(ConnectionError::EmptyPacket)
        ));
    }

    #[test]
    fn test_closed_connection() {
        let mut conn = EchoConnection::new();
        conn.close();
        conn.close();
        assert_eq!(conn.connection_state(), ConnectionState::NotConnected);
        assert!(matches!(conn.send(1, &[]), Err(ConnectionError::Closed)));
    }
}
