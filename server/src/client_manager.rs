//! Relay-side bookkeeping for connected clients
//!
//! This module tracks every client attached to the relay:
//! - Client id assignment and capacity enforcement
//! - The outgoing channel feeding each client's socket writer
//! - The last frame each client has sent, reported to the others on disconnect
//!
//! The relay never looks inside order payloads; all it needs to know about a
//! client is where to send packets and how far its order stream has got.

use log::{debug, info};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::sync::mpsc;

/// A client attached to the relay
#[derive(Debug)]
pub struct RelayClient {
    /// Id assigned by the relay, starting at 1
    pub id: i32,
    /// Remote address, for logging
    pub addr: SocketAddr,
    /// When the connection was accepted
    pub connected_at: Instant,
    /// Highest frame seen in a packet from this client
    pub last_frame: i32,
    sender: mpsc::UnboundedSender<Vec<u8>>,
}

impl RelayClient {
    pub fn new(id: i32, addr: SocketAddr, sender: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self {
            id,
            addr,
            connected_at: Instant::now(),
            last_frame: 0,
            sender,
        }
    }

    /// Queues bytes for this client's writer task. Returns false once the
    /// writer has gone away.
    pub fn send(&self, data: Vec<u8>) -> bool {
        self.sender.send(data).is_ok()
    }

    /// Frames never move backwards; immediate packets carry frame 0 and are
    /// ignored.
    pub fn record_frame(&mut self, frame: i32) {
        if frame > 0 {
            self.last_frame = self.last_frame.max(frame);
        }
    }
}

/// Manages all clients attached to the relay
pub struct ClientManager {
    clients: HashMap<i32, RelayClient>,
    next_client_id: i32,
    max_clients: usize,
}

impl ClientManager {
    /// Client ids start from 1 and are never reused.
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: HashMap::new(),
            next_client_id: 1,
            max_clients,
        }
    }

    /// Returns `None` when the relay is full.
    pub fn add_client(
        &mut self,
        addr: SocketAddr,
        sender: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Option<i32> {
        if self.is_full() {
            return None;
        }

        let client_id = self.next_client_id;
        self.next_client_id += 1;

        info!("Client {} connected from {}", client_id, addr);
        self.clients
            .insert(client_id, RelayClient::new(client_id, addr, sender));
        Some(client_id)
    }

    pub fn remove_client(&mut self, client_id: i32) -> Option<RelayClient> {
        let client = self.clients.remove(&client_id)?;
        info!(
            "Client {} disconnected after frame {} ({:.1}s connected)",
            client.id,
            client.last_frame,
            client.connected_at.elapsed().as_secs_f32()
        );
        Some(client)
    }

    /// Drops every client, closing their writers.
    pub fn clear(&mut self) -> usize {
        let count = self.clients.len();
        self.clients.clear();
        count
    }

    pub fn record_frame(&mut self, client_id: i32, frame: i32) {
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.record_frame(frame);
        }
    }

    pub fn last_frame(&self, client_id: i32) -> Option<i32> {
        self.clients.get(&client_id).map(|c| c.last_frame)
    }

    /// Sends `data` to every client except `exclude`. Returns how many
    /// clients it was queued for.
    pub fn broadcast(&self, data: &[u8], exclude: Option<i32>) -> usize {
        let mut sent = 0;
        for (id, client) in &self.clients {
            if Some(*id) == exclude {
                continue;
            }
            if client.send(data.to_vec()) {
                sent += 1;
            } else {
                debug!("Writer for client {} has already closed", id);
            }
        }
        sent
    }

    /// Connected client ids in ascending order.
    pub fn client_ids(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self.clients.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_full(&self) -> bool {
        self.clients.len() >= self.max_clients
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
