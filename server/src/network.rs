//! TCP relay: accepts clients, hands out ids and rebroadcasts every packet

use crate::client_manager::ClientManager;
use log::{debug, error, info, warn};
use shared::packet::{disconnect_packet, packet_frame, relay_envelope};
use shared::{ProtocolError, ReplayMetadata, ReplayRecorder, MAX_PACKET_SIZE, PROTOCOL_VERSION};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};

/// Relay server. Clients send `[len][packet]`; every other client receives
/// `[len][from][packet]`. Packet contents are opaque apart from the leading
/// frame number, which is tracked so a dropped client's quit packet can name
/// the last frame it contributed to.
pub struct RelayServer {
    listener: TcpListener,
    clients: Arc<RwLock<ClientManager>>,
    recorder: Option<Arc<Mutex<ReplayRecorder>>>,
}

impl RelayServer {
    pub async fn bind(addr: &str, max_clients: usize) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Relay listening on {}", listener.local_addr()?);

        Ok(RelayServer {
            listener,
            clients: Arc::new(RwLock::new(ClientManager::new(max_clients))),
            recorder: None,
        })
    }

    /// Records everything that passes through the relay into a replay.
    pub fn with_recorder(mut self, mut recorder: ReplayRecorder) -> Self {
        if recorder.metadata_mut().is_none() {
            recorder.set_metadata(ReplayMetadata::new("", Vec::new()));
        }
        self.recorder = Some(Arc::new(Mutex::new(recorder)));
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> io::Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Accepts clients until `shutdown` resolves, then disconnects everyone
    /// and finishes the replay.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> io::Result<()> {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => self.accept(stream, addr).await,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
                _ = &mut shutdown => break,
            }
        }

        let dropped = self.clients.write().await.clear();
        info!("Relay shutting down, dropped {} clients", dropped);

        if let Some(recorder) = &self.recorder {
            if let Err(e) = recorder.lock().await.finish() {
                error!("Failed to finish replay: {}", e);
            }
        }
        Ok(())
    }

    async fn accept(&self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
        }
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();

        let client_id = {
            let mut clients = self.clients.write().await;
            let Some(id) = clients.add_client(addr, tx.clone()) else {
                warn!("Rejecting {}: relay is full", addr);
                return;
            };
            // Queued under the write lock so no broadcast can overtake it.
            let _ = tx.send(handshake(id));
            id
        };
        drop(tx);

        tokio::spawn(write_loop(client_id, writer, rx));
        tokio::spawn(read_loop(
            client_id,
            reader,
            Arc::clone(&self.clients),
            self.recorder.clone(),
        ));
    }
}

fn handshake(client_id: i32) -> Vec<u8> {
    let mut data = Vec::with_capacity(8);
    data.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
    data.extend_from_slice(&client_id.to_le_bytes());
    data
}

async fn read_loop(
    client_id: i32,
    mut reader: OwnedReadHalf,
    clients: Arc<RwLock<ClientManager>>,
    recorder: Option<Arc<Mutex<ReplayRecorder>>>,
) {
    loop {
        let packet = match read_packet(&mut reader).await {
            Ok(packet) => packet,
            Err(e) => {
                if e.is_unexpected_eof() {
                    debug!("Client {} closed its connection", client_id);
                } else {
                    warn!("Dropping client {}: {}", client_id, e);
                }
                break;
            }
        };

        relay(client_id, &packet, &clients, recorder.as_deref()).await;
    }

    let removed = clients.write().await.remove_client(client_id);
    if let Some(client) = removed {
        let quit = disconnect_packet(client.last_frame);
        relay(client_id, &quit, &clients, recorder.as_deref()).await;
    }
}

async fn relay(
    from: i32,
    packet: &[u8],
    clients: &RwLock<ClientManager>,
    recorder: Option<&Mutex<ReplayRecorder>>,
) {
    if let Some(recorder) = recorder {
        if let Err(e) = recorder.lock().await.receive(from, packet) {
            error!("Failed to record packet from client {}: {}", from, e);
        }
    }

    let envelope = relay_envelope(from, packet);
    match packet_frame(packet) {
        Some(frame) if frame > 0 => {
            let mut clients = clients.write().await;
            clients.record_frame(from, frame);
            clients.broadcast(&envelope, Some(from));
        }
        _ => {
            clients.read().await.broadcast(&envelope, Some(from));
        }
    }
}

/// Reads one `[len:i32][packet]` frame from a client.
async fn read_packet(reader: &mut OwnedReadHalf) -> Result<Vec<u8>, ProtocolError> {
    let len = reader.read_i32_le().await?;
    if len <= 0 || len as usize > MAX_PACKET_SIZE {
        return Err(ProtocolError::MalformedPacket(format!(
            "client sent packet length {}",
            len
        )));
    }

    let mut packet = vec![0u8; len as usize];
    reader.read_exact(&mut packet).await?;
    Ok(packet)
}

async fn write_loop(
    client_id: i32,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(data) = rx.recv().await {
        if let Err(e) = writer.write_all(&data).await {
            debug!("Write to client {} failed: {}", client_id, e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}
