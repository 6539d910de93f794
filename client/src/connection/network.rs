//! Live TCP connection to a relay server.
//!
//! A small tokio runtime owned by the connection runs two tasks: a reader
//! that performs the handshake and then appends every relay envelope to the
//! shared [`PacketQueue`], and a writer draining an unbounded channel. The
//! simulation thread never blocks on either.

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use shared::packet::{client_frame, frame_packet, with_frame};
use shared::{Order, ProtocolError, MAX_PACKET_SIZE, PROTOCOL_VERSION};
use std::io;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, watch};

use super::{AtomicConnectionState, Connection, ConnectionState, ConnectionTarget, PacketQueue, ReceivedPacket};
use crate::error::ConnectionError;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// State shared with the I/O tasks.
struct Shared {
    state: AtomicConnectionState,
    client_id: AtomicI32,
    queue: PacketQueue,
    error: Mutex<Option<String>>,
}

pub struct NetworkConnection {
    target: ConnectionTarget,
    shared: Arc<Shared>,
    runtime: Option<Runtime>,
    write_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    stop_tx: watch::Sender<bool>,
    queued_sync_packets: Vec<Vec<u8>>,
}

impl NetworkConnection {
    /// Starts connecting in the background; watch `connection_state()`.
    ///
    /// Must not be called from inside an async context: the connection owns
    /// its own runtime.
    pub fn connect(target: ConnectionTarget) -> Result<Self, ConnectionError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("lockstep-net")
            .enable_all()
            .build()?;

        let shared = Arc::new(Shared {
            state: AtomicConnectionState::new(ConnectionState::PreConnecting),
            client_id: AtomicI32::new(0),
            queue: PacketQueue::new(),
            error: Mutex::new(None),
        });

        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);

        runtime.spawn(run_connection(
            target.clone(),
            Arc::clone(&shared),
            write_rx,
            stop_rx,
        ));

        Ok(Self {
            target,
            shared,
            runtime: Some(runtime),
            write_tx: Some(write_tx),
            stop_tx,
            queued_sync_packets: Vec::new(),
        })
    }

    pub fn target(&self) -> &ConnectionTarget {
        &self.target
    }

    /// Why the connection ended, if it failed.
    pub fn error(&self) -> Option<String> {
        self.shared.error.lock().clone()
    }

    /// Writes a packet to the relay and echoes it locally, since the relay
    /// does not send a client's packets back to it.
    fn send_packet(&mut self, packet: Vec<u8>) -> Result<(), ConnectionError> {
        if packet.is_empty() {
            return Err(ConnectionError::EmptyPacket);
        }
        let tx = self.write_tx.as_ref().ok_or(ConnectionError::Closed)?;

        // The writer task logs and drops failed writes; a dead socket shows
        // up as the reader moving to NotConnected.
        let _ = tx.send(client_frame(&packet));
        self.shared
            .queue
            .push(self.shared.client_id.load(Ordering::Acquire), packet);
        Ok(())
    }
}

impl Connection for NetworkConnection {
    fn local_client_id(&self) -> i32 {
        self.shared.client_id.load(Ordering::Acquire)
    }

    fn connection_state(&self) -> ConnectionState {
        self.shared.state.load()
    }

    fn send(&mut self, frame: i32, orders: &[Order]) -> Result<(), ConnectionError> {
        self.send_packet(frame_packet(frame, orders))?;

        // Sync hashes are computed after a frame's orders are applied, so they
        // ride along with the next frame's packet.
        for packet in std::mem::take(&mut self.queued_sync_packets) {
            self.send_packet(packet)?;
        }
        Ok(())
    }

    fn send_immediate(&mut self, orders: &[Order]) -> Result<(), ConnectionError> {
        for order in orders {
            self.send_packet(frame_packet(0, std::slice::from_ref(order)))?;
        }
        Ok(())
    }

    fn send_sync(&mut self, frame: i32, payload: &[u8]) -> Result<(), ConnectionError> {
        if payload.is_empty() {
            return Err(ConnectionError::EmptyPacket);
        }
        self.queued_sync_packets.push(with_frame(frame, payload));
        Ok(())
    }

    fn receive(&mut self) -> Vec<ReceivedPacket> {
        self.shared.queue.drain()
    }

    fn close(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };

        let _ = self.stop_tx.send(true);
        self.write_tx = None;
        runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);
        self.shared.state.store(ConnectionState::NotConnected);
        debug!("Connection to {} closed", self.target);
    }
}

impl Drop for NetworkConnection {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_connection(
    target: ConnectionTarget,
    shared: Arc<Shared>,
    write_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    mut stop_rx: watch::Receiver<bool>,
) {
    shared.state.store(ConnectionState::Connecting);
    info!("Connecting to {}", target);

    let result = tokio::select! {
        result = handshake(&target, &shared) => result,
        _ = stop_rx.changed() => {
            shared.state.store(ConnectionState::NotConnected);
            return;
        }
    };

    let (mut reader, writer) = match result {
        Ok(halves) => halves,
        Err(e) => {
            error!("Failed to connect to {}: {}", target, e);
            *shared.error.lock() = Some(e.to_string());
            shared.state.store(ConnectionState::NotConnected);
            return;
        }
    };

    tokio::spawn(write_loop(writer, write_rx));

    shared.state.store(ConnectionState::Connected);
    info!(
        "Connected to {} as client {}",
        target,
        shared.client_id.load(Ordering::Acquire)
    );

    loop {
        tokio::select! {
            result = read_envelope(&mut reader) => match result {
                Ok((from, packet)) => shared.queue.push(from, packet),
                Err(e) => {
                    if e.is_unexpected_eof() {
                        info!("Relay closed the connection");
                    } else {
                        warn!("Connection lost: {}", e);
                        *shared.error.lock() = Some(e.to_string());
                    }
                    break;
                }
            },
            _ = stop_rx.changed() => break,
        }
    }

    shared.state.store(ConnectionState::NotConnected);
}

/// Connects, then reads the protocol version and the assigned client id.
async fn handshake(
    target: &ConnectionTarget,
    shared: &Shared,
) -> Result<(OwnedReadHalf, OwnedWriteHalf), ProtocolError> {
    let stream = target.connect().await?;
    stream.set_nodelay(true)?;
    let (mut reader, writer) = stream.into_split();

    let version = reader.read_i32_le().await?;
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::VersionMismatch {
            server: version,
            client: PROTOCOL_VERSION,
        });
    }

    let client_id = reader.read_i32_le().await?;
    shared.client_id.store(client_id, Ordering::Release);
    Ok((reader, writer))
}

/// Reads one `[len:i32][from:i32][packet]` envelope.
async fn read_envelope(reader: &mut OwnedReadHalf) -> Result<(i32, Vec<u8>), ProtocolError> {
    let len = reader.read_i32_le().await?;
    if len <= 0 || len as usize > MAX_PACKET_SIZE {
        return Err(ProtocolError::MalformedPacket(format!(
            "relay sent packet length {}",
            len
        )));
    }
    let from = reader.read_i32_le().await?;

    let mut packet = vec![0u8; len as usize];
    reader.read_exact(&mut packet).await?;
    Ok((from, packet))
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut write_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let mut failed = false;
    while let Some(data) = write_rx.recv().await {
        if failed {
            continue;
        }
        if let Err(e) = write_all(&mut writer, &data).await {
            debug!("Dropping writes after socket error: {}", e);
            failed = true;
        }
    }
    let _ = writer.shutdown().await;
}

async fn write_all(writer: &mut OwnedWriteHalf, data: &[u8]) -> io::Result<()> {
    writer.write_all(data).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn fresh_state() -> Shared {
        Shared {
            state: AtomicConnectionState::new(ConnectionState::PreConnecting),
            client_id: AtomicI32::new(0),
            queue: PacketQueue::new(),
            error: Mutex::new(None),
        }
    }

    /// Accepts one client, writes `version` and client id 5, then waits for
    /// the client to hang up.
    async fn stub_relay(version: i32) -> ConnectionTarget {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_i32_le(version).await.unwrap();
            stream.write_i32_le(5).await.unwrap();
            let mut buf = [0u8; 1];
            let _ = stream.read(&mut buf).await;
        });
        addr.to_string().parse().unwrap()
    }

    #[tokio::test]
    async fn test_handshake_assigns_client_id() {
        let target = stub_relay(PROTOCOL_VERSION).await;
        let shared = fresh_state();

        handshake(&target, &shared).await.unwrap();
        assert_eq!(shared.client_id.load(Ordering::Acquire), 5);
    }

    #[tokio::test]
    async fn test_handshake_rejects_other_protocol_version() {
        let target = stub_relay(PROTOCOL_VERSION + 1).await;
        let shared = fresh_state();

        match handshake(&target, &shared).await {
            Err(ProtocolError::VersionMismatch { server, client }) => {
                assert_eq!(server, PROTOCOL_VERSION + 1);
                assert_eq!(client, PROTOCOL_VERSION);
            }
            other => panic!("unexpected handshake result: {:?}", other.map(|_| ())),
        }
        assert_eq!(shared.client_id.load(Ordering::Acquire), 0);
    }
}
