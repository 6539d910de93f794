use log::warn;
use shared::{Order, ReplayRecorder};

use super::{Connection, ConnectionState, ReceivedPacket};
use crate::error::ConnectionError;

/// Wraps a connection and tees everything it receives into a replay file.
pub struct RecordingConnection<C: Connection> {
    inner: C,
    recorder: ReplayRecorder,
}

impl<C: Connection> RecordingConnection<C> {
    pub fn new(inner: C, recorder: ReplayRecorder) -> Self {
        Self { inner, recorder }
    }

    pub fn recorder(&self) -> &ReplayRecorder {
        &self.recorder
    }

    pub fn recorder_mut(&mut self) -> &mut ReplayRecorder {
        &mut self.recorder
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

impl<C: Connection> Connection for RecordingConnection<C> {
    fn local_client_id(&self) -> i32 {
        self.inner.local_client_id()
    }

    fn connection_state(&self) -> ConnectionState {
        self.inner.connection_state()
    }

    fn send(&mut self, frame: i32, orders: &[Order]) -> Result<(), ConnectionError> {
        self.inner.send(frame, orders)
    }

    fn send_immediate(&mut self, orders: &[Order]) -> Result<(), ConnectionError> {
        self.inner.send_immediate(orders)
    }

    fn send_sync(&mut self, frame: i32, payload: &[u8]) -> Result<(), ConnectionError> {
        self.inner.send_sync(frame, payload)
    }

    fn receive(&mut self) -> Vec<ReceivedPacket> {
        let packets = self.inner.receive();
        for p in &packets {
            if let Err(e) = self.recorder.receive(p.from, &p.packet) {
                warn!("Failed to record packet from client {}: {}", p.from, e);
            }
        }
        packets
    }

    fn close(&mut self) {
        self.inner.close();
        if let Err(e) = self.recorder.finish() {
            warn!("Failed to finish replay: {}", e);
        }
    }
}
