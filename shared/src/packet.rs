//! Packet framing and classification.
//!
//! A packet is `[frame:i32][payload]`. Clients send `[len:i32][packet]` to
//! the relay, which forwards `[len:i32][from:i32][packet]` to every other
//! client.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::ProtocolError;
use crate::order::{encode_orders, Order};
use crate::{
    DISCONNECT_PACKET_LENGTH, DISCONNECT_TAG, SYNC_HASH_WIDTH, SYNC_HEADER_SIZE, SYNC_TAG,
};

/// How an inbound packet has to be routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// The sender left; it contributed orders up to `last_frame`.
    Quit { last_frame: i32 },
    Sync { frame: i32 },
    /// Frame 0: immediate orders and lobby control.
    Immediate,
    Orders { frame: i32 },
}

pub fn packet_frame(packet: &[u8]) -> Option<i32> {
    packet.get(..4).map(LittleEndian::read_i32)
}

/// The bytes following the frame number.
pub fn packet_payload(packet: &[u8]) -> &[u8] {
    packet.get(4..).unwrap_or(&[])
}

pub fn classify(packet: &[u8]) -> Result<PacketKind, ProtocolError> {
    let frame = packet_frame(packet).ok_or_else(|| {
        ProtocolError::MalformedPacket(format!("packet of {} bytes has no frame", packet.len()))
    })?;

    Ok(match packet.get(4) {
        Some(&DISCONNECT_TAG) if packet.len() == DISCONNECT_PACKET_LENGTH => {
            PacketKind::Quit { last_frame: frame }
        }
        Some(&SYNC_TAG) => PacketKind::Sync { frame },
        _ if frame == 0 => PacketKind::Immediate,
        _ => PacketKind::Orders { frame },
    })
}

pub fn frame_packet(frame: i32, orders: &[Order]) -> Vec<u8> {
    let mut packet = frame.to_le_bytes().to_vec();
    packet.extend(encode_orders(orders));
    packet
}

pub fn sync_payload(hashes: &[i32]) -> Vec<u8> {
    let mut payload = vec![0u8; 1 + hashes.len() * SYNC_HASH_WIDTH];
    payload[0] = SYNC_TAG;
    LittleEndian::write_i32_into(hashes, &mut payload[1..]);
    payload
}

/// Prefixes a payload with its frame number.
pub fn with_frame(frame: i32, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(4 + payload.len());
    packet.extend_from_slice(&frame.to_le_bytes());
    packet.extend_from_slice(payload);
    packet
}

pub fn disconnect_packet(last_frame: i32) -> Vec<u8> {
    with_frame(last_frame, &[DISCONNECT_TAG])
}

/// A sync packet holds the header plus a whole number of hashes.
pub fn is_valid_sync_packet(packet: &[u8]) -> bool {
    packet.len() >= SYNC_HEADER_SIZE
        && packet.get(4) == Some(&SYNC_TAG)
        && (packet.len() - SYNC_HEADER_SIZE) % SYNC_HASH_WIDTH == 0
}

/// Hashes carried by a sync packet, pre-tick hash first.
pub fn sync_hashes(packet: &[u8]) -> Vec<i32> {
    packet
        .get(5..)
        .unwrap_or(&[])
        .chunks_exact(SYNC_HASH_WIDTH)
        .map(LittleEndian::read_i32)
        .collect()
}

/// `[len:i32][packet]` as written by a client to the relay.
pub fn client_frame(packet: &[u8]) -> Vec<u8> {
    with_frame(packet.len() as i32, packet)
}

/// `[len:i32][from:i32][packet]` as written by the relay.
pub fn relay_envelope(from: i32, packet: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + packet.len());
    buf.extend_from_slice(&(packet.len() as i32).to_le_bytes());
    buf.extend_from_slice(&from.to_le_bytes());
    buf.extend_from_slice(packet);
    buf
}
