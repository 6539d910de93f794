//! Wire formats and persisted data shared by the lockstep client and the relay.

pub mod error;
pub mod game_save;
pub mod io;
pub mod order;
pub mod packet;
pub mod replay;
pub mod session;

pub use error::ProtocolError;
pub use game_save::GameSave;
pub use order::{CellPos, ClientOrder, Order, OrderReader};
pub use packet::PacketKind;
pub use replay::{ReplayMetadata, ReplayReader, ReplayRecorder};
pub use session::{Client, ClientState, GlobalSettings, Session, Slot};

/// Version exchanged during the relay handshake.
pub const PROTOCOL_VERSION: i32 = 7;

/// Full order: name, subject, field bitfield and optional fields.
pub const ORDER_TAG: u8 = 0xFF;
/// Immediate order: name and data string, bypasses frame scheduling.
pub const IMMEDIATE_ORDER_TAG: u8 = 0xFE;
/// Client-quit notification, only valid as a 5 byte packet.
pub const DISCONNECT_TAG: u8 = 0xBF;
/// Sync hash payload: tag followed by one `i32` per frame-local event.
pub const SYNC_TAG: u8 = 0x65;

/// `[frame:i32][tag:u8][pre-tick hash:i32]`
pub const SYNC_HEADER_SIZE: usize = 9;
pub const SYNC_HASH_WIDTH: usize = 4;
pub const DISCONNECT_PACKET_LENGTH: usize = 5;

/// Upper bound on a single framed packet accepted from the wire or a file.
pub const MAX_PACKET_SIZE: usize = 4 * 1024 * 1024;

/// Default look-ahead applied to locally issued orders.
pub const DEFAULT_ORDER_LATENCY: i32 = 3;
