//! Errors raised while decoding wire packets and persisted files.

use std::io;
use thiserror::Error;

/// A stream, file or packet did not follow the expected format.
///
/// These are fatal at connection or load time: the caller shows the message
/// to the user and abandons the session.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The relay speaks a different handshake protocol than this build.
    #[error("handshake protocol version mismatch: server={server} client={client}")]
    VersionMismatch { server: i32, client: i32 },

    #[error("invalid save file: {0}")]
    InvalidSave(String),

    #[error("invalid replay file: {0}")]
    InvalidReplay(String),

    #[error("invalid session data: {0}")]
    InvalidSession(String),

    /// A packet was too short or carried an impossible length.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("malformed order: {0}")]
    MalformedOrder(String),

    #[error("unknown order type {0:#04x}")]
    UnknownOrderType(u8),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// True when the underlying cause is a truncated stream.
    pub fn is_unexpected_eof(&self) -> bool {
        matches!(self, ProtocolError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}
