//! Error types for the lockstep client.

use shared::{ClientOrder, ProtocolError};
use std::fmt;
use std::io;
use thiserror::Error;

/// Transport-level failures. Recoverable: the caller watches
/// `connection_state()` for the authoritative disconnect signal.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Zero-length packets are a programming error, never valid on the wire.
    #[error("attempted to send an empty packet")]
    EmptyPacket,

    #[error("connection is closed")]
    Closed,

    #[error("connection I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Where two sync packets for the same frame first differ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DesyncKind {
    /// The packets carry a different number of hashes.
    Length,
    /// The world already differed before the frame's first order.
    Tick,
    /// The world diverged while applying the order at `index`.
    Order {
        index: usize,
        culprit: Option<ClientOrder>,
    },
}

impl fmt::Display for DesyncKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DesyncKind::Length => write!(f, "sync packet length mismatch"),
            DesyncKind::Tick => write!(f, "tick hash mismatch"),
            DesyncKind::Order {
                index,
                culprit: Some(co),
            } => write!(
                f,
                "order #{} '{}' from client {} (subject {:?})",
                index, co.order.order_string, co.client, co.order.subject
            ),
            DesyncKind::Order {
                index,
                culprit: None,
            } => write!(f, "order #{} (no longer buffered)", index),
        }
    }
}

#[derive(Debug, Error)]
pub enum LockstepError {
    #[error("transport error: {0}")]
    Transport(#[from] ConnectionError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Two clients produced different sync hashes. The session cannot continue.
    #[error("out of sync in frame {frame}: {kind}")]
    Desync { frame: i32, kind: DesyncKind },

    /// `tick` was called before every client contributed to the frame.
    #[error("frame {frame} is not ready")]
    NotReady { frame: i32 },
}

impl LockstepError {
    /// Fatal errors end the session; the rest can be retried next tick.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LockstepError::Protocol(_) | LockstepError::Desync { .. })
    }
}
