//! # Lockstep Client Library
//!
//! Client-side half of the lockstep order synchronization layer. Every
//! participating client applies the same orders on the same simulated frame,
//! so independently running simulations stay identical without exchanging
//! any simulation state.
//!
//! ## Module Organization
//!
//! ### Connection (`connection`)
//! Transports that move framed packets to and from the relay:
//! - `EchoConnection` for single-player and local resume
//! - `NetworkConnection`, a TCP client with its own background runtime
//! - `RecordingConnection`, a decorator that records a replay
//! - `ReplayConnection`, which plays a replay file back
//!
//! ### Frame Data (`frame_data`)
//! Buffers each client's payload per frame and decides when a frame is ready.
//!
//! ### Order Manager (`order_manager`)
//! The scheduler: queues local input, sends it `frames_ahead` frames into the
//! future, applies ready frames to the [`Simulation`] and detects desyncs by
//! comparing per-order sync hashes.
//!
//! ### Sync Report (`sync_report`)
//! A five-frame ring of diagnostics dumped when a desync is detected.
//!
//! ### Tick Time (`tick_time`)
//! Real-time pacing for the host loop.

pub mod connection;
pub mod error;
pub mod frame_data;
pub mod order_manager;
pub mod sync_report;
pub mod tick_time;
pub mod world;

pub use connection::{
    Connection, ConnectionState, ConnectionTarget, EchoConnection, NetworkConnection,
    RecordingConnection, ReplayConnection,
};
pub use error::{ConnectionError, DesyncKind, LockstepError};
pub use frame_data::FrameData;
pub use order_manager::OrderManager;
pub use sync_report::{SyncReport, TraitReport};
pub use tick_time::TickTime;
pub use world::{RandomState, Simulation};
