//! # Lockstep Relay Library
//!
//! The relay is the only server a lockstep game needs. It never runs the
//! simulation and never interprets orders: every client computes the same
//! world from the same order stream, so all the relay does is move packets.
//!
//! ## Responsibilities
//!
//! ### Client Management (`client_manager`)
//! - Assigns client ids, starting at 1, and enforces the capacity limit
//! - Tracks the last frame each client has sent
//! - Owns the outgoing channel of every connected client
//!
//! ### Relaying (`network`)
//! - Greets each client with `[protocol version][client id]`
//! - Reads `[len][packet]` frames and rebroadcasts them to every other
//!   client as `[len][from][packet]`
//! - Announces a disconnected client with a quit packet naming its last frame
//! - Optionally records all traffic into a replay file
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::RelayServer;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let relay = RelayServer::bind("127.0.0.1:1234", 16).await?;
//!     relay.run().await?;
//!     Ok(())
//! }
//! ```

pub mod client_manager;
pub mod network;

pub use client_manager::ClientManager;
pub use network::RelayServer;
