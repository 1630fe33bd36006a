//! Tether: remote filesystem access for editors, relayed over WebSocket.
//!
//! An agent runs next to the files and dials out to a relay, so the
//! machine never needs an inbound port. Editors attach through the same
//! relay and issue filesystem operations (read, write, delete, list)
//! that are multiplexed as concurrent exchanges over the agent's single
//! connection.
//!
//! Module map:
//! - [`wire`] — frame format and JSON control payloads
//! - [`mux`] — the frame multiplexer driving one connection
//! - [`handler`] — the filesystem operation set, sandboxed to a root
//! - [`locks`] — per-path write locks
//! - [`bus`] — open-notification fan-out to editor sessions
//! - [`client`] — the agent runtime (connect, handshake, reconnect)
//! - [`server`] — the relay (agents, editors, bridging)

pub mod bus;
pub mod client;
pub mod config;
pub mod handler;
pub mod locks;
pub mod mux;
pub mod server;
pub mod wire;
pub mod ws;

pub use config::Config;

/// Protocol version announced in the handshake.
pub const PROTOCOL_VERSION: &str = "0.1";
