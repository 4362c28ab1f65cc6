//! `gate_server`
//!
//! The connection and session core of a multiplayer game network server:
//! - Bichannel listener: TCP accept plus UDP demux on one address, with the
//!   datagram auth handshake.
//! - Per-session connection state machines with strike accounting.
//! - Client table with u16 id allocation.
//! - Cooperative dispatcher serializing extension callbacks.
//!
//! Payload bytes are opaque here; game semantics live in an [`extension`].

pub mod clients;
pub mod connection;
pub mod dispatcher;
pub mod extension;
pub mod listener;
pub mod server;

pub use server::GateServer;
