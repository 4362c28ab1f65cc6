//! Metric emission for the connection core.
//!
//! The core only ever writes to the sink; nothing in here is read back.
//!
//! `bytes_sent{protocol}` / `bytes_received{protocol}`: completed transfers
//! per channel. TCP figures include the 4-byte length prefix.
//! `finalizations{type}`: pooled objects dropped without being released.
//! Stays at zero in a leak-free run.
//! `client_connected_event_failures` / `client_disconnected_event_failures`:
//! extension handler errors.
//! `clients_connected`: populated client table size.
//! `client_connected_event_time` / `client_disconnected_event_time`: handler
//! execution time in seconds.
//! `unreliable_drops`: datagrams discarded before demultiplexing (unknown
//! endpoint, bad handshake). Deliberately not logged per datagram.

use std::sync::atomic::{AtomicU64, Ordering};

use metrics::{counter, gauge, histogram};

use crate::framing::ChannelMode;

pub const BYTES_SENT: &str = "bytes_sent";
pub const BYTES_RECEIVED: &str = "bytes_received";
pub const FINALIZATIONS: &str = "finalizations";
pub const CLIENT_CONNECTED_EVENT_FAILURES: &str = "client_connected_event_failures";
pub const CLIENT_DISCONNECTED_EVENT_FAILURES: &str = "client_disconnected_event_failures";
pub const CLIENTS_CONNECTED: &str = "clients_connected";
pub const CLIENT_CONNECTED_EVENT_TIME: &str = "client_connected_event_time";
pub const CLIENT_DISCONNECTED_EVENT_TIME: &str = "client_disconnected_event_time";
pub const UNRELIABLE_DROPS: &str = "unreliable_drops";

/// Process-local mirror of the finalization counter. The metrics sink is
/// write-only, so leak assertions in tests read this instead.
static FINALIZATIONS_TOTAL: AtomicU64 = AtomicU64::new(0);

pub fn record_bytes_sent(mode: ChannelMode, n: usize) {
    counter!(BYTES_SENT, n as u64, "protocol" => mode.protocol_label());
}

pub fn record_bytes_received(mode: ChannelMode, n: usize) {
    counter!(BYTES_RECEIVED, n as u64, "protocol" => mode.protocol_label());
}

pub fn record_finalization(kind: &'static str) {
    FINALIZATIONS_TOTAL.fetch_add(1, Ordering::Relaxed);
    counter!(FINALIZATIONS, 1, "type" => kind);
}

/// Total finalizations recorded by this process so far.
pub fn finalizations() -> u64 {
    FINALIZATIONS_TOTAL.load(Ordering::Relaxed)
}

pub fn record_clients_connected(count: usize) {
    gauge!(CLIENTS_CONNECTED, count as f64);
}

pub fn record_connect_event_failure() {
    counter!(CLIENT_CONNECTED_EVENT_FAILURES, 1);
}

pub fn record_disconnect_event_failure() {
    counter!(CLIENT_DISCONNECTED_EVENT_FAILURES, 1);
}

pub fn record_connect_event_time(seconds: f64) {
    histogram!(CLIENT_CONNECTED_EVENT_TIME, seconds);
}

pub fn record_disconnect_event_time(seconds: f64) {
    histogram!(CLIENT_DISCONNECTED_EVENT_TIME, seconds);
}

pub fn record_unreliable_drop() {
    counter!(UNRELIABLE_DROPS, 1);
}
