//! The seam between the connection core and game code.
//!
//! An extension receives connectivity events and payloads; it never touches
//! sockets. By default its callbacks are serialized on the dispatcher. An
//! extension that declares itself thread safe is instead called directly on
//! whichever I/O task produced the event, trading serialization for one
//! less hand-off.

use std::io;
use std::sync::Arc;

use gate_shared::buffer::MessageBuffer;
pub use gate_shared::framing::ChannelMode;

use crate::clients::Client;

/// Why a session ended.
#[derive(Debug)]
pub enum DisconnectReason {
    /// This side asked for the disconnect (extension call or shutdown).
    LocalRequest,
    /// The peer closed the reliable channel.
    PeerClosed,
    /// A socket operation failed.
    TransportError(io::Error),
    /// The strike ledger reached its ceiling. Carries the final strike's
    /// reason text.
    StrikeLimit(String),
}

/// Passed to [`Extension::client_disconnected`].
#[derive(Debug)]
pub struct DisconnectInfo {
    /// True when the disconnect originated on this side.
    pub local_disconnect: bool,
    pub reason: DisconnectReason,
}

/// Game-code callbacks. All methods default to no-ops so an extension only
/// implements what it cares about; a server constructed without any
/// extension logs a warning per admitted client and discards payloads.
pub trait Extension: Send + Sync + 'static {
    /// Opt in to being called directly from I/O tasks. Implementations
    /// returning true must tolerate concurrent callbacks.
    fn thread_safe(&self) -> bool {
        false
    }

    /// Runs before the client's receive loop starts; no payload for this
    /// client can be delivered earlier. Returning an error drops the client
    /// as if it had never been admitted.
    fn client_connected(&self, _client: &Arc<Client>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs after the last payload delivery for the client. Errors are
    /// counted and logged; finalization proceeds regardless.
    fn client_disconnected(
        &self,
        _client: &Arc<Client>,
        _info: &DisconnectInfo,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// A payload arrived. The buffer is borrowed; the core releases it when
    /// the callback returns.
    fn message_received(
        &self,
        _client: &Arc<Client>,
        _message: &MessageBuffer,
        _mode: ChannelMode,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}
