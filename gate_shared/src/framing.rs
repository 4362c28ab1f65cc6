//! Wire framing for the bichannel link.
//!
//! Reliable channel: every frame is `[u32 length, big endian][length bytes]`.
//! The one exception is the very first transmission after accept, where the
//! server writes the raw 8-byte auth token with no prefix.
//!
//! Unreliable channel: no prefix at all. The datagram boundary is the frame
//! boundary, and datagrams above the path MTU are the sender's problem.
//!
//! All encodings are big endian regardless of host byte order.

use bytes::{BufMut, BytesMut};

/// Size of the reliable-channel length prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Size of the auth token exchanged during the handshake.
pub const AUTH_TOKEN_LEN: usize = 8;

/// Default ceiling for a declared reliable body length. Conservative; a
/// frame at this size still fits one pooled buffer. Configurable via
/// `maxReliableBodyLength`.
pub const DEFAULT_MAX_BODY_LEN: u32 = 64 * 1024;

/// Which half of the bichannel a message travelled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelMode {
    /// Ordered byte stream (TCP).
    Reliable,
    /// Datagrams (UDP); loss, duplication and reordering are visible.
    Unreliable,
}

impl ChannelMode {
    /// Label used for the `protocol` metric dimension.
    pub fn protocol_label(self) -> &'static str {
        match self {
            ChannelMode::Reliable => "tcp",
            ChannelMode::Unreliable => "udp",
        }
    }
}

/// Encodes a reliable-channel length prefix.
pub fn encode_length(len: u32) -> [u8; LENGTH_PREFIX_LEN] {
    len.to_be_bytes()
}

/// Decodes a reliable-channel length prefix.
pub fn decode_length(header: [u8; LENGTH_PREFIX_LEN]) -> u32 {
    u32::from_be_bytes(header)
}

/// Encodes an auth token as it appears on the wire.
pub fn encode_token(token: u64) -> [u8; AUTH_TOKEN_LEN] {
    token.to_be_bytes()
}

/// Decodes an auth token from its wire form.
pub fn decode_token(raw: [u8; AUTH_TOKEN_LEN]) -> u64 {
    u64::from_be_bytes(raw)
}

/// Assembles a complete reliable frame (prefix + body) ready for a single
/// write.
pub fn encode_frame(body: &[u8]) -> BytesMut {
    let mut frame = BytesMut::with_capacity(LENGTH_PREFIX_LEN + body.len());
    frame.put_u32(body.len() as u32);
    frame.extend_from_slice(body);
    frame
}
