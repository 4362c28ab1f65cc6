//! `gate_shared`
//!
//! Primitives shared by the gate server core and the peer client:
//! - Wire framing for the reliable and unreliable channels.
//! - Pooled message buffers with leak accounting.
//! - Configuration.
//! - Telemetry emission helpers (the core writes, never reads).

pub mod buffer;
pub mod config;
pub mod framing;
pub mod telemetry;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::buffer::{BufferPool, MessageBuffer};
    pub use crate::config::{IpVersion, ServerConfig};
    pub use crate::framing::ChannelMode;
}
