//! Configuration system.
//!
//! Loads server configuration from JSON strings/files (file IO left to app).
//! Keys are camelCase on the wire to stay compatible with existing deploy
//! tooling.

use std::net::{IpAddr, SocketAddr};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::framing;

/// Address family for the listener. One family per listener instance; no
/// dual-stack sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpVersion {
    V4,
    V6,
}

/// Root configuration for a gate server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Listen address for both channels, e.g. `127.0.0.1`.
    #[serde(default = "default_address")]
    pub address: String,
    /// Listen port for both channels.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Address family the listener binds.
    #[serde(default = "default_ip_version")]
    pub ip_version: IpVersion,
    /// Strike ledger ceiling per connection.
    #[serde(default = "default_max_strikes")]
    pub max_strikes: u32,
    /// Pass-through to the reliable socket's no-delay flag.
    #[serde(default)]
    pub no_delay: bool,
    /// Serialize reliable delivery with reception (see the connection
    /// receive loop). Turning this off trades ordering for throughput.
    #[serde(default = "default_preserve_ordering")]
    pub preserve_ordering: bool,
    /// Reliable frames declaring a body at or above this length are
    /// rejected with a strike.
    #[serde(default = "default_max_reliable_body_length")]
    pub max_reliable_body_length: u32,
    /// Cache ceilings for pooled objects. Readers, writers and I/O event
    /// holders are accepted for config compatibility; only the message
    /// cache exists in this implementation.
    #[serde(default = "default_small_cache")]
    pub max_cached_readers: usize,
    #[serde(default = "default_small_cache")]
    pub max_cached_writers: usize,
    #[serde(default = "default_message_cache")]
    pub max_cached_messages: usize,
    #[serde(default = "default_message_cache")]
    pub max_cached_io_events: usize,
    /// Capacity of the dispatcher queue; submitters back off when full.
    #[serde(default = "default_max_dispatcher_tasks")]
    pub max_dispatcher_tasks: usize,
}

fn default_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    4296
}

fn default_ip_version() -> IpVersion {
    IpVersion::V4
}

fn default_max_strikes() -> u32 {
    3
}

fn default_preserve_ordering() -> bool {
    true
}

fn default_max_reliable_body_length() -> u32 {
    framing::DEFAULT_MAX_BODY_LEN
}

fn default_small_cache() -> usize {
    2
}

fn default_message_cache() -> usize {
    4
}

fn default_max_dispatcher_tasks() -> usize {
    512
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            ip_version: default_ip_version(),
            max_strikes: default_max_strikes(),
            no_delay: false,
            preserve_ordering: default_preserve_ordering(),
            max_reliable_body_length: default_max_reliable_body_length(),
            max_cached_readers: default_small_cache(),
            max_cached_writers: default_small_cache(),
            max_cached_messages: default_message_cache(),
            max_cached_io_events: default_message_cache(),
            max_dispatcher_tasks: default_max_dispatcher_tasks(),
        }
    }
}

impl ServerConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Resolves the bind address, checking it against `ipVersion`.
    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        let ip: IpAddr = self.address.parse().context("parse listen address")?;
        match (self.ip_version, ip) {
            (IpVersion::V4, IpAddr::V4(_)) | (IpVersion::V6, IpAddr::V6(_)) => {}
            _ => anyhow::bail!(
                "listen address {} does not match ipVersion {:?}",
                self.address,
                self.ip_version
            ),
        }
        Ok(SocketAddr::new(ip, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.port, 4296);
        assert_eq!(cfg.max_strikes, 3);
        assert!(cfg.preserve_ordering);
        assert_eq!(cfg.max_reliable_body_length, framing::DEFAULT_MAX_BODY_LEN);
        assert!(cfg.bind_addr().is_ok());
    }

    #[test]
    fn parses_camel_case_keys() {
        let cfg = ServerConfig::from_json_str(
            r#"{
                "address": "0.0.0.0",
                "port": 9000,
                "ipVersion": "v4",
                "maxStrikes": 5,
                "noDelay": true,
                "preserveOrdering": false,
                "maxReliableBodyLength": 1024,
                "maxCachedReaders": 8,
                "maxCachedWriters": 8,
                "maxCachedMessages": 16,
                "maxCachedIoEvents": 16,
                "maxDispatcherTasks": 64
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.max_strikes, 5);
        assert!(cfg.no_delay);
        assert!(!cfg.preserve_ordering);
        assert_eq!(cfg.max_reliable_body_length, 1024);
        assert_eq!(cfg.max_cached_messages, 16);
        assert_eq!(cfg.max_dispatcher_tasks, 64);
    }

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let cfg = ServerConfig::from_json_str(r#"{"port": 1234}"#).unwrap();
        assert_eq!(cfg.port, 1234);
        assert_eq!(cfg.address, "127.0.0.1");
        assert_eq!(cfg.max_strikes, 3);
    }

    #[test]
    fn bind_addr_rejects_family_mismatch() {
        let cfg = ServerConfig {
            address: "::1".to_string(),
            ip_version: IpVersion::V4,
            ..Default::default()
        };
        assert!(cfg.bind_addr().is_err());

        let cfg = ServerConfig {
            address: "::1".to_string(),
            ip_version: IpVersion::V6,
            ..Default::default()
        };
        assert!(cfg.bind_addr().is_ok());
    }
}
