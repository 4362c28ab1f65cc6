//! Standalone gate server binary.
//!
//! Usage:
//!   cargo run -p gate_server -- [--config gate.json] [--addr 127.0.0.1] [--port 4296]
//!
//! Runs with a trivial echo extension: every received payload is sent back
//! on the channel it arrived on. Useful for smoke testing a deployment
//! with the `gate_client` binary.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use gate_server::clients::Client;
use gate_server::extension::{ChannelMode, Extension};
use gate_server::GateServer;
use gate_shared::buffer::MessageBuffer;
use gate_shared::config::ServerConfig;
use tracing::info;

struct EchoExtension;

impl Extension for EchoExtension {
    fn thread_safe(&self) -> bool {
        true
    }

    fn message_received(
        &self,
        client: &Arc<Client>,
        message: &MessageBuffer,
        mode: ChannelMode,
    ) -> anyhow::Result<()> {
        let echo = MessageBuffer::from_vec(message.bytes().to_vec());
        match mode {
            ChannelMode::Reliable => client.send_reliable(echo),
            ChannelMode::Unreliable => client.send_unreliable(echo),
        };
        Ok(())
    }
}

fn parse_args() -> anyhow::Result<ServerConfig> {
    let args: Vec<String> = env::args().collect();
    let mut cfg = ServerConfig::default();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" if i + 1 < args.len() => {
                let raw = std::fs::read_to_string(&args[i + 1])
                    .with_context(|| format!("read config {}", args[i + 1]))?;
                cfg = ServerConfig::from_json_str(&raw).context("parse config")?;
                i += 2;
            }
            "--addr" if i + 1 < args.len() => {
                cfg.address = args[i + 1].clone();
                i += 2;
            }
            "--port" if i + 1 < args.len() => {
                cfg.port = args[i + 1].parse().unwrap_or(cfg.port);
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(addr = %cfg.address, port = cfg.port, "Starting gate server");

    let server = GateServer::bind(cfg, Some(Arc::new(EchoExtension)))
        .await
        .context("bind server")?;
    server.start();

    // Runs until killed; periodically report the session count.
    loop {
        tokio::time::sleep(Duration::from_secs(30)).await;
        info!(clients = server.connected_count(), "Status");
    }
}
