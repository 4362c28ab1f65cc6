//! Demo client binary.
//!
//! Usage:
//!   cargo run -p gate_client -- [--addr 127.0.0.1:4296]
//!
//! Connects, then pings the server once over each channel and prints what
//! comes back. Pair it with the echo extension in the `gate` binary.

use std::env;
use std::net::SocketAddr;

use anyhow::Context;
use gate_client::GateClient;
use tracing::info;

fn parse_args() -> String {
    let args: Vec<String> = env::args().collect();
    let mut addr = "127.0.0.1:4296".to_string();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                addr = args[i + 1].clone();
                i += 2;
            }
            _ => i += 1,
        }
    }
    addr
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let addr: SocketAddr = parse_args().parse().context("parse server addr")?;
    info!(server = %addr, "Connecting");
    let mut client = GateClient::connect(addr).await?;
    info!("Handshake complete");

    client.send_reliable(b"ping/reliable").await?;
    let reply = client.recv_reliable().await?;
    info!(reply = %String::from_utf8_lossy(&reply), "Reliable reply");

    client.send_unreliable(b"ping/unreliable").await?;
    let reply = client.recv_unreliable().await?;
    info!(reply = %String::from_utf8_lossy(&reply), "Unreliable reply");

    Ok(())
}
