//! `gate_client`
//!
//! A minimal peer for a gate server. Connects the reliable channel, reads
//! the 8-byte auth token, echoes it as the first datagram, and from then on
//! exchanges length-prefixed frames over TCP and raw datagrams over UDP.
//!
//! Used by the integration tests and the demo binary; this is not a game
//! client, just the wire protocol.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

use gate_shared::framing;

pub struct GateClient {
    stream: TcpStream,
    udp: UdpSocket,
    auth_token: u64,
}

impl GateClient {
    /// Connects both channels and completes the datagram handshake.
    pub async fn connect(server_addr: SocketAddr) -> anyhow::Result<Self> {
        let client = Self::connect_tcp_only(server_addr).await?;
        client.handshake_udp().await?;
        Ok(client)
    }

    /// Connects the reliable channel and reads the auth token, leaving the
    /// datagram handshake to the caller. Tests use this to exercise wrong
    /// tokens and foreign ports.
    pub async fn connect_tcp_only(server_addr: SocketAddr) -> anyhow::Result<Self> {
        let mut stream = TcpStream::connect(server_addr)
            .await
            .context("tcp connect")?;

        // The token arrives raw, before any length-prefixed frame.
        let mut raw = [0u8; framing::AUTH_TOKEN_LEN];
        stream
            .read_exact(&mut raw)
            .await
            .context("read auth token")?;
        let auth_token = framing::decode_token(raw);
        debug!(token = auth_token, "Received auth token");

        let bind_ip: IpAddr = match server_addr.ip() {
            IpAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
            IpAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
        };
        let udp = UdpSocket::bind(SocketAddr::new(bind_ip, 0))
            .await
            .context("udp bind")?;
        udp.connect(server_addr).await.context("udp connect")?;

        Ok(Self {
            stream,
            udp,
            auth_token,
        })
    }

    /// Proves the datagram endpoint by echoing the auth token.
    pub async fn handshake_udp(&self) -> anyhow::Result<()> {
        self.udp
            .send(&framing::encode_token(self.auth_token))
            .await
            .context("udp handshake")?;
        Ok(())
    }

    pub fn auth_token(&self) -> u64 {
        self.auth_token
    }

    pub fn local_udp_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.udp.local_addr()?)
    }

    /// Sends one framed payload on the reliable channel.
    pub async fn send_reliable(&mut self, body: &[u8]) -> anyhow::Result<()> {
        let frame = framing::encode_frame(body);
        self.stream.write_all(&frame).await.context("tcp write")?;
        Ok(())
    }

    /// Writes raw bytes to the reliable channel, framing included. Lets
    /// tests send malformed or coalesced frames.
    pub async fn send_reliable_raw(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        self.stream.write_all(bytes).await.context("tcp write raw")?;
        Ok(())
    }

    /// Receives one framed payload from the reliable channel.
    pub async fn recv_reliable(&mut self) -> anyhow::Result<Vec<u8>> {
        let mut header = [0u8; framing::LENGTH_PREFIX_LEN];
        self.stream
            .read_exact(&mut header)
            .await
            .context("tcp read len")?;
        let len = framing::decode_length(header) as usize;
        let mut body = vec![0u8; len];
        self.stream
            .read_exact(&mut body)
            .await
            .context("tcp read body")?;
        Ok(body)
    }

    /// Sends one datagram payload.
    pub async fn send_unreliable(&self, body: &[u8]) -> anyhow::Result<()> {
        self.udp.send(body).await.context("udp send")?;
        Ok(())
    }

    /// Receives one datagram payload.
    pub async fn recv_unreliable(&self) -> anyhow::Result<Vec<u8>> {
        let mut buf = vec![0u8; 64 * 1024];
        let n = self.udp.recv(&mut buf).await.context("udp recv")?;
        buf.truncate(n);
        Ok(buf)
    }
}
