//! Bichannel listener: one TCP acceptor and one UDP socket on the same
//! address, plus the demultiplexer that ties datagrams to sessions.
//!
//! Accept path: every accepted stream is immediately sent a fresh 64-bit
//! auth token (raw, big endian, the only unprefixed bytes on the stream)
//! and parked in the pending map. The session becomes real only when the
//! peer echoes that token as its first datagram, which proves the datagram
//! source belongs to the stream peer and pins the session's unreliable
//! endpoint.
//!
//! Datagrams from endpoints that never completed the handshake are dropped
//! without a reply and without logging, so the UDP surface neither
//! amplifies nor leaks which tokens are outstanding. An aggregate
//! `unreliable_drops` counter is the only trace.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use gate_shared::buffer::BufferPool;
use gate_shared::config::ServerConfig;
use gate_shared::framing::{self, ChannelMode};
use gate_shared::telemetry;

use crate::clients::ClientManager;
use crate::connection::Connection;

const MAX_DATAGRAM_LEN: usize = 64 * 1024;

/// Route state shared with connections, which unregister themselves from
/// here on disconnect.
pub(crate) struct ListenerShared {
    pending: Mutex<HashMap<u64, Arc<Connection>>>,
    routes: Mutex<HashMap<SocketAddr, Arc<Connection>>>,
}

impl ListenerShared {
    /// Drops every route entry for a connection. Idempotent.
    pub(crate) fn forget(&self, conn: &Connection) {
        self.pending
            .lock()
            .expect("pending map lock poisoned")
            .remove(&conn.auth_token());
        if let Some(endpoint) = conn.remote_endpoint(ChannelMode::Unreliable) {
            self.routes
                .lock()
                .expect("route map lock poisoned")
                .remove(&endpoint);
        }
    }
}

pub struct BichannelListener {
    shared: Arc<ListenerShared>,
    manager: Arc<ClientManager>,
    pool: Arc<BufferPool>,
    udp: Arc<UdpSocket>,
    local_addr: SocketAddr,
    cfg: ServerConfig,
    acceptor: Mutex<Option<TcpListener>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    demux_task: Mutex<Option<JoinHandle<()>>>,
}

impl BichannelListener {
    /// Binds both channels to the configured address. Either bind failing
    /// fails the whole start.
    pub async fn bind(
        cfg: &ServerConfig,
        manager: Arc<ClientManager>,
        pool: Arc<BufferPool>,
    ) -> anyhow::Result<Arc<Self>> {
        let addr = cfg.bind_addr()?;
        let acceptor = TcpListener::bind(addr).await.context("reliable channel bind")?;
        // With an ephemeral port the UDP socket must follow the port TCP
        // actually got.
        let local_addr = acceptor.local_addr().context("reliable local addr")?;
        let udp = UdpSocket::bind(local_addr)
            .await
            .context("unreliable channel bind")?;

        Ok(Arc::new(Self {
            shared: Arc::new(ListenerShared {
                pending: Mutex::new(HashMap::new()),
                routes: Mutex::new(HashMap::new()),
            }),
            manager,
            pool,
            udp: Arc::new(udp),
            local_addr,
            cfg: cfg.clone(),
            acceptor: Mutex::new(Some(acceptor)),
            accept_task: Mutex::new(None),
            demux_task: Mutex::new(None),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Spawns the accept and datagram-demux loops. Idempotent; the second
    /// call finds the acceptor already taken.
    pub fn start(self: &Arc<Self>) {
        let Some(acceptor) = self
            .acceptor
            .lock()
            .expect("acceptor lock poisoned")
            .take()
        else {
            return;
        };
        let accept = tokio::spawn(accept_loop(Arc::clone(self), acceptor));
        let demux = tokio::spawn(udp_demux_loop(Arc::clone(self)));
        *self.accept_task.lock().expect("accept task lock poisoned") = Some(accept);
        *self.demux_task.lock().expect("demux task lock poisoned") = Some(demux);
    }

    /// Stops accepting first (abort and join, so the acceptor socket is
    /// actually gone before anything else happens), then locally
    /// disconnects every pending and registered session, then stops the
    /// datagram loop. A second sweep after the demux join catches any
    /// session whose handshake completed while the first sweep ran.
    pub async fn stop(&self) {
        let accept = self
            .accept_task
            .lock()
            .expect("accept task lock poisoned")
            .take();
        if let Some(task) = accept {
            task.abort();
            let _ = task.await;
        }
        self.disconnect_all();

        let demux = self
            .demux_task
            .lock()
            .expect("demux task lock poisoned")
            .take();
        if let Some(task) = demux {
            task.abort();
            let _ = task.await;
        }
        self.disconnect_all();
    }

    /// Best-effort synchronous cleanup for drop paths that cannot await.
    pub(crate) fn shutdown_tasks(&self) {
        if let Some(task) = self
            .accept_task
            .lock()
            .expect("accept task lock poisoned")
            .take()
        {
            task.abort();
        }
        if let Some(task) = self
            .demux_task
            .lock()
            .expect("demux task lock poisoned")
            .take()
        {
            task.abort();
        }
        self.disconnect_all();
    }

    fn disconnect_all(&self) {
        let pending: Vec<_> = self
            .shared
            .pending
            .lock()
            .expect("pending map lock poisoned")
            .values()
            .cloned()
            .collect();
        let routed: Vec<_> = self
            .shared
            .routes
            .lock()
            .expect("route map lock poisoned")
            .values()
            .cloned()
            .collect();
        for conn in pending.into_iter().chain(routed) {
            conn.disconnect();
        }
    }
}

async fn accept_loop(listener: Arc<BichannelListener>, acceptor: TcpListener) {
    loop {
        match acceptor.accept().await {
            Ok((stream, peer)) => {
                if let Err(error) = admit(&listener, stream, peer).await {
                    warn!(%peer, %error, "Failed to initialize accepted connection");
                }
            }
            Err(error) => warn!(%error, "Accept failed"),
        }
    }
}

/// Issues the auth token and parks the connection until its datagram
/// handshake arrives. Not yet visible to the client manager.
async fn admit(
    listener: &Arc<BichannelListener>,
    stream: TcpStream,
    peer: SocketAddr,
) -> anyhow::Result<()> {
    stream
        .set_nodelay(listener.cfg.no_delay)
        .context("set nodelay")?;
    let token = OsRng.next_u64();
    let (reader, writer) = stream.into_split();

    let conn = Connection::new(
        token,
        peer,
        reader,
        writer,
        Arc::clone(&listener.udp),
        Arc::clone(&listener.pool),
        Arc::downgrade(&listener.manager),
        Arc::downgrade(&listener.shared),
        &listener.cfg,
    );
    // Register before the token leaves, so the datagram echo can never
    // beat the pending entry.
    listener
        .shared
        .pending
        .lock()
        .expect("pending map lock poisoned")
        .insert(token, Arc::clone(&conn));

    if let Err(error) = conn.send_raw(&framing::encode_token(token)).await {
        listener
            .shared
            .pending
            .lock()
            .expect("pending map lock poisoned")
            .remove(&token);
        return Err(error).context("write auth token");
    }
    telemetry::record_bytes_sent(ChannelMode::Reliable, framing::AUTH_TOKEN_LEN);
    debug!(%peer, "Issued auth token; awaiting datagram handshake");
    Ok(())
}

async fn udp_demux_loop(listener: Arc<BichannelListener>) {
    let mut scratch = vec![0u8; MAX_DATAGRAM_LEN];
    loop {
        let (len, from) = match listener.udp.recv_from(&mut scratch).await {
            Ok(received) => received,
            Err(error) => {
                warn!(%error, "Datagram receive failed");
                continue;
            }
        };

        // Established endpoints first; a handshaken peer may legitimately
        // send 8-byte payloads.
        let routed = {
            let routes = listener
                .shared
                .routes
                .lock()
                .expect("route map lock poisoned");
            // Counted while the route lock is held: a teardown removes the
            // route under this lock before draining, so it cannot miss
            // this hand-off.
            routes.get(&from).map(|conn| conn.track_delivery())
        };
        if let Some(delivery) = routed {
            telemetry::record_bytes_received(ChannelMode::Unreliable, len);
            match delivery.conn().client() {
                Some(client) => {
                    let mut buffer = listener.pool.acquire(len);
                    buffer.bytes_mut().copy_from_slice(&scratch[..len]);
                    listener
                        .manager
                        .handle_message(client, buffer, ChannelMode::Unreliable)
                        .await;
                }
                // Teardown raced the datagram.
                None => {}
            }
            continue;
        }

        if len != framing::AUTH_TOKEN_LEN {
            telemetry::record_unreliable_drop();
            continue;
        }
        let mut raw = [0u8; framing::AUTH_TOKEN_LEN];
        raw.copy_from_slice(&scratch[..framing::AUTH_TOKEN_LEN]);
        let token = framing::decode_token(raw);
        let Some(conn) = listener
            .shared
            .pending
            .lock()
            .expect("pending map lock poisoned")
            .remove(&token)
        else {
            // Wrong or stale token. Nothing leaks back to the sender.
            telemetry::record_unreliable_drop();
            continue;
        };

        conn.set_remote_unreliable(from);
        listener
            .shared
            .routes
            .lock()
            .expect("route map lock poisoned")
            .insert(from, Arc::clone(&conn));
        debug!(%from, "Datagram handshake complete");
        // The handshake datagram itself is never delivered as a payload.
        listener.manager.handle_new_connection(conn).await;
    }
}
