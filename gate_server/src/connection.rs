//! Per-session state machine.
//!
//! A connection owns one reliable stream plus the session's view of the
//! shared unreliable socket. It moves through
//! `Handshaking -> Listening -> Disconnecting -> Closed`, one way only.
//! `can_send` and `is_listening` never flip back to true; readers may
//! observe a stale true but never a stale false once a disconnect has
//! returned.
//!
//! The receive loop reads a pooled 4-byte header, then the declared body,
//! with `read_exact` absorbing short reads. Declared lengths at or above
//! the configured ceiling are rejected with a weight-10 strike and consume
//! no body bytes.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::warn;

use gate_shared::buffer::{BufferPool, MessageBuffer};
use gate_shared::config::ServerConfig;
use gate_shared::framing::{self, ChannelMode};
use gate_shared::telemetry;

use crate::clients::{Client, ClientManager};
use crate::extension::{DisconnectInfo, DisconnectReason};
use crate::listener::ListenerShared;

/// Strike weight for routine misbehavior.
pub const STRIKE_MISBEHAVIOR: u32 = 1;
/// Strike weight for a protocol violation.
pub const STRIKE_PROTOCOL_VIOLATION: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Handshaking,
    Listening,
    Disconnecting,
    Closed,
}

pub struct Connection {
    auth_token: u64,
    remote_reliable: SocketAddr,
    remote_unreliable: OnceLock<SocketAddr>,

    reader: Mutex<Option<OwnedReadHalf>>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    udp: Arc<UdpSocket>,
    pool: Arc<BufferPool>,

    state: Mutex<ConnState>,
    can_send: AtomicBool,
    is_listening: AtomicBool,
    shutdown: Notify,

    // Payload hand-offs not yet on the dispatcher. Teardown drains this to
    // zero before the disconnect event is dispatched, so the event cannot
    // overtake the last delivery even when hand-offs are spawned.
    inflight_deliveries: AtomicUsize,
    deliveries_flushed: Notify,

    strikes: AtomicU32,
    max_strikes: u32,
    max_body_len: u32,
    preserve_ordering: bool,

    manager: Weak<ClientManager>,
    listener: Weak<ListenerShared>,
    client: OnceLock<Weak<Client>>,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        auth_token: u64,
        remote_reliable: SocketAddr,
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        udp: Arc<UdpSocket>,
        pool: Arc<BufferPool>,
        manager: Weak<ClientManager>,
        listener: Weak<ListenerShared>,
        cfg: &ServerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            auth_token,
            remote_reliable,
            remote_unreliable: OnceLock::new(),
            reader: Mutex::new(Some(reader)),
            writer: tokio::sync::Mutex::new(Some(writer)),
            udp,
            pool,
            state: Mutex::new(ConnState::Handshaking),
            can_send: AtomicBool::new(true),
            is_listening: AtomicBool::new(false),
            shutdown: Notify::new(),
            inflight_deliveries: AtomicUsize::new(0),
            deliveries_flushed: Notify::new(),
            strikes: AtomicU32::new(0),
            max_strikes: cfg.max_strikes,
            max_body_len: cfg.max_reliable_body_length,
            preserve_ordering: cfg.preserve_ordering,
            manager,
            listener,
            client: OnceLock::new(),
        })
    }

    pub fn auth_token(&self) -> u64 {
        self.auth_token
    }

    pub fn remote_endpoint(&self, mode: ChannelMode) -> Option<SocketAddr> {
        match mode {
            ChannelMode::Reliable => Some(self.remote_reliable),
            ChannelMode::Unreliable => self.remote_unreliable.get().copied(),
        }
    }

    /// Records the datagram peer. Write-once; the handshake is the only
    /// caller.
    pub(crate) fn set_remote_unreliable(&self, endpoint: SocketAddr) {
        let _ = self.remote_unreliable.set(endpoint);
    }

    pub(crate) fn bind_client(&self, client: &Arc<Client>) {
        let _ = self.client.set(Arc::downgrade(client));
    }

    pub(crate) fn client(&self) -> Option<Arc<Client>> {
        self.client.get().and_then(Weak::upgrade)
    }

    pub fn can_send(&self) -> bool {
        self.can_send.load(Ordering::SeqCst)
    }

    pub fn is_listening(&self) -> bool {
        self.is_listening.load(Ordering::SeqCst)
    }

    /// Current strike ledger value.
    pub fn strikes(&self) -> u32 {
        self.strikes.load(Ordering::SeqCst)
    }

    /// Starts the reliable receive loop. Runs as the continuation of the
    /// connect callback, so no payload can overtake the connect event.
    pub(crate) fn start_listening(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().expect("connection state lock poisoned");
            if *state != ConnState::Handshaking {
                return;
            }
            *state = ConnState::Listening;
        }
        self.is_listening.store(true, Ordering::SeqCst);
        let Some(reader) = self
            .reader
            .lock()
            .expect("connection reader lock poisoned")
            .take()
        else {
            return;
        };
        let conn = Arc::clone(self);
        tokio::spawn(run_receive_loop(conn, reader));
    }

    /// Marks a payload hand-off as in flight until the returned guard
    /// drops. Guard-based so a cancelled delivery still decrements.
    pub(crate) fn track_delivery(self: &Arc<Self>) -> DeliveryGuard {
        self.inflight_deliveries.fetch_add(1, Ordering::SeqCst);
        DeliveryGuard {
            conn: Arc::clone(self),
        }
    }

    fn end_delivery(&self) {
        if self.inflight_deliveries.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.deliveries_flushed.notify_waiters();
        }
    }

    /// Resolves once no payload hand-off is in flight.
    pub(crate) async fn flush_deliveries(&self) {
        loop {
            let flushed = self.deliveries_flushed.notified();
            tokio::pin!(flushed);
            // Register before the recheck so a racing end_delivery cannot
            // slip between them unseen.
            flushed.as_mut().enable();
            if self.inflight_deliveries.load(Ordering::SeqCst) == 0 {
                return;
            }
            flushed.await;
        }
    }

    /// Writes raw bytes on the reliable channel, bypassing framing. Only
    /// the handshake token uses this.
    pub(crate) async fn send_raw(&self, bytes: &[u8]) -> io::Result<()> {
        let mut guard = self.writer.lock().await;
        match guard.as_mut() {
            Some(writer) => writer.write_all(bytes).await,
            None => Ok(()),
        }
    }

    /// Queues a frame on the reliable channel. Returns false (releasing the
    /// buffer) when the session can no longer send; actual completion is
    /// asynchronous and a failure there tears the session down.
    pub fn send_reliable(self: &Arc<Self>, buffer: MessageBuffer) -> bool {
        if !self.can_send() {
            self.pool.release(buffer);
            return false;
        }
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            let frame = framing::encode_frame(buffer.bytes());
            let mut guard = conn.writer.lock().await;
            let Some(writer) = guard.as_mut() else {
                // Lost a race with teardown; the buffer still goes back.
                drop(guard);
                conn.pool.release(buffer);
                return;
            };
            let outcome = writer.write_all(&frame).await;
            drop(guard);
            conn.pool.release(buffer);
            match outcome {
                Ok(()) => telemetry::record_bytes_sent(ChannelMode::Reliable, frame.len()),
                Err(error) => conn.handle_transport_error(error),
            }
        });
        true
    }

    /// Queues a datagram to the session's unreliable endpoint. There is no
    /// completion ordering guarantee; failures are logged asynchronously.
    pub fn send_unreliable(self: &Arc<Self>, buffer: MessageBuffer) -> bool {
        if !self.can_send() {
            self.pool.release(buffer);
            return false;
        }
        let Some(target) = self.remote_endpoint(ChannelMode::Unreliable) else {
            self.pool.release(buffer);
            return false;
        };
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            match conn.udp.send_to(buffer.bytes(), target).await {
                Ok(sent) => telemetry::record_bytes_sent(ChannelMode::Unreliable, sent),
                Err(error) => warn!(remote = %target, %error, "Unreliable send failed"),
            }
            conn.pool.release(buffer);
        });
        true
    }

    /// Adds to the strike ledger; at the ceiling the session is
    /// disconnected with the final strike's reason.
    pub fn strike(self: &Arc<Self>, reason: &str, weight: u32) {
        let total = self
            .strikes
            .fetch_add(weight, Ordering::SeqCst)
            .saturating_add(weight);
        warn!(remote = %self.remote_reliable, reason, weight, total, "Strike recorded");
        if total >= self.max_strikes {
            self.disconnect_with(DisconnectInfo {
                local_disconnect: true,
                reason: DisconnectReason::StrikeLimit(reason.to_string()),
            });
        }
    }

    /// Locally terminates the session. True only for the call that actually
    /// performed the transition; once disconnected, always false.
    pub fn disconnect(self: &Arc<Self>) -> bool {
        self.disconnect_with(DisconnectInfo {
            local_disconnect: true,
            reason: DisconnectReason::LocalRequest,
        })
    }

    pub(crate) fn handle_peer_closed(self: &Arc<Self>) {
        self.disconnect_with(DisconnectInfo {
            local_disconnect: false,
            reason: DisconnectReason::PeerClosed,
        });
    }

    pub(crate) fn handle_transport_error(self: &Arc<Self>, error: io::Error) {
        self.disconnect_with(DisconnectInfo {
            local_disconnect: false,
            reason: DisconnectReason::TransportError(error),
        });
    }

    /// Single winner for all teardown causes; concurrent callers lose and
    /// see false, which is what collapses a transport-error/extension
    /// disconnect race to one event.
    pub(crate) fn disconnect_with(self: &Arc<Self>, info: DisconnectInfo) -> bool {
        {
            let mut state = self.state.lock().expect("connection state lock poisoned");
            match *state {
                ConnState::Disconnecting | ConnState::Closed => return false,
                _ => *state = ConnState::Disconnecting,
            }
            self.can_send.store(false, Ordering::SeqCst);
            self.is_listening.store(false, Ordering::SeqCst);
        }
        self.shutdown.notify_one();
        if let Some(listener) = self.listener.upgrade() {
            listener.forget(self);
        }
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            if let Some(mut writer) = conn.writer.lock().await.take() {
                // FIN on the write side; the receive loop drops the read
                // half on its way out. "Already shut down" is swallowed.
                let _ = writer.shutdown().await;
            }
            // The disconnect event happens after the last payload delivery
            // for this client; wait out hand-offs still in flight before
            // joining the same serial queue behind them.
            conn.flush_deliveries().await;
            match (conn.client(), conn.manager.upgrade()) {
                (Some(client), Some(manager)) => manager.handle_disconnection(client, info).await,
                // Never admitted (or the manager is gone): nothing to
                // announce, close out directly.
                _ => conn.mark_closed(),
            }
        });
        true
    }

    pub(crate) fn mark_closed(&self) {
        *self.state.lock().expect("connection state lock poisoned") = ConnState::Closed;
    }

    /// Final resource teardown. Disconnects first if the session is somehow
    /// still live; sockets are already shut down by then.
    pub(crate) fn dispose(self: &Arc<Self>) {
        if self.can_send() || self.is_listening() {
            self.disconnect();
        }
        self.mark_closed();
    }
}

/// Keeps one payload hand-off counted as in flight for its connection.
pub(crate) struct DeliveryGuard {
    conn: Arc<Connection>,
}

impl DeliveryGuard {
    pub(crate) fn conn(&self) -> &Arc<Connection> {
        &self.conn
    }
}

impl Drop for DeliveryGuard {
    fn drop(&mut self) {
        self.conn.end_delivery();
    }
}

enum LoopEnd {
    /// A local disconnect asked the loop to stop; teardown already ran.
    Requested,
    PeerClosed,
    Failed(io::Error),
}

fn end_from(error: io::Error) -> LoopEnd {
    if error.kind() == io::ErrorKind::UnexpectedEof {
        LoopEnd::PeerClosed
    } else {
        LoopEnd::Failed(error)
    }
}

async fn run_receive_loop(conn: Arc<Connection>, mut reader: OwnedReadHalf) {
    match receive_frames(&conn, &mut reader).await {
        LoopEnd::Requested => {}
        LoopEnd::PeerClosed => conn.handle_peer_closed(),
        LoopEnd::Failed(error) => conn.handle_transport_error(error),
    }
    // Dropping the reader here closes the read direction.
}

async fn receive_frames(conn: &Arc<Connection>, reader: &mut OwnedReadHalf) -> LoopEnd {
    loop {
        if !conn.is_listening() {
            return LoopEnd::Requested;
        }

        let mut header = conn.pool.acquire(framing::LENGTH_PREFIX_LEN);
        let read = tokio::select! {
            _ = conn.shutdown.notified() => {
                conn.pool.release(header);
                return LoopEnd::Requested;
            }
            read = reader.read_exact(header.bytes_mut()) => read,
        };
        if let Err(error) = read {
            conn.pool.release(header);
            return end_from(error);
        }
        telemetry::record_bytes_received(ChannelMode::Reliable, framing::LENGTH_PREFIX_LEN);

        let mut raw = [0u8; framing::LENGTH_PREFIX_LEN];
        raw.copy_from_slice(header.bytes());
        conn.pool.release(header);
        let declared = framing::decode_length(raw);

        if declared >= conn.max_body_len {
            conn.strike("oversized frame length", STRIKE_PROTOCOL_VIOLATION);
            // Loop top notices if that strike ended the session. The frame
            // consumed only its header; the stream resumes at the next
            // header position.
            continue;
        }

        let mut body = conn.pool.acquire(declared as usize);
        if declared > 0 {
            let read = tokio::select! {
                _ = conn.shutdown.notified() => {
                    conn.pool.release(body);
                    return LoopEnd::Requested;
                }
                read = reader.read_exact(body.bytes_mut()) => read,
            };
            if let Err(error) = read {
                conn.pool.release(body);
                return end_from(error);
            }
            telemetry::record_bytes_received(ChannelMode::Reliable, declared as usize);
        }

        let (Some(client), Some(manager)) = (conn.client(), conn.manager.upgrade()) else {
            conn.pool.release(body);
            return LoopEnd::Requested;
        };

        if conn.preserve_ordering {
            // Hand off before the next header read; the serial dispatcher
            // then delivers in wire order.
            manager
                .handle_message(client, body, ChannelMode::Reliable)
                .await;
        } else {
            // Next read first, delivery in parallel. Consumers asked for
            // this and must not assume reliable-channel order. The
            // hand-off is counted so teardown can wait for it.
            let delivery = conn.track_delivery();
            tokio::spawn(async move {
                manager
                    .handle_message(client, body, ChannelMode::Reliable)
                    .await;
                drop(delivery);
            });
        }
    }
}
