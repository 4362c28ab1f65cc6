//! Client identity and the connected-client table.
//!
//! Ids are u16, allocated by a linear probe starting one past the last
//! allocation. An id lives in at most one of three places: the reserved
//! set (admission in flight), the populated table (connected), or free.
//! The `clients_connected` gauge tracks the populated count and is updated
//! inside the table lock, so it is exact after every mutation.
//!
//! Lock order is always `ids` then `clients`, never the reverse.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use tracing::{info, warn};

use gate_shared::buffer::{BufferPool, MessageBuffer};
use gate_shared::framing::ChannelMode;
use gate_shared::telemetry;

use crate::connection::Connection;
use crate::dispatcher::{DispatchTask, Dispatcher};
use crate::extension::{DisconnectInfo, DisconnectReason, Extension};

/// The extension-visible identity of one session.
pub struct Client {
    id: u16,
    connection: Arc<Connection>,
    attachment: OnceLock<Box<dyn Any + Send + Sync>>,
}

impl Client {
    pub(crate) fn new(id: u16, connection: Arc<Connection>) -> Arc<Self> {
        Arc::new(Self {
            id,
            connection,
            attachment: OnceLock::new(),
        })
    }

    /// Unique among currently connected clients; released only after full
    /// disconnect.
    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn send_reliable(&self, buffer: MessageBuffer) -> bool {
        self.connection.send_reliable(buffer)
    }

    pub fn send_unreliable(&self, buffer: MessageBuffer) -> bool {
        self.connection.send_unreliable(buffer)
    }

    pub fn disconnect(&self) -> bool {
        self.connection.disconnect()
    }

    pub fn strike(&self, reason: &str, weight: u32) {
        self.connection.strike(reason, weight)
    }

    pub fn remote_endpoint(&self, mode: ChannelMode) -> Option<SocketAddr> {
        self.connection.remote_endpoint(mode)
    }

    /// Attaches extension state to this client. The first attach wins;
    /// returns false if state was already present.
    pub fn attach(&self, state: Box<dyn Any + Send + Sync>) -> bool {
        self.attachment.set(state).is_ok()
    }

    /// Borrows previously attached state, if it is a `T`.
    pub fn attachment<T: 'static>(&self) -> Option<&T> {
        self.attachment.get().and_then(|any| any.downcast_ref())
    }
}

/// Linear-probe id allocator over the u16 space.
#[derive(Debug, Default)]
struct IdAllocator {
    last_allocated: u16,
    reserved: HashSet<u16>,
}

impl IdAllocator {
    /// Probes from one past the last allocation, skipping ids that are
    /// reserved or populated. None after one full circuit.
    fn reserve(&mut self, populated: impl Fn(u16) -> bool) -> Option<u16> {
        let start = self.last_allocated;
        let mut candidate = start.wrapping_add(1);
        loop {
            if !self.reserved.contains(&candidate) && !populated(candidate) {
                self.reserved.insert(candidate);
                self.last_allocated = candidate;
                return Some(candidate);
            }
            if candidate == start {
                return None;
            }
            candidate = candidate.wrapping_add(1);
        }
    }

    fn release(&mut self, id: u16) -> bool {
        self.reserved.remove(&id)
    }
}

/// Owns the client table and runs admission, disconnection and payload
/// fan-out.
pub struct ClientManager {
    clients: Mutex<HashMap<u16, Arc<Client>>>,
    ids: Mutex<IdAllocator>,
    extension: Option<Arc<dyn Extension>>,
    dispatcher: Dispatcher,
    pool: Arc<BufferPool>,
}

impl ClientManager {
    pub(crate) fn new(
        extension: Option<Arc<dyn Extension>>,
        dispatcher: Dispatcher,
        pool: Arc<BufferPool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            clients: Mutex::new(HashMap::new()),
            ids: Mutex::new(IdAllocator::default()),
            extension,
            dispatcher,
            pool,
        })
    }

    pub fn connected_count(&self) -> usize {
        self.clients.lock().expect("client table lock poisoned").len()
    }

    pub fn client(&self, id: u16) -> Option<Arc<Client>> {
        self.clients
            .lock()
            .expect("client table lock poisoned")
            .get(&id)
            .cloned()
    }

    /// Snapshot of every connected client.
    pub fn clients(&self) -> Vec<Arc<Client>> {
        self.clients
            .lock()
            .expect("client table lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    fn reserve_id(&self) -> Option<u16> {
        let mut ids = self.ids.lock().expect("id allocator lock poisoned");
        // The populated check nests inside the id lock, matching the fixed
        // ids-then-clients order used everywhere.
        let clients = self.clients.lock().expect("client table lock poisoned");
        ids.reserve(|id| clients.contains_key(&id))
    }

    /// Admits a freshly handshaken connection: reserves an id, publishes
    /// the client, and runs the connect callback. Listening starts as the
    /// callback's continuation; a failing callback drops the client
    /// instead.
    pub(crate) async fn handle_new_connection(self: &Arc<Self>, conn: Arc<Connection>) {
        let Some(id) = self.reserve_id() else {
            warn!(
                remote = ?conn.remote_endpoint(ChannelMode::Reliable),
                "Client id space exhausted; dropping new connection"
            );
            conn.disconnect();
            return;
        };

        let client = Client::new(id, Arc::clone(&conn));
        conn.bind_client(&client);
        {
            let mut ids = self.ids.lock().expect("id allocator lock poisoned");
            let mut clients = self.clients.lock().expect("client table lock poisoned");
            ids.release(id);
            clients.insert(id, Arc::clone(&client));
            telemetry::record_clients_connected(clients.len());
        }
        info!(
            client_id = id,
            remote = ?client.remote_endpoint(ChannelMode::Reliable),
            "Client connected"
        );

        let Some(ext) = self.extension.clone() else {
            warn!(
                client_id = id,
                "No extension registered; received messages have nowhere to go"
            );
            conn.start_listening();
            return;
        };

        let primary = {
            let ext = Arc::clone(&ext);
            let client = Arc::clone(&client);
            move || run_connected_handler(&ext, &client)
        };
        let continuation = {
            let manager = Arc::clone(self);
            move |ok: bool| {
                if ok {
                    conn.start_listening();
                } else {
                    manager.drop_client(&client);
                    conn.disconnect();
                }
            }
        };
        let task = DispatchTask::new(primary).and_then(continuation);
        if ext.thread_safe() {
            Dispatcher::run_inline(task);
        } else {
            self.dispatcher.dispatch_if_needed(task).await;
        }
    }

    /// Removes a client whose connect callback failed, without raising a
    /// disconnect event: from the extension's point of view it was never
    /// admitted.
    fn drop_client(&self, client: &Arc<Client>) {
        let id = client.id();
        let mut ids = self.ids.lock().expect("id allocator lock poisoned");
        let mut clients = self.clients.lock().expect("client table lock poisoned");
        ids.release(id);
        if clients.remove(&id).is_some() {
            telemetry::record_clients_connected(clients.len());
        }
        warn!(client_id = id, "Client dropped after connect handler failure");
    }

    /// Tears a client out of the table and runs the disconnect callback;
    /// its continuation finalizes the connection. Safe to reach twice; the
    /// second caller finds the id already gone and returns.
    pub(crate) async fn handle_disconnection(
        self: &Arc<Self>,
        client: Arc<Client>,
        info: DisconnectInfo,
    ) {
        let id = client.id();
        let removed = {
            let mut ids = self.ids.lock().expect("id allocator lock poisoned");
            let mut clients = self.clients.lock().expect("client table lock poisoned");
            let was_reserved = ids.release(id);
            let was_populated = clients.remove(&id).is_some();
            if was_populated {
                telemetry::record_clients_connected(clients.len());
            }
            was_reserved || was_populated
        };
        if !removed {
            // A disconnect raced a disconnect.
            return;
        }

        log_disconnection(id, &info);

        let Some(ext) = self.extension.clone() else {
            client.connection().dispose();
            return;
        };

        let primary = {
            let ext = Arc::clone(&ext);
            let client = Arc::clone(&client);
            move || run_disconnected_handler(&ext, &client, &info)
        };
        let continuation = move |_ok: bool| {
            client.connection().dispose();
        };
        let task = DispatchTask::new(primary).and_then(continuation);
        if ext.thread_safe() {
            Dispatcher::run_inline(task);
        } else {
            self.dispatcher.dispatch_if_needed(task).await;
        }
    }

    /// Fans a received payload out to the extension. The buffer is released
    /// here on every path once the callback returns.
    pub(crate) async fn handle_message(
        &self,
        client: Arc<Client>,
        buffer: MessageBuffer,
        mode: ChannelMode,
    ) {
        let Some(ext) = self.extension.clone() else {
            self.pool.release(buffer);
            return;
        };
        if ext.thread_safe() {
            if let Err(error) = ext.message_received(&client, &buffer, mode) {
                warn!(client_id = client.id(), %error, "Message handler failed");
            }
            self.pool.release(buffer);
        } else {
            let pool = Arc::clone(&self.pool);
            let task = DispatchTask::new(move || {
                let result = ext.message_received(&client, &buffer, mode);
                pool.release(buffer);
                result
            });
            self.dispatcher.dispatch_if_needed(task).await;
        }
    }
}

fn run_connected_handler(ext: &Arc<dyn Extension>, client: &Arc<Client>) -> anyhow::Result<()> {
    let started = Instant::now();
    let result = ext.client_connected(client);
    telemetry::record_connect_event_time(started.elapsed().as_secs_f64());
    if result.is_err() {
        telemetry::record_connect_event_failure();
    }
    result
}

fn run_disconnected_handler(
    ext: &Arc<dyn Extension>,
    client: &Arc<Client>,
    info: &DisconnectInfo,
) -> anyhow::Result<()> {
    let started = Instant::now();
    let result = ext.client_disconnected(client, info);
    telemetry::record_disconnect_event_time(started.elapsed().as_secs_f64());
    if result.is_err() {
        telemetry::record_disconnect_event_failure();
    }
    result
}

fn log_disconnection(id: u16, info: &DisconnectInfo) {
    match &info.reason {
        DisconnectReason::LocalRequest | DisconnectReason::PeerClosed => {
            info!(
                client_id = id,
                local = info.local_disconnect,
                "Client disconnected"
            );
        }
        DisconnectReason::StrikeLimit(reason) => {
            info!(client_id = id, reason = %reason, "Client disconnected at strike limit");
        }
        DisconnectReason::TransportError(error) => {
            info!(client_id = id, error = %error, "Client disconnected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::IdAllocator;

    #[test]
    fn allocates_distinct_ascending_ids() {
        let mut ids = IdAllocator::default();
        let a = ids.reserve(|_| false).unwrap();
        let b = ids.reserve(|_| false).unwrap();
        let c = ids.reserve(|_| false).unwrap();
        assert_eq!((a, b, c), (1, 2, 3));
    }

    #[test]
    fn skips_reserved_and_populated_ids() {
        let mut ids = IdAllocator::default();
        let first = ids.reserve(|_| false).unwrap();
        // 2 and 3 are "populated" elsewhere; the probe must pass them.
        let next = ids.reserve(|id| id == 2 || id == 3).unwrap();
        assert_eq!(first, 1);
        assert_eq!(next, 4);
    }

    #[test]
    fn exhausts_after_one_full_probe() {
        let mut ids = IdAllocator::default();
        assert!(ids.reserve(|_| true).is_none());

        for id in 0..=u16::MAX {
            ids.reserved.insert(id);
        }
        assert!(ids.reserve(|_| false).is_none());
    }

    #[test]
    fn freed_id_is_found_within_one_probe() {
        let mut ids = IdAllocator::default();
        // Everything is populated except the one id that was just freed.
        let freed = 7u16;
        let got = ids.reserve(|id| id != freed).unwrap();
        assert_eq!(got, freed);
    }

    #[test]
    fn release_reports_whether_reserved() {
        let mut ids = IdAllocator::default();
        let id = ids.reserve(|_| false).unwrap();
        assert!(ids.release(id));
        assert!(!ids.release(id));
    }

    #[test]
    fn probe_wraps_around_the_id_space() {
        let mut ids = IdAllocator::default();
        ids.last_allocated = u16::MAX - 1;
        assert_eq!(ids.reserve(|_| false).unwrap(), u16::MAX);
        assert_eq!(ids.reserve(|_| false).unwrap(), 0);
        assert_eq!(ids.reserve(|_| false).unwrap(), 1);
    }
}
