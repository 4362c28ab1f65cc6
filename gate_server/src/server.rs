//! Server facade.
//!
//! Wires the buffer pool, dispatcher, client manager and bichannel listener
//! together. Binding is the only operation that surfaces an error to the
//! caller; once the server is up, failures flow through disconnect events
//! and the metrics sink.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

use gate_shared::buffer::{BufferPool, MessageBuffer};
use gate_shared::config::ServerConfig;

use crate::clients::{Client, ClientManager};
use crate::dispatcher::Dispatcher;
use crate::extension::Extension;
use crate::listener::BichannelListener;

pub struct GateServer {
    cfg: ServerConfig,
    pool: Arc<BufferPool>,
    manager: Arc<ClientManager>,
    listener: Arc<BichannelListener>,
}

impl GateServer {
    /// Binds both channels. Fails here or not at all.
    pub async fn bind(
        cfg: ServerConfig,
        extension: Option<Arc<dyn Extension>>,
    ) -> anyhow::Result<Self> {
        let pool = BufferPool::new(cfg.max_cached_messages);
        let dispatcher = Dispatcher::start(cfg.max_dispatcher_tasks);
        let manager = ClientManager::new(extension, dispatcher, Arc::clone(&pool));
        let listener = BichannelListener::bind(&cfg, Arc::clone(&manager), Arc::clone(&pool)).await?;
        Ok(Self {
            cfg,
            pool,
            manager,
            listener,
        })
    }

    /// Starts accepting sessions.
    pub fn start(&self) {
        self.listener.start();
        info!(addr = %self.listener.local_addr(), "Gate server listening");
    }

    /// Refuses new sessions, disconnects every live one, stops the
    /// datagram loop.
    pub async fn stop(&self) {
        info!("Gate server stopping");
        self.listener.stop().await;
    }

    pub fn config(&self) -> &ServerConfig {
        &self.cfg
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn connected_count(&self) -> usize {
        self.manager.connected_count()
    }

    pub fn client(&self, id: u16) -> Option<Arc<Client>> {
        self.manager.client(id)
    }

    pub fn clients(&self) -> Vec<Arc<Client>> {
        self.manager.clients()
    }

    /// Hands out a pooled buffer for an outbound payload.
    pub fn acquire_buffer(&self, len: usize) -> MessageBuffer {
        self.pool.acquire(len)
    }

    /// Returns a buffer that ended up not being sent.
    pub fn release_buffer(&self, buffer: MessageBuffer) {
        self.pool.release(buffer)
    }
}

impl Drop for GateServer {
    fn drop(&mut self) {
        // Best effort only; the ordered shutdown is the async stop. This
        // keeps the accept/demux tasks from outliving a server that was
        // dropped without one.
        self.listener.shutdown_tasks();
    }
}

/// Helper for tests: bind both channels to an ephemeral port and start
/// listening.
pub async fn bind_ephemeral(
    extension: Option<Arc<dyn Extension>>,
) -> anyhow::Result<(GateServer, SocketAddr)> {
    bind_ephemeral_with(ServerConfig::default(), extension).await
}

/// Like [`bind_ephemeral`] but with a caller-supplied config whose port is
/// overridden to 0.
pub async fn bind_ephemeral_with(
    cfg: ServerConfig,
    extension: Option<Arc<dyn Extension>>,
) -> anyhow::Result<(GateServer, SocketAddr)> {
    let cfg = ServerConfig { port: 0, ..cfg };
    let server = GateServer::bind(cfg, extension).await?;
    server.start();
    let addr = server.local_addr();
    Ok((server, addr))
}
