//! Shared harness for the socket-level integration tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gate_server::clients::Client;
use gate_server::extension::{ChannelMode, DisconnectInfo, Extension};
use gate_shared::buffer::MessageBuffer;

/// One extension callback, as observed by a test.
#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    Connected(u16),
    Disconnected { id: u16, local: bool },
    Message { id: u16, mode: ChannelMode, body: Vec<u8> },
}

/// An extension that records every callback. Optionally echoes payloads
/// back on the channel they arrived on.
pub struct Recorder {
    events: Mutex<Vec<Recorded>>,
    thread_safe: bool,
    echo: bool,
    fail_next_connect: AtomicBool,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Self::with_options(false, false)
    }

    pub fn with_options(thread_safe: bool, echo: bool) -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            thread_safe,
            echo,
            fail_next_connect: AtomicBool::new(false),
        })
    }

    /// Makes the next connect callback fail, exercising the drop path.
    pub fn fail_next_connect(&self) {
        self.fail_next_connect.store(true, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().unwrap().clone()
    }

    /// Polls until `pred` holds for the recorded events or the timeout
    /// passes.
    pub async fn wait_until(
        &self,
        timeout: Duration,
        pred: impl Fn(&[Recorded]) -> bool,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if pred(&self.events()) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn record(&self, event: Recorded) {
        self.events.lock().unwrap().push(event);
    }
}

impl Extension for Recorder {
    fn thread_safe(&self) -> bool {
        self.thread_safe
    }

    fn client_connected(&self, client: &Arc<Client>) -> anyhow::Result<()> {
        if self.fail_next_connect.swap(false, Ordering::SeqCst) {
            anyhow::bail!("connect handler rigged to fail");
        }
        self.record(Recorded::Connected(client.id()));
        Ok(())
    }

    fn client_disconnected(
        &self,
        client: &Arc<Client>,
        info: &DisconnectInfo,
    ) -> anyhow::Result<()> {
        self.record(Recorded::Disconnected {
            id: client.id(),
            local: info.local_disconnect,
        });
        Ok(())
    }

    fn message_received(
        &self,
        client: &Arc<Client>,
        message: &MessageBuffer,
        mode: ChannelMode,
    ) -> anyhow::Result<()> {
        self.record(Recorded::Message {
            id: client.id(),
            mode,
            body: message.bytes().to_vec(),
        });
        if self.echo {
            let echo = MessageBuffer::from_vec(message.bytes().to_vec());
            match mode {
                ChannelMode::Reliable => client.send_reliable(echo),
                ChannelMode::Unreliable => client.send_unreliable(echo),
            };
        }
        Ok(())
    }
}

/// Installs the test log subscriber once per binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}
