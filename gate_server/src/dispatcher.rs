//! Cooperative serial queue for extension callbacks.
//!
//! One consumer task drains a bounded queue; execution is strictly FIFO, so
//! everything submitted here is serialized onto a single logical
//! "application thread". Submission is safe from any task and backs off
//! when the queue is full.
//!
//! A task may carry a continuation, invoked on the dispatcher right after
//! the primary completes with the primary's success as an argument. The
//! client manager uses this to sequence the start of a receive loop after
//! the connect callback, and disconnect finalization after the disconnect
//! callback.

use tokio::sync::mpsc;
use tracing::{debug, error};

tokio::task_local! {
    static ON_DISPATCHER: ();
}

/// A unit of work for the dispatcher.
pub struct DispatchTask {
    primary: Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>,
    continuation: Option<Box<dyn FnOnce(bool) + Send + 'static>>,
}

impl DispatchTask {
    pub fn new(primary: impl FnOnce() -> anyhow::Result<()> + Send + 'static) -> Self {
        Self {
            primary: Box::new(primary),
            continuation: None,
        }
    }

    /// Attaches a continuation. It always runs; the flag tells it whether
    /// the primary succeeded, for callers whose follow-up is conditional.
    pub fn and_then(mut self, continuation: impl FnOnce(bool) + Send + 'static) -> Self {
        self.continuation = Some(Box::new(continuation));
        self
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    queue: mpsc::Sender<DispatchTask>,
}

impl Dispatcher {
    /// Spawns the consumer task. `capacity` bounds the queue; submitters
    /// wait for room instead of growing it.
    pub fn start(capacity: usize) -> Self {
        let (queue, mut tasks) = mpsc::channel::<DispatchTask>(capacity.max(1));
        tokio::spawn(ON_DISPATCHER.scope((), async move {
            while let Some(task) = tasks.recv().await {
                Self::run_inline(task);
            }
            debug!("Dispatcher drained and stopped");
        }));
        Self { queue }
    }

    /// True when the calling code is already executing on the dispatcher.
    pub fn is_on_dispatcher() -> bool {
        ON_DISPATCHER.try_with(|_| ()).is_ok()
    }

    /// Unconditionally enqueues.
    pub async fn dispatch(&self, task: DispatchTask) {
        if let Err(mpsc::error::SendError(task)) = self.queue.send(task).await {
            // Consumer is gone (shutdown); run here rather than lose the
            // continuation.
            Self::run_inline(task);
        }
    }

    /// Runs the task immediately when already on the dispatcher, otherwise
    /// enqueues it.
    pub async fn dispatch_if_needed(&self, task: DispatchTask) {
        if Self::is_on_dispatcher() {
            Self::run_inline(task);
        } else {
            self.dispatch(task).await;
        }
    }

    /// Executes a task on the calling task. Also used for extensions that
    /// declare themselves thread safe and skip the queue entirely.
    pub(crate) fn run_inline(task: DispatchTask) {
        let ok = match (task.primary)() {
            Ok(()) => true,
            Err(error) => {
                error!(%error, "Dispatched task failed");
                false
            }
        };
        if let Some(continuation) = task.continuation {
            continuation(ok);
        }
    }
}
