//! Pooled message buffers.
//!
//! A `MessageBuffer` is a contiguous byte region with an `offset`/`count`
//! window into it. Buffers come out of a `BufferPool` and must be handed
//! back with [`BufferPool::release`] exactly once; release takes the buffer
//! by value, so releasing twice does not compile. A buffer that is dropped
//! without being released counts as a finalization, which is the leak
//! signal surfaced through the metrics sink.
//!
//! Handing a buffer to another task transfers exclusive ownership; the pool
//! itself is internally synchronized.

use std::sync::{Arc, Mutex};

use crate::telemetry;

/// A byte region of declared length with a live `offset..offset+count`
/// window. Invariant: `offset + count <= capacity`.
#[derive(Debug)]
pub struct MessageBuffer {
    storage: Option<Vec<u8>>,
    offset: usize,
    count: usize,
}

impl MessageBuffer {
    /// Wraps an owned byte vector; the window covers the whole vector.
    /// Useful for callers that build a payload without going through a
    /// pool. Releasing such a buffer simply donates its storage.
    pub fn from_vec(data: Vec<u8>) -> Self {
        let count = data.len();
        Self {
            storage: Some(data),
            offset: 0,
            count,
        }
    }

    /// Declared length of the underlying region.
    pub fn capacity(&self) -> usize {
        self.storage.as_ref().map(Vec::len).unwrap_or(0)
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Moves the live window. Panics if the window would leave the region.
    pub fn set_bounds(&mut self, offset: usize, count: usize) {
        assert!(
            offset + count <= self.capacity(),
            "buffer window {}..{} outside capacity {}",
            offset,
            offset + count,
            self.capacity()
        );
        self.offset = offset;
        self.count = count;
    }

    /// The live window, read-only.
    pub fn bytes(&self) -> &[u8] {
        match &self.storage {
            Some(storage) => &storage[self.offset..self.offset + self.count],
            None => &[],
        }
    }

    /// The live window, writable. Only the current exclusive holder can
    /// reach this.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        match &mut self.storage {
            Some(storage) => &mut storage[self.offset..self.offset + self.count],
            None => &mut [],
        }
    }
}

impl Drop for MessageBuffer {
    fn drop(&mut self) {
        if self.storage.is_some() {
            telemetry::record_finalization("message_buffer");
        }
    }
}

/// Bounded cache of buffer storages.
#[derive(Debug)]
pub struct BufferPool {
    cached: Mutex<Vec<Vec<u8>>>,
    max_cached: usize,
}

impl BufferPool {
    pub fn new(max_cached: usize) -> Arc<Self> {
        Arc::new(Self {
            cached: Mutex::new(Vec::new()),
            max_cached,
        })
    }

    /// Hands out a buffer of exactly `len` usable bytes, reusing cached
    /// storage when available. The window starts covering the whole region.
    pub fn acquire(&self, len: usize) -> MessageBuffer {
        let mut storage = self
            .cached
            .lock()
            .expect("buffer pool lock poisoned")
            .pop()
            .unwrap_or_default();
        storage.clear();
        storage.resize(len, 0);
        MessageBuffer {
            storage: Some(storage),
            offset: 0,
            count: len,
        }
    }

    /// Returns a buffer's storage to the cache. Dropping the cache overflow
    /// is not a leak; only buffers that never come back are.
    pub fn release(&self, mut buffer: MessageBuffer) {
        let Some(storage) = buffer.storage.take() else {
            return;
        };
        let mut cached = self.cached.lock().expect("buffer pool lock poisoned");
        if cached.len() < self.max_cached {
            cached.push(storage);
        }
    }

    /// Number of storages currently cached.
    pub fn cached(&self) -> usize {
        self.cached.lock().expect("buffer pool lock poisoned").len()
    }
}
