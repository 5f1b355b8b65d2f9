//! Pool of fixed-size copy buffers shared by every relay session.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;

/// Size of every buffer handed out for the byte splice.
pub const RELAY_BUFFER_SIZE: usize = 4096;

/// Configuration for buffer pool
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Length of each buffer
    pub buffer_size: usize,
    /// Maximum number of idle buffers kept for reuse
    pub max_pooled: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            buffer_size: RELAY_BUFFER_SIZE,
            max_pooled: 64,
        }
    }
}

/// A thread-safe pool of reusable `BytesMut` buffers
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<Mutex<BufferPoolInner>>,
}

struct BufferPoolInner {
    buffers: VecDeque<BytesMut>,
    config: BufferPoolConfig,
}

impl BufferPool {
    pub fn new(config: BufferPoolConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BufferPoolInner {
                buffers: VecDeque::with_capacity(config.max_pooled),
                config,
            })),
        }
    }

    /// Check out a zeroed buffer of the configured size.
    ///
    /// The buffer goes back to the pool when the guard is dropped.
    pub fn acquire(&self) -> PooledBuffer {
        let mut inner = self.inner.lock();
        let size = inner.config.buffer_size;
        let mut buf = inner
            .buffers
            .pop_front()
            .unwrap_or_else(|| BytesMut::with_capacity(size));
        drop(inner);

        buf.resize(size, 0);
        PooledBuffer {
            buf: Some(buf),
            pool: self.clone(),
        }
    }

    /// Return a buffer, keeping it only if the pool has room.
    fn release(&self, mut buf: BytesMut) {
        let mut inner = self.inner.lock();
        if inner.buffers.len() >= inner.config.max_pooled
            || buf.capacity() > inner.config.buffer_size * 2
        {
            return;
        }
        buf.clear();
        inner.buffers.push_back(buf);
    }

    /// Number of idle buffers available for reuse.
    pub fn count(&self) -> usize {
        self.inner.lock().buffers.len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(BufferPoolConfig::default())
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("idle", &self.count())
            .finish()
    }
}

/// A buffer checked out of a [`BufferPool`].
pub struct PooledBuffer {
    buf: Option<BytesMut>,
    pool: BufferPool,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or_default()
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or_default()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}
