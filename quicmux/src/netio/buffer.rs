//! Per-shard receive buffer pool.
//!
//! Each shard owns its own `BufferPool` with no sharing between shards. The
//! storage is a single-shard `buffer_pool::Pool` that is leaked for the
//! lifetime of the process, the same way the shard thread itself is never
//! torn down before exit.
//!
//! # Architecture
//!
//! - `get()` reuses an idle buffer or allocates a fresh one. It never blocks
//!   and never fails; a miss is not an error.
//! - Every buffer handed out is exactly `buffer_size` bytes long.
//! - [`PooledBuffer`] returns itself on drop. When the pool already holds
//!   `capacity` idle buffers the returned one is discarded instead.
//!
//! Buffers carry no identity: any buffer may come back from any `get()`.

use crate::netio::config::BufferPoolConfig;
use buffer_pool::{ConsumeBuffer, Pool, Pooled};
use std::cell::Cell;
use std::ops::{Deref, DerefMut};

/// Backing store. One shard, since only the owning shard thread touches it.
pub type ShardBufPool = Pool<1, ConsumeBuffer>;

/// Raw buffer on loan from a [`ShardBufPool`].
pub type PooledBuf = Pooled<ConsumeBuffer>;

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub discards: u64,
}

/// Bounded pool of fixed-size byte buffers.
pub struct BufferPool {
    pool: &'static ShardBufPool,
    buffer_size: usize,
    capacity: usize,
    hits: Cell<u64>,
    misses: Cell<u64>,
    discards: Cell<u64>,
}

impl BufferPool {
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        let capacity = capacity.max(1);
        let pool: &'static ShardBufPool =
            Box::leak(Box::new(ShardBufPool::new(capacity, buffer_size)));
        Self {
            pool,
            buffer_size,
            capacity,
            hits: Cell::new(0),
            misses: Cell::new(0),
            discards: Cell::new(0),
        }
    }

    pub fn from_config(config: &BufferPoolConfig) -> Self {
        Self::new(config.max_buffers_per_shard, config.buffer_size)
    }

    /// Take a buffer, allocating on a miss.
    pub fn get(&self) -> PooledBuffer<'_> {
        let counter = if self.pool.len() > 0 {
            &self.hits
        } else {
            &self.misses
        };
        counter.set(counter.get() + 1);

        // SAFETY: `self.pool` is leaked in `new` and is never freed.
        #[allow(unused_unsafe)]
        let mut inner = unsafe { self.pool.get_empty() };
        let len = inner.len();
        if len < self.buffer_size {
            inner.expand(self.buffer_size - len);
        } else if len > self.buffer_size {
            inner.truncate(self.buffer_size);
        }

        PooledBuffer {
            inner: Some(inner),
            owner: self,
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.pool.len(),
            capacity: self.capacity,
            hits: self.hits.get(),
            misses: self.misses.get(),
            discards: self.discards.get(),
        }
    }

    fn note_return(&self) {
        if self.pool.len() >= self.capacity {
            self.discards.set(self.discards.get() + 1);
        }
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.buffer_size)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Buffer on loan from a [`BufferPool`].
pub struct PooledBuffer<'a> {
    inner: Option<PooledBuf>,
    owner: &'a BufferPool,
}

impl Deref for PooledBuffer<'_> {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &Self::Target {
        match &self.inner {
            Some(buf) => &buf[..],
            None => &[],
        }
    }
}

impl DerefMut for PooledBuffer<'_> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.inner {
            Some(buf) => &mut buf[..],
            None => &mut [],
        }
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.inner.take() {
            self.owner.note_return();
            drop(buf);
        }
    }
}
