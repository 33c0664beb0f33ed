//! Power-of-two byte buffer pool.
//!
//! Requests are rounded up to the next power of two (never below the pool's
//! minimum) and served from a per-size bucket. A [`PooledBuffer`] returns
//! itself to its bucket on drop, so a buffer is single-owner for exactly one
//! read or write and never outlives it.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;

/// Smallest bucket handed out.
pub const DEFAULT_MIN_BUFFER: usize = 1024;

/// Buffers kept per bucket before extras are dropped.
pub const DEFAULT_MAX_PER_BUCKET: usize = 64;

/// Snapshot of buffer reuse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferPoolStats {
    /// Acquisitions served from a bucket.
    pub hits: u64,
    /// Acquisitions that allocated.
    pub misses: u64,
    /// Buffers currently retained across all buckets.
    pub retained: usize,
    /// Bytes currently retained across all buckets.
    pub retained_bytes: usize,
}

#[derive(Debug)]
struct Inner {
    min_size: usize,
    max_per_bucket: usize,
    buckets: Mutex<HashMap<usize, Vec<BytesMut>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Inner {
    fn release(&self, bucket: usize, mut buf: BytesMut) {
        if buf.capacity() < bucket {
            return;
        }
        buf.clear();
        let mut buckets = self.buckets.lock();
        let slot = buckets.entry(bucket).or_default();
        if slot.len() < self.max_per_bucket {
            slot.push(buf);
        }
    }
}

/// Shared, thread-safe byte buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPool {
    inner: Arc<Inner>,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_BUFFER, DEFAULT_MAX_PER_BUCKET)
    }
}

impl BufferPool {
    /// Pool whose smallest bucket is `min_size` (rounded to a power of two).
    #[must_use]
    pub fn new(min_size: usize, max_per_bucket: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                min_size: min_size.max(1).next_power_of_two(),
                max_per_bucket,
                buckets: Mutex::new(HashMap::new()),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
            }),
        }
    }

    /// Bucket size serving a request of `size` bytes.
    #[must_use]
    pub fn bucket_for(&self, size: usize) -> usize {
        size.max(self.inner.min_size).next_power_of_two()
    }

    /// Acquire an empty buffer with capacity of at least `size` bytes.
    #[must_use]
    pub fn acquire(&self, size: usize) -> PooledBuffer {
        let bucket = self.bucket_for(size);
        let reused = self
            .inner
            .buckets
            .lock()
            .get_mut(&bucket)
            .and_then(Vec::pop);
        let buf = if let Some(buf) = reused {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
            buf
        } else {
            self.inner.misses.fetch_add(1, Ordering::Relaxed);
            BytesMut::with_capacity(bucket)
        };
        PooledBuffer {
            buf,
            bucket,
            pool: Arc::clone(&self.inner),
        }
    }

    /// Current reuse statistics.
    #[must_use]
    pub fn stats(&self) -> BufferPoolStats {
        let buckets = self.inner.buckets.lock();
        BufferPoolStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            retained: buckets.values().map(Vec::len).sum(),
            retained_bytes: buckets.iter().map(|(size, bufs)| size * bufs.len()).sum(),
        }
    }
}

/// Buffer on loan from a [`BufferPool`]; returned on drop.
#[derive(Debug)]
pub struct PooledBuffer {
    buf: BytesMut,
    bucket: usize,
    pool: Arc<Inner>,
}

impl PooledBuffer {
    /// Bucket size this buffer belongs to.
    #[must_use]
    pub const fn bucket(&self) -> usize {
        self.bucket
    }

    /// Detach the buffer from the pool; it will not be returned.
    #[must_use]
    pub fn into_inner(mut self) -> BytesMut {
        std::mem::take(&mut self.buf)
    }
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.release(self.bucket, buf);
    }
}
