//! Leased payload buffers with release-on-drop.
//!
//! A `PooledBuffer` is a cheap handle on shared payload bytes. Cloning it
//! shares the same lease; the lease goes back to its `BufferPool` when the
//! last handle is dropped. Every path that can end a message's life (ack,
//! cancellation, exhaustion, backlog clear, admission drop) simply drops its
//! handle, so a payload is released exactly once no matter how many paths
//! held it.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;

#[derive(Debug, Default)]
struct PoolCounters {
    outstanding: AtomicUsize,
    released: AtomicUsize,
}

/// Accounts for payload buffers that are currently in flight.
#[derive(Debug, Clone, Default)]
pub struct BufferPool {
    counters: Arc<PoolCounters>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lease `bytes` from this pool.
    pub fn lease(&self, bytes: impl Into<Bytes>) -> PooledBuffer {
        self.counters.outstanding.fetch_add(1, Ordering::AcqRel);
        PooledBuffer {
            bytes: bytes.into(),
            lease: Some(Arc::new(Lease {
                counters: Arc::clone(&self.counters),
            })),
        }
    }

    /// Number of leases not yet released.
    pub fn outstanding(&self) -> usize {
        self.counters.outstanding.load(Ordering::Acquire)
    }

    /// Number of leases released so far.
    pub fn released(&self) -> usize {
        self.counters.released.load(Ordering::Acquire)
    }
}

struct Lease {
    counters: Arc<PoolCounters>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.counters.outstanding.fetch_sub(1, Ordering::AcqRel);
        self.counters.released.fetch_add(1, Ordering::AcqRel);
    }
}

/// Payload bytes plus an optional pool lease.
#[derive(Clone, Default)]
pub struct PooledBuffer {
    bytes: Bytes,
    lease: Option<Arc<Lease>>,
}

impl PooledBuffer {
    /// An empty, unpooled buffer (used as the body of reset messages).
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Number of live handles sharing this buffer's lease.
    pub fn share_count(&self) -> usize {
        self.lease.as_ref().map_or(0, Arc::strong_count)
    }
}

impl From<Bytes> for PooledBuffer {
    fn from(bytes: Bytes) -> Self {
        Self { bytes, lease: None }
    }
}

impl From<&'static [u8]> for PooledBuffer {
    fn from(bytes: &'static [u8]) -> Self {
        Self::from(Bytes::from_static(bytes))
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl PartialEq for PooledBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for PooledBuffer {}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.bytes.len())
            .field("pooled", &self.lease.is_some())
            .finish()
    }
}
