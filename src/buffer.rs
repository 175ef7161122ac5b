//! Shared buffer pool with fixed-size chunks.
//!
//! Chunks are allocated once at pool construction and reused for socket
//! receive operations; nothing on the hot path allocates. Checked-out chunks
//! are RAII handles: a chunk has exactly one owner at any instant (the pool's
//! free list, or the one operation holding it) and checks itself back in when
//! dropped, so double check-in and leaks are unrepresentable.
//!
//! The pool's fixed capacity is the transport's admission control: every
//! in-flight receive holds one chunk, so the chunk count bounds receive
//! memory system-wide.

use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::warn;

/// How many times `checkout` retries an empty free list before reporting
/// exhaustion. Yielding between attempts gives concurrent check-ins a window.
const CHECKOUT_ATTEMPTS: u32 = 16;

/// Buffer pool failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
    /// No chunk became available within the bounded retry. Transient;
    /// callers should treat this as backpressure.
    Exhausted { attempts: u32 },
    /// The pool was constructed with zero chunks or a zero chunk size.
    /// A configuration error, never retried.
    ZeroCapacity,
}

impl fmt::Display for BufferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferError::Exhausted { attempts } => {
                write!(f, "unable to check out a buffer after {attempts} attempts")
            }
            BufferError::ZeroCapacity => {
                write!(f, "buffer pool constructed with zero capacity")
            }
        }
    }
}

impl std::error::Error for BufferError {}

struct PoolShared {
    free: Mutex<Vec<Box<[u8]>>>,
    chunk_size: usize,
    capacity: usize,
}

/// Fixed-capacity pool of byte chunks, shared across all connections.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    /// Create a pool of `chunk_count` chunks of `chunk_size` bytes each.
    pub fn new(chunk_count: usize, chunk_size: usize) -> Result<Self, BufferError> {
        if chunk_count == 0 || chunk_size == 0 {
            return Err(BufferError::ZeroCapacity);
        }

        let mut free = Vec::with_capacity(chunk_count);
        for _ in 0..chunk_count {
            free.push(vec![0u8; chunk_size].into_boxed_slice());
        }

        Ok(Self {
            shared: Arc::new(PoolShared {
                free: Mutex::new(free),
                chunk_size,
                capacity: chunk_count,
            }),
        })
    }

    /// Check out one chunk. Retries a bounded number of times if the pool is
    /// momentarily empty, then reports exhaustion.
    pub fn checkout(&self) -> Result<PooledBuf, BufferError> {
        for attempt in 0..CHECKOUT_ATTEMPTS {
            let popped = self
                .shared
                .free
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop();
            if let Some(chunk) = popped {
                return Ok(PooledBuf {
                    chunk: Some(chunk),
                    pool: Arc::clone(&self.shared),
                });
            }
            if attempt + 1 < CHECKOUT_ATTEMPTS {
                thread::yield_now();
            }
        }
        warn!(
            capacity = self.shared.capacity,
            "buffer pool exhausted after bounded retry"
        );
        Err(BufferError::Exhausted {
            attempts: CHECKOUT_ATTEMPTS,
        })
    }

    /// Size of each chunk.
    pub fn chunk_size(&self) -> usize {
        self.shared.chunk_size
    }

    /// Total number of chunks.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Number of chunks currently in the free list.
    pub fn available(&self) -> usize {
        self.shared.free.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("capacity", &self.shared.capacity)
            .field("chunk_size", &self.shared.chunk_size)
            .field("available", &self.available())
            .finish()
    }
}

/// A checked-out chunk. Movable, not clonable; returns to the pool on drop.
pub struct PooledBuf {
    chunk: Option<Box<[u8]>>,
    pool: Arc<PoolShared>,
}

impl PooledBuf {
    pub fn as_slice(&self) -> &[u8] {
        self.chunk.as_deref().unwrap_or(&[])
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.chunk.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(chunk) = self.chunk.take() {
            self.pool
                .free
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(chunk);
        }
    }
}

impl fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuf")
            .field("chunk_size", &self.pool.chunk_size)
            .finish()
    }
}

/// A filled region of a pooled chunk, as delivered to a receive continuation.
/// The backing chunk returns to the pool when the segment is dropped.
pub struct Segment {
    buf: PooledBuf,
    len: usize,
}

impl Segment {
    pub(crate) fn new(buf: PooledBuf, len: usize) -> Self {
        debug_assert!(len <= buf.as_slice().len());
        Self { buf, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Deref for Segment {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf.as_slice()[..self.len]
    }
}

impl AsRef<[u8]> for Segment {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment").field("len", &self.len).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkout_and_return() {
        let pool = BufferPool::new(4, 1024).unwrap();
        assert_eq!(pool.capacity(), 4);
        assert_eq!(pool.available(), 4);
        assert_eq!(pool.chunk_size(), 1024);

        let mut buf = pool.checkout().unwrap();
        assert_eq!(pool.available(), 3);
        buf.as_mut_slice()[0] = 42;
        assert_eq!(buf.as_slice()[0], 42);

        drop(buf);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn test_exhaustion_is_bounded_and_transient() {
        let pool = BufferPool::new(2, 64).unwrap();
        let a = pool.checkout().unwrap();
        let b = pool.checkout().unwrap();

        // No aliasing: the two chunks are distinct memory.
        assert_ne!(a.as_slice().as_ptr(), b.as_slice().as_ptr());

        let err = pool.checkout().unwrap_err();
        assert!(matches!(err, BufferError::Exhausted { .. }));

        // Returning one chunk makes checkout succeed again.
        drop(a);
        let c = pool.checkout().unwrap();
        drop(c);
        drop(b);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert_eq!(BufferPool::new(0, 1024).unwrap_err(), BufferError::ZeroCapacity);
        assert_eq!(BufferPool::new(16, 0).unwrap_err(), BufferError::ZeroCapacity);
    }

    #[test]
    fn test_segment_views_filled_region() {
        let pool = BufferPool::new(1, 128).unwrap();
        let mut buf = pool.checkout().unwrap();
        buf.as_mut_slice()[..5].copy_from_slice(b"hello");

        let seg = Segment::new(buf, 5);
        assert_eq!(&*seg, b"hello");
        assert_eq!(seg.len(), 5);
        assert_eq!(pool.available(), 0);

        drop(seg);
        assert_eq!(pool.available(), 1);
    }
}
