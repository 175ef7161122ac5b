//! Pool of reusable operation contexts.
//!
//! An operation context is the per-operation scratch state for one in-flight
//! socket operation: the coalescing buffer and progress offset for a send, or
//! the checked-out pool chunk armed for a receive. Contexts are pooled so the
//! hot path does not allocate; unlike the buffer pool, this pool grows on
//! demand when every context is busy.
//!
//! A returned context is cleared before it becomes available again, so a
//! stale buffer or offset can never leak into the next operation.

use std::sync::{Arc, Mutex};

use bytes::BytesMut;

use crate::buffer::PooledBuf;

/// State carried by one in-flight operation.
#[derive(Default)]
pub struct OpContext {
    /// Coalescing scratch for sends; queued segments are copied here before
    /// the socket call.
    pub scratch: BytesMut,
    /// How much of `scratch` has reached the socket so far.
    pub offset: usize,
    /// Chunk armed for an in-flight receive, if any.
    pub buf: Option<PooledBuf>,
}

impl OpContext {
    fn reset(&mut self) {
        self.scratch.clear();
        self.offset = 0;
        self.buf = None;
    }
}

struct CtxShared {
    idle: Mutex<Vec<OpContext>>,
}

/// Grow-on-demand pool of operation contexts, shared across all connections.
#[derive(Clone)]
pub struct ContextPool {
    shared: Arc<CtxShared>,
}

impl ContextPool {
    /// Create a pool pre-warmed with `initial_count` idle contexts.
    pub fn new(initial_count: usize) -> Self {
        let mut idle = Vec::with_capacity(initial_count);
        for _ in 0..initial_count {
            idle.push(OpContext::default());
        }
        Self {
            shared: Arc::new(CtxShared {
                idle: Mutex::new(idle),
            }),
        }
    }

    /// Take an idle context, or construct a new one if none is idle.
    pub fn get(&self) -> CtxHandle {
        let ctx = self
            .shared
            .idle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop()
            .unwrap_or_default();
        CtxHandle {
            ctx: Some(ctx),
            pool: Arc::clone(&self.shared),
        }
    }

    /// Number of idle contexts.
    pub fn idle_count(&self) -> usize {
        self.shared.idle.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// A checked-out context. Cleared and returned to the pool on drop.
pub struct CtxHandle {
    ctx: Option<OpContext>,
    pool: Arc<CtxShared>,
}

impl std::ops::Deref for CtxHandle {
    type Target = OpContext;

    fn deref(&self) -> &OpContext {
        self.ctx.as_ref().expect("context present until drop")
    }
}

impl std::ops::DerefMut for CtxHandle {
    fn deref_mut(&mut self) -> &mut OpContext {
        self.ctx.as_mut().expect("context present until drop")
    }
}

impl Drop for CtxHandle {
    fn drop(&mut self) {
        if let Some(mut ctx) = self.ctx.take() {
            ctx.reset();
            self.pool
                .idle
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;

    #[test]
    fn test_get_and_return() {
        let pool = ContextPool::new(2);
        assert_eq!(pool.idle_count(), 2);

        let ctx = pool.get();
        assert_eq!(pool.idle_count(), 1);
        drop(ctx);
        assert_eq!(pool.idle_count(), 2);
    }

    #[test]
    fn test_grows_on_demand() {
        let pool = ContextPool::new(1);
        let a = pool.get();
        let b = pool.get();
        assert_eq!(pool.idle_count(), 0);
        drop(a);
        drop(b);
        assert_eq!(pool.idle_count(), 2);
    }

    #[test]
    fn test_state_cleared_on_return() {
        let buffers = BufferPool::new(1, 64).unwrap();
        let pool = ContextPool::new(1);

        {
            let mut ctx = pool.get();
            ctx.scratch.extend_from_slice(b"stale bytes");
            ctx.offset = 7;
            ctx.buf = Some(buffers.checkout().unwrap());
            assert_eq!(buffers.available(), 0);
        }

        // Returning the context released its buffer and cleared its state.
        assert_eq!(buffers.available(), 1);
        let ctx = pool.get();
        assert!(ctx.scratch.is_empty());
        assert_eq!(ctx.offset, 0);
        assert!(ctx.buf.is_none());
    }
}
