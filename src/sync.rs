//! Exclusive lock for short critical sections in completion paths.
//!
//! The transport's send path serializes its drain state under this lock. It
//! is a thin wrapper over the standard mutex: the spin-then-park scheme the
//! design descends from is a performance detail, and a plain mutex keeps the
//! same contract (scoped guard, released on every exit path) with far less
//! surface for invariant bugs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use tracing::error;

/// Guard-returning exclusive lock with a held-state probe for diagnostics.
pub struct OpLock {
    inner: Mutex<()>,
    held: AtomicBool,
}

/// Scoped guard; dropping it releases the lock.
pub struct OpGuard<'a> {
    lock: &'a OpLock,
    _inner: MutexGuard<'a, ()>,
}

impl OpLock {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(()),
            held: AtomicBool::new(false),
        }
    }

    /// Block until exclusive access is obtained.
    ///
    /// # Panics
    /// Panics if the lock is poisoned: a panic inside a critical section is
    /// a programming error, not an operating condition to recover from.
    pub fn acquire(&self) -> OpGuard<'_> {
        match self.inner.lock() {
            Ok(guard) => {
                self.held.store(true, Ordering::Release);
                OpGuard {
                    lock: self,
                    _inner: guard,
                }
            }
            Err(_) => {
                error!("lock poisoned by a panic in a critical section");
                panic!("lock poisoned by a panic in a critical section");
            }
        }
    }

    /// Whether the lock is currently held. Diagnostics only; the answer may
    /// be stale by the time the caller looks at it.
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

impl Default for OpLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        // Cleared while the mutex is still held so is_held never reads true
        // with no owner.
        self.lock.held.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_acquire_release() {
        let lock = OpLock::new();
        assert!(!lock.is_held());
        {
            let _g = lock.acquire();
            assert!(lock.is_held());
        }
        assert!(!lock.is_held());
    }

    #[test]
    fn test_mutual_exclusion() {
        let lock = Arc::new(OpLock::new());
        let counter = Arc::new(Mutex::new(0u32));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    let _g = lock.acquire();
                    let mut c = counter.lock().unwrap();
                    *c += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*counter.lock().unwrap(), 400);
        assert!(!lock.is_held());
    }
}
