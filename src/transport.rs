//! Transport runtime: pools plus the reactor thread.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::{Poll, Waker};
use tracing::debug;

use crate::buffer::BufferPool;
use crate::config::TransportConfig;
use crate::context::ContextPool;
use crate::error::TransportError;
use crate::reactor::{Command, Reactor, ReactorHandle, WAKER_TOKEN};

/// Shared runtime for connections, listeners, and connectors. Cloneable;
/// the reactor thread stops when [`Transport::shutdown`] is called or the
/// last clone drops.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    handle: ReactorHandle,
    buffers: BufferPool,
    contexts: ContextPool,
    config: TransportConfig,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    /// Build the pools and spawn the reactor thread.
    pub fn start(config: TransportConfig) -> Result<Self, TransportError> {
        let buffers = BufferPool::new(config.buffers.chunk_count, config.buffers.chunk_size)?;
        let contexts = ContextPool::new(config.contexts.initial_count);

        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (tx, rx) = mpsc::channel();

        let reactor = Reactor::new(poll, rx, buffers.clone(), contexts.clone());
        let thread = thread::Builder::new()
            .name("wireline-reactor".into())
            .spawn(move || reactor.run())?;

        debug!(
            buffer_chunks = config.buffers.chunk_count,
            chunk_size = config.buffers.chunk_size,
            contexts = config.contexts.initial_count,
            "transport started",
        );

        Ok(Self {
            inner: Arc::new(TransportInner {
                handle: ReactorHandle::new(tx, waker),
                buffers,
                contexts,
                config,
                thread: Mutex::new(Some(thread)),
            }),
        })
    }

    /// Stop the reactor thread and wait for it to exit. Idempotent.
    pub fn shutdown(&self) {
        self.inner.handle.send(Command::Shutdown);
        let thread = self
            .inner
            .thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(thread) = thread {
            let _ = thread.join();
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        &self.inner.buffers
    }

    pub fn context_pool(&self) -> &ContextPool {
        &self.inner.contexts
    }

    pub(crate) fn reactor_handle(&self) -> ReactorHandle {
        self.inner.handle.clone()
    }

    pub(crate) fn accept_close_grace(&self) -> Duration {
        Duration::from_millis(self.inner.config.listener.close_grace_ms)
    }
}

impl Drop for TransportInner {
    fn drop(&mut self) {
        self.handle.send(Command::Shutdown);
        let thread = self.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(thread) = thread {
            let _ = thread.join();
        }
    }
}
