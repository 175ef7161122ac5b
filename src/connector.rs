//! Outbound connector: non-blocking connects with a deadline, reaped by a
//! background timer thread.
//!
//! Every attempt is tracked in a pending table keyed by connection id. The
//! reactor resolves the connect when the socket reports writable; the reaper
//! walks the table on a fixed interval and fails attempts past their
//! deadline. Whichever side settles an attempt first wins, so the outcome
//! callbacks fire exactly once per attempt.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tracing::debug;
use uuid::Uuid;

use crate::config::ConnectorConfig;
use crate::connection::Connection;
use crate::error::{CloseCode, TransportError};
use crate::reactor::Command;
use crate::transport::Transport;

type OnEstablished = Box<dyn FnOnce(Arc<Connection>) + Send>;
type OnFailed = Box<dyn FnOnce(Arc<Connection>, TransportError) + Send>;

struct PendingConnection {
    conn: Arc<Connection>,
    deadline: Instant,
    settled: AtomicBool,
    on_established: OnEstablished,
    on_failed: OnFailed,
}

struct ConnectorInner {
    transport: Transport,
    config: ConnectorConfig,
    pending: Mutex<HashMap<Uuid, PendingConnection>>,
    shutdown: AtomicBool,
}

impl ConnectorInner {
    /// Claim a pending attempt. At most one caller per id ever gets it back.
    fn settle(&self, id: Uuid) -> Option<PendingConnection> {
        let removed = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)?;
        if removed.settled.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(removed)
    }

    fn close_grace(&self) -> Duration {
        Duration::from_millis(self.config.close_grace_ms)
    }

    /// Connect finished at the socket level; deliver the outcome to whoever
    /// still cares. A late arrival after the reaper already failed the
    /// attempt just discards the socket.
    fn resolve(self: &Arc<Self>, id: Uuid, outcome: io::Result<TcpStream>) {
        let Some(pending) = self.settle(id) else {
            if let Ok(stream) = outcome {
                let _ = SockRef::from(&stream).set_linger(Some(self.close_grace()));
            }
            return;
        };
        match outcome {
            Ok(stream) => match pending.conn.init_socket(stream) {
                Ok(()) => (pending.on_established)(pending.conn),
                Err(e) => {
                    pending
                        .conn
                        .close_internal(CloseCode::SocketDisposed, "Socket initialization failed");
                    (pending.on_failed)(pending.conn, e);
                }
            },
            Err(e) => {
                debug!(id = %id, error = %e, "Connect failed");
                (pending.on_failed)(pending.conn, TransportError::Connect(e));
            }
        }
    }

    fn reap(self: &Arc<Self>) {
        let interval = Duration::from_millis(self.config.reap_interval_ms);
        while !self.shutdown.load(Ordering::Acquire) {
            thread::park_timeout(interval);
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            let now = Instant::now();
            let expired: Vec<Uuid> = self
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .filter(|(_, p)| now >= p.deadline)
                .map(|(id, _)| *id)
                .collect();
            for id in expired {
                if let Some(pending) = self.settle(id) {
                    debug!(id = %id, remote = %pending.conn.remote_addr(), "Connect timed out");
                    // The in-flight socket is still registered with the
                    // reactor; tell it to drop the attempt so the fd does
                    // not linger in SYN_SENT for the kernel's retry window.
                    self.transport.reactor_handle().send(Command::DropConnect {
                        id,
                        grace: self.close_grace(),
                    });
                    pending
                        .conn
                        .close_internal(CloseCode::Timeout, "Connection establishment timeout");
                    (pending.on_failed)(pending.conn, TransportError::ConnectTimeout);
                }
            }
        }
    }
}

/// Initiates outbound connections on a shared [`Transport`].
pub struct Connector {
    inner: Arc<ConnectorInner>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl Connector {
    pub fn new(transport: &Transport, config: ConnectorConfig) -> Self {
        let inner = Arc::new(ConnectorInner {
            transport: transport.clone(),
            pending: Mutex::new(HashMap::with_capacity(config.pool_size)),
            config,
            shutdown: AtomicBool::new(false),
        });
        let reap_inner = Arc::clone(&inner);
        let reaper = match thread::Builder::new()
            .name("wireline-reaper".into())
            .spawn(move || reap_inner.reap())
        {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::error!(error = %e, "Failed to spawn reaper; connect timeouts disabled");
                None
            }
        };
        Self {
            inner,
            reaper: Mutex::new(reaper),
        }
    }

    /// Number of attempts neither resolved nor timed out yet.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Start a connection attempt to `remote`, tracked under `id`. Exactly
    /// one of the callbacks fires: `on_established` with the initialized
    /// connection, or `on_failed` with the connect error or
    /// [`TransportError::ConnectTimeout`] once `timeout` passes. The
    /// returned connection is usable only after `on_established`.
    pub fn connect(
        &self,
        id: Uuid,
        remote: SocketAddr,
        timeout: Duration,
        on_established: impl FnOnce(Arc<Connection>) + Send + 'static,
        on_failed: impl FnOnce(Arc<Connection>, TransportError) + Send + 'static,
    ) -> Arc<Connection> {
        let conn = Connection::connecting(
            &self.inner.transport,
            id,
            remote,
            self.inner.close_grace(),
        );
        self.inner.pending.lock().unwrap_or_else(|e| e.into_inner()).insert(
            id,
            PendingConnection {
                conn: Arc::clone(&conn),
                deadline: Instant::now() + timeout,
                settled: AtomicBool::new(false),
                on_established: Box::new(on_established),
                on_failed: Box::new(on_failed),
            },
        );

        debug!(id = %id, remote = %remote, timeout_ms = timeout.as_millis() as u64, "Connecting");

        match start_connect(remote) {
            Ok(stream) => {
                let inner = Arc::clone(&self.inner);
                self.inner
                    .transport
                    .reactor_handle()
                    .send(Command::RegisterConnect {
                        id,
                        stream,
                        done: Box::new(move |outcome| inner.resolve(id, outcome)),
                    });
            }
            Err(e) => self.inner.resolve(id, Err(e)),
        }
        conn
    }

    /// Stop the reaper thread. Attempts still pending never settle.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        let reaper = self
            .reaper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(reaper) = reaper {
            reaper.thread().unpark();
            let _ = reaper.join();
        }
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Kick off a non-blocking connect. In-progress is success here; the
/// reactor observes the final outcome.
fn start_connect(remote: SocketAddr) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(remote), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    match socket.connect(&remote.into()) {
        Ok(()) => {}
        Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }
    Ok(socket.into())
}
