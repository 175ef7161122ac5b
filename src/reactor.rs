//! Readiness reactor: one background thread, one mio poll loop.
//!
//! The reactor owns the registered side of every socket: per-connection read
//! halves, listening sockets, and in-progress outbound connects, all keyed by
//! slab tokens. Application threads talk to it through a command channel plus
//! a waker; completions that fire here run the same handling code as the
//! synchronous paths on the initiating threads.
//!
//! Registrations are edge-triggered, so every readable event drains its
//! socket to `WouldBlock`. The one deliberate exception is buffer-pool
//! exhaustion: a connection that cannot check out a receive buffer parks on
//! the stalled list and is retried on the next tick, which is how pool
//! capacity turns into receive backpressure.

use std::io::{self, Read};
use std::net::SocketAddr;
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use tracing::{debug, error, warn};

use crate::buffer::{BufferPool, Segment};
use crate::connection::Connection;
use crate::context::{ContextPool, CtxHandle};
use crate::error::CloseCode;

pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX);

/// Tick period: stalled-read retries and command-channel housekeeping.
const TICK: Duration = Duration::from_millis(200);

const EVENTS_CAPACITY: usize = 256;

pub(crate) type AcceptHandler = Arc<dyn Fn(TcpStream, SocketAddr) + Send + Sync>;
pub(crate) type ConnectDone = Box<dyn FnOnce(io::Result<TcpStream>) + Send>;

/// Cross-thread requests into the reactor.
pub(crate) enum Command {
    /// Watch an initialized connection. `stream` is the reactor's own clone
    /// of the connection's socket.
    RegisterConn {
        conn: Arc<Connection>,
        stream: TcpStream,
    },
    /// Stop watching a connection. The id guards against token reuse.
    DropConn { token: usize, id: uuid::Uuid },
    /// Watch a listening socket and accept on its behalf.
    RegisterListener {
        listener: TcpListener,
        handler: AcceptHandler,
        batch: usize,
    },
    /// Watch an in-progress non-blocking connect until it resolves. The id
    /// is the attempt id, so a timed-out attempt can be torn down.
    RegisterConnect {
        id: uuid::Uuid,
        stream: TcpStream,
        done: ConnectDone,
    },
    /// Abandon an in-progress connect: deregister and close its socket with
    /// the given linger grace. No-op if the connect already resolved.
    DropConnect { id: uuid::Uuid, grace: Duration },
    Shutdown,
}

/// Cloneable handle for submitting commands and waking the poll loop.
pub(crate) struct ReactorHandle {
    tx: Mutex<Sender<Command>>,
    waker: Arc<Waker>,
}

impl ReactorHandle {
    pub(crate) fn new(tx: Sender<Command>, waker: Arc<Waker>) -> Self {
        Self {
            tx: Mutex::new(tx),
            waker,
        }
    }

    pub(crate) fn send(&self, cmd: Command) {
        let sent = self
            .tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .send(cmd)
            .is_ok();
        if sent {
            let _ = self.waker.wake();
        }
    }
}

impl Clone for ReactorHandle {
    fn clone(&self) -> Self {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner()).clone();
        Self {
            tx: Mutex::new(tx),
            waker: Arc::clone(&self.waker),
        }
    }
}

enum Entry {
    Conn {
        conn: Arc<Connection>,
        stream: TcpStream,
        recv_ctx: CtxHandle,
    },
    Listener {
        listener: TcpListener,
        handler: AcceptHandler,
        batch: usize,
    },
    Connect {
        id: uuid::Uuid,
        stream: Option<TcpStream>,
        done: Option<ConnectDone>,
    },
}

impl Entry {
    fn raw_fd(&self) -> Option<RawFd> {
        match self {
            Entry::Conn { stream, .. } => Some(stream.as_raw_fd()),
            Entry::Listener { listener, .. } => Some(listener.as_raw_fd()),
            Entry::Connect { stream, .. } => stream.as_ref().map(|s| s.as_raw_fd()),
        }
    }
}

enum RecvOutcome {
    Open,
    Stalled,
    Closed,
}

pub(crate) struct Reactor {
    poll: Poll,
    entries: Slab<Entry>,
    rx: Receiver<Command>,
    buffers: BufferPool,
    contexts: ContextPool,
    /// Connections waiting for a free receive buffer.
    stalled: Vec<usize>,
    /// Listeners with more pending sockets than one accept batch.
    accept_ready: Vec<usize>,
    shutdown: bool,
}

impl Reactor {
    pub(crate) fn new(
        poll: Poll,
        rx: Receiver<Command>,
        buffers: BufferPool,
        contexts: ContextPool,
    ) -> Self {
        Self {
            poll,
            entries: Slab::with_capacity(64),
            rx,
            buffers,
            contexts,
            stalled: Vec::new(),
            accept_ready: Vec::new(),
            shutdown: false,
        }
    }

    pub(crate) fn run(mut self) {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        debug!("reactor started");

        while !self.shutdown {
            let timeout = if self.accept_ready.is_empty() {
                TICK
            } else {
                Duration::ZERO
            };

            match self.poll.poll(&mut events, Some(timeout)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "poll failed, reactor exiting");
                    return;
                }
            }

            self.drain_commands();
            if self.shutdown {
                break;
            }

            let ready: Vec<(usize, bool, bool)> = events
                .iter()
                .filter(|ev| ev.token() != WAKER_TOKEN)
                .map(|ev| {
                    let readable = ev.is_readable() || ev.is_read_closed() || ev.is_error();
                    let writable = ev.is_writable() || ev.is_write_closed() || ev.is_error();
                    (ev.token().0, readable, writable)
                })
                .collect();

            for (token, readable, writable) in ready {
                match self.entries.get(token) {
                    Some(Entry::Listener { .. }) => self.poke_accept(token),
                    Some(Entry::Connect { .. }) => self.resolve_connect(token),
                    Some(Entry::Conn { .. }) => self.handle_conn_event(token, readable, writable),
                    None => {}
                }
            }

            self.run_accept_carryover();
            self.retry_stalled();
        }

        debug!(entries = self.entries.len(), "reactor stopped");
        for entry in self.entries.drain() {
            if let Entry::Conn { conn, recv_ctx, .. } = entry {
                if recv_ctx.buf.is_some() {
                    conn.stats().notify_receive_completed(0);
                }
                conn.reclaim_send_ctx();
            }
        }
    }

    fn drain_commands(&mut self) {
        loop {
            match self.rx.try_recv() {
                Ok(cmd) => self.handle_command(cmd),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.shutdown = true;
                    break;
                }
            }
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::RegisterConn { conn, stream } => self.register_conn(conn, stream),
            Command::DropConn { token, id } => {
                let matches = matches!(
                    self.entries.get(token),
                    Some(Entry::Conn { conn, .. }) if conn.id() == id
                );
                if matches {
                    self.remove_entry(token);
                }
            }
            Command::RegisterListener {
                listener,
                handler,
                batch,
            } => self.register_listener(listener, handler, batch),
            Command::RegisterConnect { id, stream, done } => {
                self.register_connect(id, stream, done)
            }
            Command::DropConnect { id, grace } => self.drop_connect(id, grace),
            Command::Shutdown => self.shutdown = true,
        }
    }

    fn register_conn(&mut self, conn: Arc<Connection>, stream: TcpStream) {
        if conn.is_closed() {
            // Lost the race against close; nothing to watch.
            conn.reclaim_send_ctx();
            return;
        }
        let fd = stream.as_raw_fd();
        let recv_ctx = self.contexts.get();
        let token = self.entries.insert(Entry::Conn {
            conn: Arc::clone(&conn),
            stream,
            recv_ctx,
        });
        if let Err(e) = self.poll.registry().register(
            &mut SourceFd(&fd),
            Token(token),
            Interest::READABLE | Interest::WRITABLE,
        ) {
            error!(id = %conn.id(), error = %e, "Failed to register connection");
            self.entries.remove(token);
            conn.close_internal(CloseCode::SocketDisposed, "Failed to register socket");
            return;
        }
        conn.set_token(token);
        debug!(id = %conn.id(), remote = %conn.remote_addr(), token, "Connection registered");

        // Bytes may already be waiting; drain before the first edge.
        self.handle_conn_event(token, true, false);
    }

    fn register_listener(&mut self, listener: TcpListener, handler: AcceptHandler, batch: usize) {
        let fd = listener.as_raw_fd();
        let token = self.entries.insert(Entry::Listener {
            listener,
            handler,
            batch,
        });
        if let Err(e) =
            self.poll
                .registry()
                .register(&mut SourceFd(&fd), Token(token), Interest::READABLE)
        {
            error!(error = %e, "Failed to register listener");
            self.entries.remove(token);
            return;
        }
        debug!(token, "Listener registered");
        self.poke_accept(token);
    }

    fn register_connect(&mut self, id: uuid::Uuid, stream: TcpStream, done: ConnectDone) {
        let fd = stream.as_raw_fd();
        let token = self.entries.insert(Entry::Connect {
            id,
            stream: Some(stream),
            done: Some(done),
        });
        if let Err(e) =
            self.poll
                .registry()
                .register(&mut SourceFd(&fd), Token(token), Interest::WRITABLE)
        {
            let entry = self.entries.remove(token);
            if let Entry::Connect { done: Some(done), .. } = entry {
                done(Err(e));
            }
        }
    }

    fn handle_conn_event(&mut self, token: usize, readable: bool, writable: bool) {
        let (closed, stalled, send_conn) = match self.entries.get_mut(token) {
            Some(Entry::Conn {
                conn,
                stream,
                recv_ctx,
            }) => {
                let mut closed = false;
                let mut stalled = false;
                if readable {
                    match drive_receive(conn, stream, recv_ctx, &self.buffers) {
                        RecvOutcome::Closed => closed = true,
                        RecvOutcome::Stalled => stalled = true,
                        RecvOutcome::Open => {}
                    }
                }
                let send_conn = if writable && !closed {
                    Some(Arc::clone(conn))
                } else {
                    None
                };
                (closed, stalled, send_conn)
            }
            _ => return,
        };

        if closed {
            self.remove_entry(token);
            return;
        }
        if stalled && !self.stalled.contains(&token) {
            self.stalled.push(token);
        }
        if let Some(conn) = send_conn {
            conn.continue_send();
        }
    }

    /// Tear down the socket of a connect attempt the connector gave up on.
    fn drop_connect(&mut self, id: uuid::Uuid, grace: Duration) {
        let token = self.entries.iter().find_map(|(token, entry)| {
            matches!(entry, Entry::Connect { id: eid, .. } if *eid == id).then_some(token)
        });
        let Some(token) = token else { return };
        if let Entry::Connect { stream, .. } = self.entries.remove(token) {
            if let Some(stream) = stream {
                let fd = stream.as_raw_fd();
                let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
                let _ = socket2::SockRef::from(&stream).set_linger(Some(grace));
            }
            debug!(id = %id, token, "Abandoned connect dropped");
        }
    }

    /// Resolve a pending outbound connect, whichever way it went.
    fn resolve_connect(&mut self, token: usize) {
        let (stream, done) = match self.entries.get_mut(token) {
            Some(Entry::Connect { stream, done, .. }) => {
                match (stream.take(), done.take()) {
                    (Some(s), Some(d)) => (s, d),
                    _ => return,
                }
            }
            _ => return,
        };
        let fd = stream.as_raw_fd();
        let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
        self.entries.remove(token);

        let outcome = match stream.take_error() {
            Ok(Some(e)) => Err(e),
            Ok(None) => Ok(stream),
            Err(e) => Err(e),
        };
        done(outcome);
    }

    /// Accept one batch; park the listener on the carry-over list if more
    /// sockets are still pending.
    fn poke_accept(&mut self, token: usize) {
        let drained = match self.entries.get_mut(token) {
            Some(Entry::Listener {
                listener,
                handler,
                batch,
            }) => {
                let handler = Arc::clone(handler);
                drive_accept(listener, &handler, *batch)
            }
            _ => return,
        };
        if !drained && !self.accept_ready.contains(&token) {
            self.accept_ready.push(token);
        }
    }

    fn run_accept_carryover(&mut self) {
        let pending = std::mem::take(&mut self.accept_ready);
        for token in pending {
            self.poke_accept(token);
        }
    }

    fn retry_stalled(&mut self) {
        let tokens = std::mem::take(&mut self.stalled);
        for token in tokens {
            self.handle_conn_event(token, true, false);
        }
    }

    fn remove_entry(&mut self, token: usize) {
        if !self.entries.contains(token) {
            return;
        }
        let entry = self.entries.remove(token);
        if let Some(fd) = entry.raw_fd() {
            let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
        }
        if let Entry::Conn { conn, recv_ctx, .. } = entry {
            // A receive armed at teardown never completes; settle the books.
            if recv_ctx.buf.is_some() {
                conn.stats().notify_receive_completed(0);
            }
            // No more writable edges will arrive; a send context stranded by
            // a close-while-blocked send is reclaimed here.
            conn.reclaim_send_ctx();
            debug!(id = %conn.id(), token, "Connection deregistered");
        }
        self.stalled.retain(|&t| t != token);
        self.accept_ready.retain(|&t| t != token);
    }
}

/// Socket-level receive loop: keep one pooled buffer armed, append each
/// filled chunk to the connection's receive queue, and dispatch to any
/// registered continuation. Zero bytes or a socket error end the connection.
fn drive_receive(
    conn: &Arc<Connection>,
    stream: &TcpStream,
    ctx: &mut CtxHandle,
    buffers: &BufferPool,
) -> RecvOutcome {
    let mut got_data = false;
    loop {
        if ctx.buf.is_none() {
            match buffers.checkout() {
                Ok(buf) => {
                    conn.stats().notify_receive_starting();
                    ctx.buf = Some(buf);
                }
                Err(e) => {
                    debug!(id = %conn.id(), error = %e, "Receive paused, pool empty");
                    if got_data {
                        conn.try_dequeue_received();
                    }
                    return RecvOutcome::Stalled;
                }
            }
        }

        let read = match ctx.buf.as_mut() {
            Some(buf) => {
                let mut reader = stream;
                reader.read(buf.as_mut_slice())
            }
            None => return RecvOutcome::Open,
        };

        match read {
            Ok(0) => {
                conn.stats().notify_receive_completed(0);
                ctx.buf = None;
                conn.try_dequeue_received();
                conn.close_internal(CloseCode::PeerClosed, "Socket closed");
                return RecvOutcome::Closed;
            }
            Ok(n) => {
                conn.stats().notify_receive_completed(n);
                if let Some(buf) = ctx.buf.take() {
                    conn.push_received(Segment::new(buf, n));
                    got_data = true;
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                conn.stats().notify_receive_completed(0);
                ctx.buf = None;
                conn.try_dequeue_received();
                conn.close_internal(CloseCode::RecvError, &format!("Socket receive error: {e}"));
                return RecvOutcome::Closed;
            }
        }
    }

    if got_data {
        conn.try_dequeue_received();
    }
    RecvOutcome::Open
}

/// Accept up to `batch` sockets. Returns true when the listener is drained;
/// false when a carry-over is needed. Per-socket accept errors consume a
/// batch slot but do not stop the pass.
fn drive_accept(listener: &TcpListener, handler: &AcceptHandler, batch: usize) -> bool {
    for _ in 0..batch.max(1) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "Accepted connection");
                handler(stream, peer);
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return true,
            Err(e) => {
                // The failed socket is gone; keep accepting in its place so
                // sockets already queued behind it are not stranded.
                warn!(error = %e, "Accept error");
                continue;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_accept_error_does_not_end_batch() {
        // A bound but non-listening socket makes accept() fail with a real
        // error rather than WouldBlock, on every attempt.
        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )
        .unwrap();
        socket
            .bind(&"127.0.0.1:0".parse::<SocketAddr>().unwrap().into())
            .unwrap();
        socket.set_nonblocking(true).unwrap();
        let listener: TcpListener = socket.into();

        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        let handler: AcceptHandler = Arc::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        // Errors consume batch slots instead of aborting the pass, so the
        // full batch runs and the listener is reported as not drained.
        let drained = drive_accept(&listener, &handler, 3);
        assert!(!drained);
        assert_eq!(accepted.load(Ordering::SeqCst), 0);
    }
}
