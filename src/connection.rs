//! The connection engine: framed-free byte transport over one TCP socket.
//!
//! Sends are queued from any thread and drained by a single in-flight send
//! operation that coalesces queued segments into one socket write. Receives
//! are driven by the reactor and handed to the application as batches of
//! pooled segments through a one-shot continuation. Close is idempotent and
//! fires the closed notification exactly once.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use socket2::SockRef;
use tracing::{debug, error};
use uuid::Uuid;

use crate::buffer::Segment;
use crate::context::{ContextPool, CtxHandle};
use crate::error::{CloseCode, TransportError};
use crate::reactor::{Command, ReactorHandle};
use crate::stats::ConnStats;
use crate::sync::OpLock;
use crate::transport::Transport;

/// Upper bound on bytes coalesced into a single socket write. The drain
/// stops at the first whole segment that crosses the bound, so one packet
/// may overshoot it by less than a segment.
pub const MAX_SEND_PACKET: usize = 64 * 1024;

/// `offset` sentinel marking a drained scratch as already accounted for.
/// Whichever thread observes completion first claims it by storing this.
const SEND_CONSUMED: usize = usize::MAX;

const NO_TOKEN: usize = usize::MAX;

type ReceiveHandler = Box<dyn FnOnce(&Connection, Vec<Segment>) + Send>;
type ClosedHandler = Box<dyn FnOnce(&Connection, CloseCode, &str) + Send>;

enum SendProgress {
    /// This call wrote the last pending byte; holds the packet size.
    Completed(usize),
    /// Another thread already claimed completion of this packet.
    Claimed,
    /// Socket is full; the next writable edge resumes.
    Blocked,
    /// Socket or send context gone; the connection is closing.
    Disposed,
    /// Socket error; carries the size of the packet being written.
    Failed(usize, io::Error),
}

struct RecvState {
    queue: VecDeque<Segment>,
    callback: Option<ReceiveHandler>,
}

pub struct Connection {
    id: Uuid,
    remote: SocketAddr,
    local: Mutex<Option<SocketAddr>>,
    socket: Mutex<Option<TcpStream>>,
    send_queue: Mutex<VecDeque<Bytes>>,
    send_lock: OpLock,
    is_sending: AtomicBool,
    send_ctx: Mutex<Option<CtxHandle>>,
    recv: Mutex<RecvState>,
    on_closed: Mutex<Option<ClosedHandler>>,
    stats: ConnStats,
    token: AtomicUsize,
    reactor: ReactorHandle,
    contexts: ContextPool,
    close_grace: Duration,
}

impl Connection {
    /// Wrap a socket handed over by a listener's accept handler.
    pub fn accepted(
        transport: &Transport,
        id: Uuid,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<Arc<Self>, TransportError> {
        let conn = Self::create(transport, id, peer, transport.accept_close_grace());
        conn.init_socket(stream)?;
        Ok(conn)
    }

    /// A connection whose socket is still being established by the connector.
    pub(crate) fn connecting(
        transport: &Transport,
        id: Uuid,
        remote: SocketAddr,
        close_grace: Duration,
    ) -> Arc<Self> {
        Self::create(transport, id, remote, close_grace)
    }

    fn create(
        transport: &Transport,
        id: Uuid,
        remote: SocketAddr,
        close_grace: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            remote,
            local: Mutex::new(None),
            socket: Mutex::new(None),
            send_queue: Mutex::new(VecDeque::new()),
            send_lock: OpLock::new(),
            is_sending: AtomicBool::new(false),
            send_ctx: Mutex::new(None),
            recv: Mutex::new(RecvState {
                queue: VecDeque::new(),
                callback: None,
            }),
            on_closed: Mutex::new(None),
            stats: ConnStats::new(),
            token: AtomicUsize::new(NO_TOKEN),
            reactor: transport.reactor_handle(),
            contexts: transport.context_pool().clone(),
            close_grace,
        })
    }

    /// Attach an established socket: configure it, hand a clone to the
    /// reactor, and flush anything already queued for send.
    pub(crate) fn init_socket(self: &Arc<Self>, stream: TcpStream) -> Result<(), TransportError> {
        if self.stats.is_closed() {
            return Ok(());
        }
        stream.set_nonblocking(true)?;
        if stream.set_nodelay(true).is_err() {
            self.close_internal(CloseCode::SocketDisposed, "Socket disposed");
            return Ok(());
        }
        *self.local.lock().unwrap_or_else(|e| e.into_inner()) = stream.local_addr().ok();
        self.stats.attach_fd(stream.as_raw_fd());

        let reactor_stream = stream.try_clone()?;
        {
            let _guard = self.send_lock.acquire();
            *self.socket.lock().unwrap_or_else(|e| e.into_inner()) = Some(stream);
            *self.send_ctx.lock().unwrap_or_else(|e| e.into_inner()) = Some(self.contexts.get());
        }
        self.reactor.send(Command::RegisterConn {
            conn: Arc::clone(self),
            stream: reactor_stream,
        });
        self.try_send();
        Ok(())
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn stats(&self) -> &ConnStats {
        &self.stats
    }

    pub fn is_closed(&self) -> bool {
        self.stats.is_closed()
    }

    /// Number of segments waiting to enter a send packet.
    pub fn send_queue_len(&self) -> usize {
        self.send_queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn total_bytes_sent(&self) -> u64 {
        self.stats.total_bytes_sent()
    }

    pub fn total_bytes_received(&self) -> u64 {
        self.stats.total_bytes_received()
    }

    pub fn pending_send_bytes(&self) -> u64 {
        self.stats.pending_send_bytes()
    }

    pub fn pending_received_bytes(&self) -> u64 {
        self.stats.pending_received_bytes()
    }

    pub fn is_ready_for_send(&self) -> bool {
        self.stats.is_ready_for_send()
    }

    pub fn is_ready_for_receive(&self) -> bool {
        self.stats.is_ready_for_receive()
    }

    pub fn is_faulted(&self) -> bool {
        self.stats.is_faulted()
    }

    /// When the current send started, if one is in flight.
    pub fn last_send_started(&self) -> Option<std::time::Instant> {
        self.stats.last_send_started()
    }

    /// When the current receive started, if one is in flight.
    pub fn last_receive_started(&self) -> Option<std::time::Instant> {
        self.stats.last_receive_started()
    }

    /// Register a handler fired exactly once when the connection closes.
    /// A handler registered after close never fires.
    pub fn on_closed(
        &self,
        handler: impl FnOnce(&Connection, CloseCode, &str) + Send + 'static,
    ) {
        *self.on_closed.lock().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(handler));
    }

    /// Queue segments for sending and attempt to start a send.
    pub fn enqueue_send(&self, segments: Vec<Bytes>) {
        let total: usize = segments.iter().map(|s| s.len()).sum();
        {
            let mut queue = self.send_queue.lock().unwrap_or_else(|e| e.into_inner());
            for seg in segments {
                if !seg.is_empty() {
                    queue.push_back(seg);
                }
            }
        }
        self.stats.notify_send_enqueued(total);
        self.try_send();
    }

    /// Start a send if nothing is in flight: drain the queue into the send
    /// context's scratch up to [`MAX_SEND_PACKET`] and write until done or
    /// blocked. Loops while more packets are queued.
    pub(crate) fn try_send(&self) {
        loop {
            {
                let _guard = self.send_lock.acquire();
                if self.is_sending.load(Ordering::Acquire) || self.stats.is_closed() {
                    return;
                }
                if self.send_queue.lock().unwrap_or_else(|e| e.into_inner()).is_empty() {
                    return;
                }
                if self.socket.lock().unwrap_or_else(|e| e.into_inner()).is_none() {
                    return;
                }
                self.is_sending.store(true, Ordering::Release);
            }

            {
                let mut slot = self.send_ctx.lock().unwrap_or_else(|e| e.into_inner());
                let Some(ctx) = slot.as_deref_mut() else {
                    drop(slot);
                    let _guard = self.send_lock.acquire();
                    self.is_sending.store(false, Ordering::Release);
                    return;
                };
                ctx.scratch.clear();
                ctx.offset = 0;
                {
                    let mut queue = self.send_queue.lock().unwrap_or_else(|e| e.into_inner());
                    while let Some(seg) = queue.pop_front() {
                        ctx.scratch.extend_from_slice(&seg);
                        if ctx.scratch.len() >= MAX_SEND_PACKET {
                            break;
                        }
                    }
                }
                // Recorded before the context lock drops, so a concurrent
                // writable edge can never claim completion of a packet whose
                // start is not yet on the books.
                self.stats.notify_send_starting(ctx.scratch.len());
            }

            match self.write_pending() {
                SendProgress::Completed(sent) => {
                    self.stats.notify_send_completed(sent);
                    if self.stats.is_closed() {
                        self.return_send_ctx();
                        return;
                    }
                    let _guard = self.send_lock.acquire();
                    self.is_sending.store(false, Ordering::Release);
                    // Loop: more segments may have queued during the write.
                }
                SendProgress::Claimed | SendProgress::Blocked => return,
                SendProgress::Disposed => {
                    self.return_send_ctx();
                    return;
                }
                SendProgress::Failed(len, e) => {
                    self.stats.notify_send_failed(len);
                    self.return_send_ctx();
                    self.close_internal(
                        CloseCode::SendError,
                        &format!("Socket send error: {e}"),
                    );
                    return;
                }
            }
        }
    }

    /// Writable edge from the reactor: resume a blocked send.
    pub(crate) fn continue_send(&self) {
        if !self.is_sending.load(Ordering::Acquire) {
            return;
        }
        match self.write_pending() {
            SendProgress::Completed(sent) => {
                self.stats.notify_send_completed(sent);
                if self.stats.is_closed() {
                    self.return_send_ctx();
                    return;
                }
                {
                    let _guard = self.send_lock.acquire();
                    self.is_sending.store(false, Ordering::Release);
                }
                self.try_send();
            }
            SendProgress::Claimed | SendProgress::Blocked => {}
            SendProgress::Disposed => self.return_send_ctx(),
            SendProgress::Failed(len, e) => {
                self.stats.notify_send_failed(len);
                self.return_send_ctx();
                self.close_internal(CloseCode::SendError, &format!("Socket send error: {e}"));
            }
        }
    }

    /// Push the current packet toward the socket. Completion is claimed
    /// under the context lock so concurrent callers settle it exactly once.
    fn write_pending(&self) -> SendProgress {
        let mut slot = self.send_ctx.lock().unwrap_or_else(|e| e.into_inner());
        let Some(ctx) = slot.as_deref_mut() else {
            return SendProgress::Disposed;
        };
        if ctx.offset == SEND_CONSUMED {
            return SendProgress::Claimed;
        }

        let sock_guard = self.socket.lock().unwrap_or_else(|e| e.into_inner());
        let Some(sock) = sock_guard.as_ref() else {
            return SendProgress::Disposed;
        };

        loop {
            if ctx.offset >= ctx.scratch.len() {
                let sent = ctx.scratch.len();
                ctx.offset = SEND_CONSUMED;
                return SendProgress::Completed(sent);
            }
            let mut writer = sock;
            match writer.write(&ctx.scratch[ctx.offset..]) {
                Ok(0) => {
                    return SendProgress::Failed(
                        ctx.scratch.len(),
                        io::Error::new(io::ErrorKind::WriteZero, "socket write returned zero"),
                    )
                }
                Ok(n) => ctx.offset += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return SendProgress::Blocked
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return SendProgress::Failed(ctx.scratch.len(), e),
            }
        }
    }

    fn return_send_ctx(&self) {
        let _ = self
            .send_ctx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    /// Last-resort context return, called once the reactor stops watching a
    /// closed connection. A send blocked at close time never gets another
    /// writable edge, so nothing else would return its context.
    pub(crate) fn reclaim_send_ctx(&self) {
        if self.stats.is_closed() {
            self.return_send_ctx();
        }
    }

    /// Register a one-shot continuation for received data. Fires on the
    /// caller's thread right away when data is already queued, otherwise on
    /// the reactor thread when data arrives. Queued segments survive close,
    /// so a continuation registered afterwards still drains them.
    ///
    /// # Panics
    /// Panics if a continuation is already registered.
    pub fn receive(&self, continuation: impl FnOnce(&Connection, Vec<Segment>) + Send + 'static) {
        {
            let mut state = self.recv.lock().unwrap_or_else(|e| e.into_inner());
            if state.callback.is_some() {
                drop(state);
                error!(id = %self.id, "receive called again while previous call wasn't fulfilled");
                panic!("receive called again while previous call wasn't fulfilled");
            }
            state.callback = Some(Box::new(continuation));
        }
        self.try_dequeue_received();
    }

    pub(crate) fn push_received(&self, segment: Segment) {
        self.recv
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .queue
            .push_back(segment);
    }

    /// Dispatch all queued segments to the registered continuation, if both
    /// exist. The take-under-lock means exactly one thread dispatches any
    /// given batch; the loop covers a continuation that immediately
    /// re-registers while more data queues.
    pub(crate) fn try_dequeue_received(&self) {
        loop {
            let (callback, segments) = {
                let mut state = self.recv.lock().unwrap_or_else(|e| e.into_inner());
                if state.callback.is_none() || state.queue.is_empty() {
                    return;
                }
                let callback = match state.callback.take() {
                    Some(cb) => cb,
                    None => return,
                };
                let segments: Vec<Segment> = state.queue.drain(..).collect();
                (callback, segments)
            };
            let bytes: usize = segments.iter().map(|s| s.len()).sum();
            self.stats.notify_receive_dispatched(bytes);
            callback(self, segments);
        }
    }

    /// Close the connection. Safe to call from any thread, any number of
    /// times; only the first call does anything.
    pub fn close(&self, reason: &str) {
        self.close_internal(CloseCode::Normal, reason);
    }

    pub(crate) fn close_internal(&self, code: CloseCode, reason: &str) {
        if !self.stats.mark_closed() {
            return;
        }

        debug!(
            id = %self.id,
            remote = %self.remote,
            local = ?self.local_addr(),
            received_bytes = self.stats.total_bytes_received(),
            sent_bytes = self.stats.total_bytes_sent(),
            send_calls = self.stats.send_calls(),
            send_callbacks = self.stats.send_callbacks(),
            receive_calls = self.stats.receive_calls(),
            receive_callbacks = self.stats.receive_callbacks(),
            code = %code,
            reason,
            "Connection closed",
        );

        // Teardown failures are already a close; swallow them.
        let socket = self.socket.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(sock) = socket {
            let _ = SockRef::from(&sock).set_linger(Some(self.close_grace));
            let _ = sock.shutdown(std::net::Shutdown::Both);
        }
        self.stats.clear_fd();

        {
            let _guard = self.send_lock.acquire();
            if !self.is_sending.load(Ordering::Acquire) {
                self.return_send_ctx();
            }
            // An in-flight send returns its context itself when it observes
            // the closed flag.
        }

        let token = self.token.load(Ordering::Acquire);
        if token != NO_TOKEN {
            self.reactor.send(Command::DropConn { token, id: self.id });
        }

        let handler = self.on_closed.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handler) = handler {
            handler(self, code, reason);
        }
    }

    pub(crate) fn set_token(&self, token: usize) {
        self.token.store(token, Ordering::Release);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("local", &self.local_addr())
            .field("closed", &self.is_closed())
            .finish()
    }
}
