//! Per-connection counters and state guards. Pure bookkeeping, no I/O.
//!
//! Besides observability counters, this is the enforcement point for the
//! transport's core invariant: at most one send and one receive operation in
//! flight per connection. Starting a second operation in the same direction
//! is a programming error and panics.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use tracing::error;

/// Sentinel for "no operation in flight" in the last-started slots.
const NOT_IN_FLIGHT: i64 = -1;

/// Monotonic base for the nanosecond timestamps stored in atomics.
fn clock_base() -> Instant {
    static BASE: OnceLock<Instant> = OnceLock::new();
    *BASE.get_or_init(Instant::now)
}

fn now_nanos() -> i64 {
    clock_base().elapsed().as_nanos() as i64
}

/// Statistics and state base for one connection.
pub struct ConnStats {
    total_sent: AtomicU64,
    total_received: AtomicU64,
    /// Bytes enqueued but not yet handed to a send operation.
    pending_send: AtomicI64,
    /// Bytes inside the currently in-flight send.
    in_send: AtomicI64,
    /// Bytes received but not yet dispatched to a continuation.
    pending_received: AtomicI64,
    send_calls: AtomicU32,
    send_callbacks: AtomicU32,
    recv_calls: AtomicU32,
    recv_callbacks: AtomicU32,
    /// Nanos since the clock base, or NOT_IN_FLIGHT. Doubles as the
    /// one-in-flight guard for each direction.
    last_send_started: AtomicI64,
    last_recv_started: AtomicI64,
    closed: AtomicBool,
    /// Raw fd for readiness probes; -1 when no socket is attached.
    fd: AtomicI32,
}

impl ConnStats {
    pub fn new() -> Self {
        Self {
            total_sent: AtomicU64::new(0),
            total_received: AtomicU64::new(0),
            pending_send: AtomicI64::new(0),
            in_send: AtomicI64::new(0),
            pending_received: AtomicI64::new(0),
            send_calls: AtomicU32::new(0),
            send_callbacks: AtomicU32::new(0),
            recv_calls: AtomicU32::new(0),
            recv_callbacks: AtomicU32::new(0),
            last_send_started: AtomicI64::new(NOT_IN_FLIGHT),
            last_recv_started: AtomicI64::new(NOT_IN_FLIGHT),
            closed: AtomicBool::new(false),
            fd: AtomicI32::new(-1),
        }
    }

    pub fn notify_send_enqueued(&self, bytes: usize) {
        self.pending_send.fetch_add(bytes as i64, Ordering::AcqRel);
    }

    /// Record the start of a send operation.
    ///
    /// # Panics
    /// Panics if a send is already in flight.
    pub fn notify_send_starting(&self, bytes: usize) {
        if self
            .last_send_started
            .compare_exchange(NOT_IN_FLIGHT, now_nanos(), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            error!("concurrent send detected");
            panic!("concurrent send detected");
        }
        self.pending_send.fetch_sub(bytes as i64, Ordering::AcqRel);
        self.in_send.fetch_add(bytes as i64, Ordering::AcqRel);
        self.send_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn notify_send_completed(&self, bytes: usize) {
        self.last_send_started.store(NOT_IN_FLIGHT, Ordering::Release);
        self.in_send.fetch_sub(bytes as i64, Ordering::AcqRel);
        self.total_sent.fetch_add(bytes as u64, Ordering::AcqRel);
        self.send_callbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Settle a send that errored: the in-flight packet is accounted off
    /// without counting its bytes as sent.
    pub fn notify_send_failed(&self, bytes: usize) {
        self.last_send_started.store(NOT_IN_FLIGHT, Ordering::Release);
        self.in_send.fetch_sub(bytes as i64, Ordering::AcqRel);
        self.send_callbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the start of a receive operation.
    ///
    /// # Panics
    /// Panics if a receive is already in flight.
    pub fn notify_receive_starting(&self) {
        if self
            .last_recv_started
            .compare_exchange(NOT_IN_FLIGHT, now_nanos(), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            error!("concurrent receive detected");
            panic!("concurrent receive detected");
        }
        self.recv_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn notify_receive_completed(&self, bytes: usize) {
        self.last_recv_started.store(NOT_IN_FLIGHT, Ordering::Release);
        self.pending_received.fetch_add(bytes as i64, Ordering::AcqRel);
        self.total_received.fetch_add(bytes as u64, Ordering::AcqRel);
        self.recv_callbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn notify_receive_dispatched(&self, bytes: usize) {
        self.pending_received.fetch_sub(bytes as i64, Ordering::AcqRel);
    }

    /// Transition the closed flag. Returns true for exactly one caller;
    /// the flag never reverts.
    pub fn mark_closed(&self) -> bool {
        self.closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn attach_fd(&self, fd: RawFd) {
        self.fd.store(fd, Ordering::Release);
    }

    pub fn clear_fd(&self) {
        self.fd.store(-1, Ordering::Release);
    }

    pub fn total_bytes_sent(&self) -> u64 {
        self.total_sent.load(Ordering::Acquire)
    }

    pub fn total_bytes_received(&self) -> u64 {
        self.total_received.load(Ordering::Acquire)
    }

    pub fn pending_send_bytes(&self) -> u64 {
        self.pending_send.load(Ordering::Acquire).max(0) as u64
    }

    pub fn in_send_bytes(&self) -> u64 {
        self.in_send.load(Ordering::Acquire).max(0) as u64
    }

    pub fn pending_received_bytes(&self) -> u64 {
        self.pending_received.load(Ordering::Acquire).max(0) as u64
    }

    pub fn send_calls(&self) -> u32 {
        self.send_calls.load(Ordering::Relaxed)
    }

    pub fn send_callbacks(&self) -> u32 {
        self.send_callbacks.load(Ordering::Relaxed)
    }

    pub fn receive_calls(&self) -> u32 {
        self.recv_calls.load(Ordering::Relaxed)
    }

    pub fn receive_callbacks(&self) -> u32 {
        self.recv_callbacks.load(Ordering::Relaxed)
    }

    pub fn in_send(&self) -> bool {
        self.last_send_started.load(Ordering::Acquire) != NOT_IN_FLIGHT
    }

    pub fn in_receive(&self) -> bool {
        self.last_recv_started.load(Ordering::Acquire) != NOT_IN_FLIGHT
    }

    pub fn last_send_started(&self) -> Option<Instant> {
        instant_from_nanos(self.last_send_started.load(Ordering::Acquire))
    }

    pub fn last_receive_started(&self) -> Option<Instant> {
        instant_from_nanos(self.last_recv_started.load(Ordering::Acquire))
    }

    /// Whether the socket would accept a send right now. False once closed
    /// or once the handle is gone, rather than an error.
    pub fn is_ready_for_send(&self) -> bool {
        !self.is_closed() && self.probe(libc::POLLOUT, libc::POLLOUT)
    }

    /// Whether the socket has bytes to read right now.
    pub fn is_ready_for_receive(&self) -> bool {
        !self.is_closed() && self.probe(libc::POLLIN, libc::POLLIN)
    }

    /// Whether the socket is in an error state.
    pub fn is_faulted(&self) -> bool {
        !self.is_closed() && self.probe(0, libc::POLLERR)
    }

    /// Zero-timeout poll(2) probe. Degrades to false when no fd is attached.
    fn probe(&self, events: libc::c_short, check: libc::c_short) -> bool {
        let fd = self.fd.load(Ordering::Acquire);
        if fd < 0 {
            return false;
        }
        let mut pfd = libc::pollfd {
            fd,
            events,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
        rc > 0 && (pfd.revents & check) != 0
    }
}

impl Default for ConnStats {
    fn default() -> Self {
        Self::new()
    }
}

fn instant_from_nanos(nanos: i64) -> Option<Instant> {
    if nanos < 0 {
        None
    } else {
        Some(clock_base() + Duration::from_nanos(nanos as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_accounting() {
        let stats = ConnStats::new();
        stats.notify_send_enqueued(100);
        assert_eq!(stats.pending_send_bytes(), 100);

        stats.notify_send_starting(100);
        assert_eq!(stats.pending_send_bytes(), 0);
        assert_eq!(stats.in_send_bytes(), 100);
        assert!(stats.in_send());
        assert!(stats.last_send_started().is_some());

        stats.notify_send_completed(100);
        assert_eq!(stats.in_send_bytes(), 0);
        assert_eq!(stats.total_bytes_sent(), 100);
        assert_eq!(stats.send_calls(), 1);
        assert_eq!(stats.send_callbacks(), 1);
        assert!(!stats.in_send());
    }

    #[test]
    fn test_receive_accounting() {
        let stats = ConnStats::new();
        stats.notify_receive_starting();
        assert!(stats.in_receive());

        stats.notify_receive_completed(35);
        assert_eq!(stats.pending_received_bytes(), 35);
        assert_eq!(stats.total_bytes_received(), 35);

        stats.notify_receive_dispatched(35);
        assert_eq!(stats.pending_received_bytes(), 0);
        assert_eq!(stats.receive_calls(), 1);
        assert_eq!(stats.receive_callbacks(), 1);
    }

    #[test]
    fn test_failed_send_settles_in_flight() {
        let stats = ConnStats::new();
        stats.notify_send_enqueued(64);
        stats.notify_send_starting(64);
        assert_eq!(stats.in_send_bytes(), 64);

        stats.notify_send_failed(64);
        assert_eq!(stats.in_send_bytes(), 0);
        assert_eq!(stats.total_bytes_sent(), 0);
        assert!(!stats.in_send());
        assert_eq!(stats.send_callbacks(), 1);
    }

    #[test]
    #[should_panic(expected = "concurrent send detected")]
    fn test_concurrent_send_rejected() {
        let stats = ConnStats::new();
        stats.notify_send_starting(1);
        stats.notify_send_starting(1);
    }

    #[test]
    #[should_panic(expected = "concurrent receive detected")]
    fn test_concurrent_receive_rejected() {
        let stats = ConnStats::new();
        stats.notify_receive_starting();
        stats.notify_receive_starting();
    }

    #[test]
    fn test_closed_flag_is_monotonic_and_exclusive() {
        let stats = ConnStats::new();
        assert!(!stats.is_closed());
        assert!(stats.mark_closed());
        assert!(!stats.mark_closed());
        assert!(stats.is_closed());
    }

    #[test]
    fn test_readiness_degrades_without_fd() {
        let stats = ConnStats::new();
        assert!(!stats.is_ready_for_send());
        assert!(!stats.is_ready_for_receive());
        assert!(!stats.is_faulted());
    }

    #[test]
    fn test_readiness_with_live_socket() {
        use std::os::unix::io::AsRawFd;

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();

        let stats = ConnStats::new();
        stats.attach_fd(stream.as_raw_fd());
        // A fresh connected socket has send buffer space.
        assert!(stats.is_ready_for_send());
        assert!(!stats.is_faulted());

        stats.clear_fd();
        assert!(!stats.is_ready_for_send());
    }
}
