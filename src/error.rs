//! Error taxonomy for the transport.
//!
//! Transient socket errors terminate the affected connection; exhaustion
//! errors are backpressure; invariant violations are panics and never appear
//! here.

use std::fmt;
use std::io;
use std::net::SocketAddr;

use crate::buffer::BufferError;

/// Errors surfaced by transport operations.
#[derive(Debug)]
pub enum TransportError {
    /// Generic socket-layer failure.
    Io(io::Error),
    /// Bind or listen failed at listener startup. Fatal for the listener.
    Bind(SocketAddr, io::Error),
    /// Outbound connect was rejected by the socket layer.
    Connect(io::Error),
    /// Outbound connect did not complete before its deadline.
    ConnectTimeout,
    /// Buffer pool could not satisfy a request.
    Buffer(BufferError),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Io(e) => write!(f, "socket error: {e}"),
            TransportError::Bind(addr, e) => {
                write!(f, "failed to bind/listen on {addr}: {e}")
            }
            TransportError::Connect(e) => write!(f, "connect failed: {e}"),
            TransportError::ConnectTimeout => write!(f, "connection establishment timeout"),
            TransportError::Buffer(e) => write!(f, "buffer pool error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Io(e) | TransportError::Bind(_, e) | TransportError::Connect(e) => {
                Some(e)
            }
            TransportError::Buffer(e) => Some(e),
            TransportError::ConnectTimeout => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        TransportError::Io(e)
    }
}

impl From<BufferError> for TransportError {
    fn from(e: BufferError) -> Self {
        TransportError::Buffer(e)
    }
}

/// Machine-readable close code carried by the closed notification,
/// alongside a human-readable reason string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// Close requested locally through `Connection::close`.
    Normal,
    /// Remote side closed the socket (zero-byte receive).
    PeerClosed,
    /// A socket receive reported an error.
    RecvError,
    /// A socket send reported an error.
    SendError,
    /// The socket was unusable when the connection tried to initialize it.
    SocketDisposed,
    /// Outbound establishment exceeded its deadline.
    Timeout,
}

impl CloseCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseCode::Normal => "normal",
            CloseCode::PeerClosed => "peer-closed",
            CloseCode::RecvError => "recv-error",
            CloseCode::SendError => "send-error",
            CloseCode::SocketDisposed => "socket-disposed",
            CloseCode::Timeout => "timeout",
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let e = TransportError::ConnectTimeout;
        assert_eq!(e.to_string(), "connection establishment timeout");

        let e = TransportError::Connect(io::Error::new(io::ErrorKind::ConnectionRefused, "nope"));
        assert!(e.to_string().contains("connect failed"));
    }

    #[test]
    fn test_close_code_str() {
        assert_eq!(CloseCode::Normal.as_str(), "normal");
        assert_eq!(CloseCode::Timeout.to_string(), "timeout");
    }
}
