//! TCP listener: binds, registers with the reactor, and hands accepted
//! sockets to an application handler.

use std::net::SocketAddr;
use std::net::TcpStream;
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::info;

use crate::config::ListenerConfig;
use crate::error::TransportError;
use crate::reactor::Command;
use crate::transport::Transport;

/// A started listener. Accepts run on the reactor thread; the handler gets
/// the raw accepted socket and is expected to wrap it, usually via
/// [`Connection::accepted`](crate::Connection::accepted).
pub struct Listener {
    local: SocketAddr,
}

impl Listener {
    /// Bind per `config` and start accepting. Bind and listen failures are
    /// fatal and returned; per-socket accept failures later are logged and
    /// skipped.
    pub fn start(
        transport: &Transport,
        config: &ListenerConfig,
        handler: impl Fn(TcpStream, SocketAddr) + Send + Sync + 'static,
    ) -> Result<Self, TransportError> {
        let addr: SocketAddr = config.bind.parse().map_err(|_| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid bind address: {}", config.bind),
            ))
        })?;

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| TransportError::Bind(addr, e))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| TransportError::Bind(addr, e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| TransportError::Bind(addr, e))?;
        socket
            .bind(&addr.into())
            .map_err(|e| TransportError::Bind(addr, e))?;
        socket
            .listen(config.backlog as i32)
            .map_err(|e| TransportError::Bind(addr, e))?;

        let listener: std::net::TcpListener = socket.into();
        let local = listener.local_addr().map_err(|e| TransportError::Bind(addr, e))?;

        info!(addr = %local, backlog = config.backlog, "Listening");

        transport.reactor_handle().send(Command::RegisterListener {
            listener,
            handler: Arc::new(handler),
            batch: config.accept_concurrency,
        });

        Ok(Self { local })
    }

    /// The bound address, with the OS-assigned port when the config asked
    /// for port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
}
