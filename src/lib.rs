//! Non-blocking TCP connection transport.
//!
//! `wireline` moves raw bytes over TCP without imposing a framing protocol.
//! A [`Transport`] owns the buffer and context pools and a single reactor
//! thread; [`Listener`]s accept inbound sockets, a [`Connector`] establishes
//! outbound ones under a deadline, and both sides end up as [`Connection`]s:
//! queue-and-coalesce sends from any thread, batched receives delivered to a
//! one-shot continuation, idempotent close with a final stats summary.
//!
//! ```no_run
//! use wireline::{Connection, Listener, Transport, TransportConfig};
//! use uuid::Uuid;
//!
//! let config = TransportConfig::default();
//! let transport = Transport::start(config)?;
//! let listener_config = transport.config().listener.clone();
//! let accept_transport = transport.clone();
//! let listener = Listener::start(&transport, &listener_config, move |stream, peer| {
//!     if let Ok(conn) = Connection::accepted(&accept_transport, Uuid::new_v4(), stream, peer) {
//!         conn.receive(|conn, segments| {
//!             let echoed: Vec<_> = segments
//!                 .iter()
//!                 .map(|s| bytes::Bytes::copy_from_slice(s))
//!                 .collect();
//!             conn.enqueue_send(echoed);
//!         });
//!     }
//! })?;
//! println!("listening on {}", listener.local_addr());
//! # Ok::<(), wireline::TransportError>(())
//! ```

mod buffer;
mod config;
mod connection;
mod connector;
mod context;
mod error;
mod listener;
mod reactor;
mod stats;
mod sync;
mod transport;

pub use buffer::{BufferError, BufferPool, PooledBuf, Segment};
pub use config::{
    BufferConfig, ConfigError, ConnectorConfig, ContextConfig, ListenerConfig, TransportConfig,
};
pub use connection::{Connection, MAX_SEND_PACKET};
pub use connector::Connector;
pub use context::{ContextPool, CtxHandle, OpContext};
pub use error::{CloseCode, TransportError};
pub use listener::Listener;
pub use stats::ConnStats;
pub use sync::{OpGuard, OpLock};
pub use transport::Transport;
