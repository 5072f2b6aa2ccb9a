//! Duplex byte-stream transports.
//!
//! A call needs nothing from its transport beyond an ordered, reliable byte
//! stream with independent read and write halves. Dropping both halves of a
//! connection closes it and unblocks the peer.
//!
//! - [`tcp`]: `TcpConnector` / `TcpConnectionSource` over tokio sockets
//! - [`memory`]: in-process pairs over `tokio::io::duplex`

pub mod memory;
pub mod tcp;

pub use memory::{MemoryConnectionSource, MemoryConnector};
pub use tcp::{TcpConnectionSource, TcpConnector};

use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// A bidirectional byte stream carrying exactly one call.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased connection handed between transports and the protocol.
pub type BoxConnection = Box<dyn Connection>;

/// Client side: opens one fresh connection per call.
#[async_trait::async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self) -> std::io::Result<BoxConnection>;
}

/// Server side: yields accepted connections until closed.
#[async_trait::async_trait]
pub trait ConnectionSource: Send + Sync {
    /// Wait for the next connection.
    ///
    /// Fails once the source is closed, or when the underlying listener
    /// breaks.
    async fn accept(&self) -> std::io::Result<BoxConnection>;

    /// Stop accepting. Idempotent; a pending `accept` fails promptly.
    fn close(&self);
}

#[async_trait::async_trait]
impl<F: ConnectionFactory + ?Sized> ConnectionFactory for Arc<F> {
    async fn connect(&self) -> std::io::Result<BoxConnection> {
        (**self).connect().await
    }
}

/// Error returned by `accept` on a closed source.
pub(crate) fn source_closed() -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::ConnectionAborted,
        "connection source closed",
    )
}
