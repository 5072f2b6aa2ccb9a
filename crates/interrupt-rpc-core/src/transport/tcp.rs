//! TCP transport.
//!
//! `TcpConnectionSource` binds a listener (use port 0 for an OS-assigned
//! port) and `TcpConnector` dials it, one socket per call.

use super::{source_closed, BoxConnection, ConnectionFactory, ConnectionSource};
use crate::cancel::CancellationToken;
use crate::config::ProtocolConfig;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;
use tracing::debug;

/// Opens a new TCP connection to a fixed address for every call.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: SocketAddr,
    connect_timeout: Duration,
}

impl TcpConnector {
    /// Uses `ProtocolConfig::CONNECT_TIMEOUT`.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: ProtocolConfig::CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait::async_trait]
impl ConnectionFactory for TcpConnector {
    async fn connect(&self) -> io::Result<BoxConnection> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!(
                        "connect to {} timed out after {:?}",
                        self.addr, self.connect_timeout
                    ),
                )
            })??;
        stream.set_nodelay(true)?;

        debug!("TCP connection opened to {}", self.addr);
        Ok(Box::new(stream))
    }
}

/// Accepts TCP connections until closed.
///
/// Closing releases the listener, so later connects are refused instead of
/// queueing in the kernel backlog.
#[derive(Debug)]
pub struct TcpConnectionSource {
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    closed: CancellationToken,
}

impl TcpConnectionSource {
    /// Bind a listener on `addr`.
    pub async fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener: Mutex::new(Some(listener)),
            local_addr,
            closed: CancellationToken::new(),
        })
    }

    /// Address the listener is bound to (useful when port=0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A connector dialing this source.
    pub fn connector(&self) -> TcpConnector {
        TcpConnector::new(self.local_addr)
    }
}

#[async_trait::async_trait]
impl ConnectionSource for TcpConnectionSource {
    async fn accept(&self) -> io::Result<BoxConnection> {
        let mut slot = self.listener.lock().await;
        let Some(listener) = slot.as_ref() else {
            return Err(source_closed());
        };

        let accepted = tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            accepted = listener.accept() => Some(accepted),
        };
        let Some(accepted) = accepted else {
            // close() could not take the listener while we held it.
            slot.take();
            debug!("TCP listener on {} released", self.local_addr);
            return Err(source_closed());
        };

        let (stream, peer_addr) = accepted?;
        stream.set_nodelay(true)?;
        debug!("TCP connection from {}", peer_addr);
        Ok(Box::new(stream))
    }

    fn close(&self) {
        self.closed.cancel();
        if let Ok(mut slot) = self.listener.try_lock() {
            if slot.take().is_some() {
                debug!("TCP listener on {} released", self.local_addr);
            }
        }
    }
}
