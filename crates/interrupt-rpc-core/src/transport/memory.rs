//! In-process transport over `tokio::io::duplex`.
//!
//! `channel()` returns a connector/source pair. Each `connect` creates a
//! fresh duplex pipe and hands the far end to the source. Once every
//! connector is dropped, `accept` fails: that is the source breaking
//! underneath a server rather than being closed by it.

use super::{source_closed, BoxConnection, ConnectionFactory, ConnectionSource};
use crate::cancel::CancellationToken;
use crate::config::ProtocolConfig;
use std::io;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Mutex};

/// Create a connected connector/source pair.
pub fn channel() -> (MemoryConnector, MemoryConnectionSource) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        MemoryConnector {
            tx,
            buffer_size: ProtocolConfig::MEMORY_BUFFER_SIZE,
        },
        MemoryConnectionSource {
            rx: Mutex::new(rx),
            closed: CancellationToken::new(),
        },
    )
}

/// Client half of an in-process transport.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    tx: mpsc::UnboundedSender<DuplexStream>,
    buffer_size: usize,
}

impl MemoryConnector {
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }
}

#[async_trait::async_trait]
impl ConnectionFactory for MemoryConnector {
    async fn connect(&self) -> io::Result<BoxConnection> {
        let (local, remote) = tokio::io::duplex(self.buffer_size);
        self.tx.send(remote).map_err(|_| {
            io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "memory connection source is gone",
            )
        })?;
        Ok(Box::new(local))
    }
}

/// Server half of an in-process transport.
#[derive(Debug)]
pub struct MemoryConnectionSource {
    rx: Mutex<mpsc::UnboundedReceiver<DuplexStream>>,
    closed: CancellationToken,
}

#[async_trait::async_trait]
impl ConnectionSource for MemoryConnectionSource {
    async fn accept(&self) -> io::Result<BoxConnection> {
        let next = tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            stream = async { self.rx.lock().await.recv().await } => Some(stream),
        };

        match next {
            Some(Some(stream)) => Ok(Box::new(stream)),
            Some(None) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "all memory connectors dropped",
            )),
            None => {
                // Refuse further connects; queued ones are dropped with the source.
                self.rx.lock().await.close();
                Err(source_closed())
            }
        }
    }

    fn close(&self) {
        self.closed.cancel();
    }
}
