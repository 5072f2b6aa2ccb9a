//! Centralized configuration for interrupt-rpc.
//!
//! Protocol constants are fixed by the wire format and shared by both peers.
//! Server tuning lives in [`ServerConfig`].

use std::time::Duration;

/// Wire protocol constants.
pub struct ProtocolConfig;

impl ProtocolConfig {
    /// Byte a caller writes after its invocation to request cancellation.
    pub const CANCEL_BYTE: u8 = 100;

    /// How long the default stop hook waits for a worker to wind down after
    /// its connection is gone.
    pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(10);

    /// Largest frame payload either peer accepts.
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB

    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Buffer size of in-process duplex connections.
    pub const MEMORY_BUFFER_SIZE: usize = 64 * 1024;
}

/// Runtime configuration for an [`RpcServer`](crate::rpc::RpcServer).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Connections accepted beyond this count are dropped immediately.
    pub max_connections: usize,
    /// How long the accept loop waits for live handlers after it stops.
    pub drain_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 256,
            drain_timeout: ProtocolConfig::STOP_GRACE_PERIOD + Duration::from_secs(1),
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of concurrently served connections.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set how long shutdown waits for in-flight handlers.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }
}
