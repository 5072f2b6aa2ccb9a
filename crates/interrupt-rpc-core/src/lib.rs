//! interrupt-rpc - remote invocations whose cancellation crosses the wire.
//!
//! A caller ships a serializable [`Invocation`] to an [`RpcServer`], which
//! runs it against a shared context and sends back an [`RpcResult`].
//! Cancelling the caller's [`CancellationToken`] asks the server to cancel
//! the running invocation; dropping the connection forces it to stop.
//!
//! # Example
//!
//! ```rust,ignore
//! use interrupt_rpc::transport::memory;
//! use interrupt_rpc::{InvocationRegistry, RpcClient, RpcServer};
//!
//! #[tokio::main]
//! async fn main() -> interrupt_rpc::Result<()> {
//!     let (connector, source) = memory::channel();
//!     let registry = InvocationRegistry::new().register::<AddToBase>();
//!     let server = RpcServer::start(source, 5_i64, registry);
//!
//!     let client = RpcClient::new(connector);
//!     assert_eq!(client.call(&AddToBase { number: 79 }).await?, 84);
//!
//!     server.close().await
//! }
//! ```

pub mod cancel;
pub mod config;
pub mod error;
pub mod rpc;
pub mod transport;

// Re-export commonly used types
pub use cancel::{CancellationToken, CancelledError};
pub use config::{ProtocolConfig, ServerConfig};
pub use error::{ApplicationError, Result, RpcError};
pub use rpc::{
    Codec, Invocation, InvocationEnvelope, InvocationRegistry, JsonCodec, RpcClient, RpcResult,
    RpcServer, RpcServerBuilder, ServerHooks, WorkerHandle,
};
pub use transport::{
    BoxConnection, ConnectionFactory, ConnectionSource, MemoryConnectionSource, MemoryConnector,
    TcpConnectionSource, TcpConnector,
};
