//! One-call-per-connection RPC with cooperative cancellation.
//!
//! Transports are pluggable byte streams (see [`crate::transport`]); this
//! module owns everything that runs on top of them.
//!
//! # Architecture
//!
//! - **Client**: encodes an invocation, opens a connection, writes it, and
//!   forwards local cancellation as a single sentinel byte
//! - **Server**: accept loop spawning one dispatcher per connection
//! - **Dispatcher**: runs the invocation while watching the connection for
//!   the sentinel byte or end-of-stream
//! - **Protocol**: framing shared by both sides

pub mod client;
pub mod codec;
mod dispatch;
pub mod hooks;
pub mod invocation;
pub mod protocol;
pub mod result;
pub mod server;

pub use client::RpcClient;
pub use codec::{Codec, JsonCodec};
pub use hooks::ServerHooks;
pub use invocation::{Invocation, InvocationEnvelope, InvocationRegistry, WorkerHandle};
pub use protocol::ConnectionSignal;
pub use result::RpcResult;
pub use server::{RpcServer, RpcServerBuilder};
