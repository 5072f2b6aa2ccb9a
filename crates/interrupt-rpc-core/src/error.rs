//! Error types for interrupt-rpc.
//!
//! Two families live here:
//!
//! - [`RpcError`]: what a caller or server observes locally. Transport and
//!   codec faults are always `Communication`; a failure reported by the
//!   peer's invocation is always `Remote`.
//! - [`ApplicationError`]: the serializable failure an invocation returns.
//!   It crosses the wire inside a `Failure` result and comes back out of
//!   `RpcError::Remote` unchanged.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Main error type for interrupt-rpc operations.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Transport or codec fault: connect failure, mid-stream I/O error,
    /// malformed frame, undecodable payload. Never wraps a remote error.
    #[error("Communication error: {message}")]
    Communication {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The remote invocation failed or was recorded as a failure.
    #[error("Remote invocation failed: {0}")]
    Remote(ApplicationError),

    /// A server-side worker outlived its connection after the stop hook ran.
    #[error("Worker for '{method}' still alive {elapsed:?} after its stop hook began")]
    StopHookViolation { method: String, elapsed: Duration },
}

/// Result type alias for interrupt-rpc operations.
pub type Result<T> = std::result::Result<T, RpcError>;

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Communication {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Communication {
            message: format!("codec failure: {}", err),
            source: Some(Box::new(err)),
        }
    }
}

impl RpcError {
    /// Create a communication error without an underlying source.
    pub fn communication(message: impl Into<String>) -> Self {
        RpcError::Communication {
            message: message.into(),
            source: None,
        }
    }

    /// Create a communication error with context wrapped around `source`.
    pub fn communication_with(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        RpcError::Communication {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// True for transport and codec faults.
    pub fn is_communication(&self) -> bool {
        matches!(self, RpcError::Communication { .. })
    }

    /// True when the peer's invocation reported the failure.
    pub fn is_remote(&self) -> bool {
        matches!(self, RpcError::Remote(_))
    }

    /// The application error carried by a `Remote` failure.
    pub fn as_remote(&self) -> Option<&ApplicationError> {
        match self {
            RpcError::Remote(err) => Some(err),
            _ => None,
        }
    }
}

/// Application-level failure returned by an invocation.
///
/// Serialized as data so the caller receives the same `kind`, `message`
/// and `data` the server-side invocation produced.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ApplicationError {
    /// Stable machine-readable category, e.g. `invalid_argument`.
    pub kind: String,
    /// Human-readable description.
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ApplicationError {
    pub const KIND_INTERRUPTED: &'static str = "interrupted";
    pub const KIND_PANIC: &'static str = "panic";
    pub const KIND_UNKNOWN_METHOD: &'static str = "unknown_method";
    pub const KIND_SERIALIZATION: &'static str = "serialization";

    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            data: None,
        }
    }

    /// Attach structured data to the error.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Failure produced by an invocation that unwound because it was cancelled.
    pub fn interrupted(message: impl Into<String>) -> Self {
        Self::new(Self::KIND_INTERRUPTED, message)
    }

    /// Capture any error as an application error of the given kind.
    ///
    /// The source chain is flattened into `data.causes`.
    pub fn from_error(kind: impl Into<String>, err: &(dyn std::error::Error + 'static)) -> Self {
        let mut causes = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            causes.push(serde_json::Value::String(cause.to_string()));
            source = cause.source();
        }

        let error = Self::new(kind, err.to_string());
        if causes.is_empty() {
            error
        } else {
            error.with_data(serde_json::json!({ "causes": causes }))
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.kind == Self::KIND_INTERRUPTED
    }
}
