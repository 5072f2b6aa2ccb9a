//! Invocations: the units of work a caller ships to the server.
//!
//! An invocation is a plain serde value plus an implementation of
//! [`Invocation`]. On the wire it travels as an [`InvocationEnvelope`]
//! naming its method, and the server's [`InvocationRegistry`] turns the
//! envelope back into the typed value before running it.
//!
//! # Example
//!
//! ```
//! use interrupt_rpc::{ApplicationError, CancellationToken, Invocation};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct AddToBase {
//!     number: i64,
//! }
//!
//! #[async_trait::async_trait]
//! impl Invocation for AddToBase {
//!     const METHOD: &'static str = "add_to_base";
//!     type Context = i64;
//!     type Output = i64;
//!
//!     async fn execute(
//!         &self,
//!         base: &i64,
//!         _cancel: &CancellationToken,
//!     ) -> Result<i64, ApplicationError> {
//!         Ok(base + self.number)
//!     }
//! }
//! ```

use crate::cancel::CancellationToken;
use crate::config::ProtocolConfig;
use crate::error::ApplicationError;
use crate::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::warn;

/// A unit of remote work.
///
/// `execute` runs on the server against the shared context. It should watch
/// `cancel` and unwind early once it fires: the dispatcher cancels it when
/// the caller asks, and when the caller disappears.
#[async_trait::async_trait]
pub trait Invocation: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Identifier the server dispatches on. Must be unique per registry.
    const METHOD: &'static str;

    /// Server-side state every invocation of this registry runs against.
    type Context: Send + Sync + 'static;

    /// Value returned to the caller.
    type Output: Serialize + DeserializeOwned + Send + 'static;

    async fn execute(
        &self,
        context: &Self::Context,
        cancel: &CancellationToken,
    ) -> std::result::Result<Self::Output, ApplicationError>;

    /// Called when the connection is severed before `execute` completed.
    ///
    /// On return the worker must have terminated; a worker still alive is
    /// reported as a stop-hook violation. The default interrupts the worker
    /// and waits up to `ProtocolConfig::STOP_GRACE_PERIOD`.
    async fn stop(&self, worker: &WorkerHandle) {
        worker.stop(ProtocolConfig::STOP_GRACE_PERIOD).await;
    }
}

/// Wire form of an invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationEnvelope {
    pub method: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl InvocationEnvelope {
    pub fn new(method: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            method: method.into(),
            payload,
        }
    }

    /// Wrap a typed invocation.
    pub fn for_invocation<I: Invocation>(invocation: &I) -> Result<Self> {
        Ok(Self::new(I::METHOD, serde_json::to_value(invocation)?))
    }
}

/// Server-side view of a running worker, handed to [`Invocation::stop`].
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    cancel: CancellationToken,
    finished: watch::Receiver<bool>,
}

impl WorkerHandle {
    pub(crate) fn new(cancel: CancellationToken, finished: watch::Receiver<bool>) -> Self {
        Self { cancel, finished }
    }

    /// Cancel the worker's token.
    pub fn interrupt(&self) {
        self.cancel.cancel();
    }

    pub fn is_interrupted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// True until the invocation's `execute` future has completed.
    pub fn is_alive(&self) -> bool {
        // A dropped sender means the worker task is gone.
        !*self.finished.borrow() && self.finished.has_changed().is_ok()
    }

    /// Wait for the worker to finish.
    pub async fn join(&self) {
        let mut finished = self.finished.clone();
        let _ = finished.wait_for(|done| *done).await;
    }

    /// Wait up to `timeout`; returns whether the worker finished.
    pub async fn join_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.join()).await.is_ok()
    }

    /// Interrupt, then wait up to `grace`. Returns whether the worker finished.
    pub async fn stop(&self, grace: Duration) -> bool {
        self.interrupt();
        self.join_timeout(grace).await
    }
}

/// Type-erased invocation held by the dispatcher.
#[async_trait::async_trait]
pub(crate) trait ErasedInvocation<C: Send + Sync + 'static>: Send + Sync {
    fn method(&self) -> &'static str;

    async fn execute(
        &self,
        context: &C,
        cancel: &CancellationToken,
    ) -> std::result::Result<serde_json::Value, ApplicationError>;

    async fn stop(&self, worker: &WorkerHandle);
}

struct Typed<I>(I);

#[async_trait::async_trait]
impl<I: Invocation> ErasedInvocation<I::Context> for Typed<I> {
    fn method(&self) -> &'static str {
        I::METHOD
    }

    async fn execute(
        &self,
        context: &I::Context,
        cancel: &CancellationToken,
    ) -> std::result::Result<serde_json::Value, ApplicationError> {
        let output = self.0.execute(context, cancel).await?;
        serde_json::to_value(output)
            .map_err(|e| ApplicationError::from_error(ApplicationError::KIND_SERIALIZATION, &e))
    }

    async fn stop(&self, worker: &WorkerHandle) {
        self.0.stop(worker).await;
    }
}

type Decoder<C> = Box<
    dyn Fn(serde_json::Value) -> serde_json::Result<Arc<dyn ErasedInvocation<C>>> + Send + Sync,
>;

/// Outcome of looking up an envelope in the registry.
pub(crate) enum Resolved<C: Send + Sync + 'static> {
    Ready(Arc<dyn ErasedInvocation<C>>),
    UnknownMethod(String),
    Malformed {
        method: String,
        error: serde_json::Error,
    },
}

/// Method table of the invocations a server accepts.
pub struct InvocationRegistry<C: Send + Sync + 'static> {
    decoders: HashMap<&'static str, Decoder<C>>,
}

impl<C: Send + Sync + 'static> Default for InvocationRegistry<C> {
    fn default() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }
}

impl<C: Send + Sync + 'static> std::fmt::Debug for InvocationRegistry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationRegistry")
            .field("methods", &self.decoders.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<C: Send + Sync + 'static> InvocationRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept invocations of type `I`.
    pub fn register<I: Invocation<Context = C>>(mut self) -> Self {
        let decoder: Decoder<C> = Box::new(|payload| {
            let invocation: I = serde_json::from_value(payload)?;
            Ok(Arc::new(Typed(invocation)) as Arc<dyn ErasedInvocation<C>>)
        });
        if self.decoders.insert(I::METHOD, decoder).is_some() {
            warn!("Invocation method '{}' registered twice; keeping the last", I::METHOD);
        }
        self
    }

    pub fn contains(&self, method: &str) -> bool {
        self.decoders.contains_key(method)
    }

    pub fn methods(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.decoders.keys().copied()
    }

    pub(crate) fn resolve(&self, envelope: InvocationEnvelope) -> Resolved<C> {
        let Some(decode) = self.decoders.get(envelope.method.as_str()) else {
            return Resolved::UnknownMethod(envelope.method);
        };
        match decode(envelope.payload) {
            Ok(invocation) => Resolved::Ready(invocation),
            Err(error) => Resolved::Malformed {
                method: envelope.method,
                error,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Double {
        n: i64,
    }

    #[async_trait::async_trait]
    impl Invocation for Double {
        const METHOD: &'static str = "double";
        type Context = ();
        type Output = i64;

        async fn execute(
            &self,
            _context: &(),
            _cancel: &CancellationToken,
        ) -> std::result::Result<i64, ApplicationError> {
            Ok(self.n * 2)
        }
    }

    #[test]
    fn test_envelope_carries_method_and_payload() {
        let envelope = InvocationEnvelope::for_invocation(&Double { n: 21 }).unwrap();
        assert_eq!(envelope.method, "double");
        assert_eq!(envelope.payload, serde_json::json!({"n": 21}));
    }

    #[tokio::test]
    async fn test_registry_resolves_and_executes() {
        let registry = InvocationRegistry::<()>::new().register::<Double>();
        assert!(registry.contains("double"));
        assert_eq!(registry.methods().collect::<Vec<_>>(), vec!["double"]);

        let envelope = InvocationEnvelope::for_invocation(&Double { n: 21 }).unwrap();
        let Resolved::Ready(invocation) = registry.resolve(envelope) else {
            panic!("double should resolve");
        };
        assert_eq!(invocation.method(), "double");

        let value = invocation
            .execute(&(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(value, serde_json::json!(42));
    }

    #[test]
    fn test_registry_unknown_and_malformed() {
        let registry = InvocationRegistry::<()>::new().register::<Double>();

        let unknown = InvocationEnvelope::new("triple", serde_json::json!({"n": 1}));
        assert!(matches!(
            registry.resolve(unknown),
            Resolved::UnknownMethod(method) if method == "triple"
        ));

        let malformed = InvocationEnvelope::new("double", serde_json::json!({"n": "one"}));
        assert!(matches!(
            registry.resolve(malformed),
            Resolved::Malformed { method, .. } if method == "double"
        ));
    }

    #[tokio::test]
    async fn test_worker_handle_lifecycle() {
        let cancel = CancellationToken::new();
        let (finished_tx, finished_rx) = watch::channel(false);
        let handle = WorkerHandle::new(cancel.clone(), finished_rx);

        assert!(handle.is_alive());
        assert!(!handle.join_timeout(Duration::from_millis(10)).await);

        let worker = tokio::spawn(async move {
            cancel.cancelled().await;
            finished_tx.send_replace(true);
        });

        assert!(handle.stop(Duration::from_secs(1)).await);
        assert!(handle.is_interrupted());
        assert!(!handle.is_alive());
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_handle_dropped_sender_is_not_alive() {
        let (finished_tx, finished_rx) = watch::channel(false);
        let handle = WorkerHandle::new(CancellationToken::new(), finished_rx);
        drop(finished_tx);
        assert!(!handle.is_alive());
        assert!(handle.join_timeout(Duration::from_millis(10)).await);
    }
}
