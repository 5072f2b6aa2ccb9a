//! RPC server: accept loop plus one dispatcher task per connection.
//!
//! The server is bound to one context and one [`ConnectionSource`]. It starts
//! accepting at construction and keeps going until closed, either by
//! [`RpcServer::close`] or by the source failing underneath it.
//!
//! # Shutdown
//!
//! `close()` records that the shutdown was initiated locally, closes the
//! source so the pending `accept` fails, and waits for the accept loop. The
//! loop then tells every live handler to take the disconnection path, waits
//! up to `ServerConfig::drain_timeout` for them, and reports through
//! `ServerHooks::on_shutdown`.

use super::codec::{Codec, JsonCodec};
use super::dispatch::Dispatcher;
use super::hooks::ServerHooks;
use super::invocation::InvocationRegistry;
use crate::cancel::CancellationToken;
use crate::config::ServerConfig;
use crate::transport::ConnectionSource;
use crate::{Result, RpcError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Shutdown state shared by the server handle, accept loop and handlers.
#[derive(Debug, Default)]
pub(crate) struct Lifecycle {
    closed_locally: AtomicBool,
    /// Cancelled once the accept loop stops; handlers treat it as disconnection.
    pub(crate) shutdown: CancellationToken,
}

impl Lifecycle {
    /// Returns true for the first caller only.
    fn record_local_close(&self) -> bool {
        !self.closed_locally.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn was_closed_locally(&self) -> bool {
        self.closed_locally.load(Ordering::SeqCst)
    }
}

/// Handle to a running server. Dropping closes the server without waiting.
pub struct RpcServer {
    lifecycle: Arc<Lifecycle>,
    source: Arc<dyn ConnectionSource>,
    accept_task: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("lifecycle", &self.lifecycle)
            .finish_non_exhaustive()
    }
}

/// Configures and starts an [`RpcServer`].
pub struct RpcServerBuilder<C: Send + Sync + 'static> {
    context: Arc<C>,
    registry: InvocationRegistry<C>,
    codec: Arc<dyn Codec>,
    hooks: ServerHooks,
    config: ServerConfig,
}

impl<C: Send + Sync + 'static> RpcServerBuilder<C> {
    pub fn codec(mut self, codec: impl Codec) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    pub fn hooks(mut self, hooks: ServerHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Start accepting on `source`. Must be called within a tokio runtime.
    pub fn start(self, source: impl ConnectionSource + 'static) -> RpcServer {
        let source: Arc<dyn ConnectionSource> = Arc::new(source);
        let lifecycle = Arc::new(Lifecycle::default());
        info!(
            "RPC server started ({} codec, max {} connections)",
            self.codec.name(),
            self.config.max_connections
        );
        let dispatcher = Arc::new(Dispatcher::new(
            self.context,
            self.registry,
            self.codec,
            self.hooks.clone(),
            lifecycle.clone(),
        ));

        let accept_task = tokio::spawn(accept_loop(
            source.clone(),
            dispatcher,
            self.hooks,
            self.config,
            lifecycle.clone(),
        ));

        RpcServer {
            lifecycle,
            source,
            accept_task: Mutex::new(Some(accept_task)),
        }
    }
}

impl RpcServer {
    /// Configure a server for `context` serving the invocations in `registry`.
    pub fn builder<C: Send + Sync + 'static>(
        context: impl Into<Arc<C>>,
        registry: InvocationRegistry<C>,
    ) -> RpcServerBuilder<C> {
        RpcServerBuilder {
            context: context.into(),
            registry,
            codec: Arc::new(JsonCodec),
            hooks: ServerHooks::default(),
            config: ServerConfig::default(),
        }
    }

    /// Start a server with the default codec, hooks and config.
    pub fn start<C: Send + Sync + 'static>(
        source: impl ConnectionSource + 'static,
        context: impl Into<Arc<C>>,
        registry: InvocationRegistry<C>,
    ) -> Self {
        Self::builder(context, registry).start(source)
    }

    /// Close the server and wait for the accept loop to exit.
    ///
    /// Idempotent. The first call to observe the accept loop's exit returns
    /// the `on_shutdown` hook's verdict; later calls return `Ok(())`.
    pub async fn close(&self) -> Result<()> {
        if self.lifecycle.record_local_close() {
            info!("Closing RPC server");
            self.source.close();
        }

        // Hold the lock while waiting so concurrent closers also wait.
        let mut accept_task = self.accept_task.lock().await;
        match accept_task.take() {
            Some(handle) => handle
                .await
                .map_err(|e| RpcError::communication_with("accept loop task failed", e))?,
            None => Ok(()),
        }
    }

    /// True once the server stopped accepting, for whatever reason.
    pub fn is_closed(&self) -> bool {
        self.lifecycle.was_closed_locally() || self.lifecycle.shutdown.is_cancelled()
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        if self.lifecycle.record_local_close() {
            self.source.close();
        }
    }
}

async fn accept_loop<C: Send + Sync + 'static>(
    source: Arc<dyn ConnectionSource>,
    dispatcher: Arc<Dispatcher<C>>,
    hooks: ServerHooks,
    config: ServerConfig,
    lifecycle: Arc<Lifecycle>,
) -> Result<()> {
    let mut handlers = JoinSet::new();

    let cause = loop {
        tokio::select! {
            accepted = source.accept() => match accepted {
                Ok(connection) => {
                    while let Some(finished) = handlers.try_join_next() {
                        log_handler_exit(finished);
                    }
                    if handlers.len() >= config.max_connections {
                        warn!(
                            "Rejecting connection: at max capacity ({})",
                            config.max_connections
                        );
                        drop(connection);
                        continue;
                    }
                    handlers.spawn(dispatcher.clone().serve(connection));
                }
                Err(e) => break e,
            },
            Some(finished) = handlers.join_next() => log_handler_exit(finished),
        }
    };

    let was_closed_locally = lifecycle.was_closed_locally();
    source.close();
    lifecycle.shutdown.cancel();

    if !handlers.is_empty() {
        debug!("Draining {} live connection handlers", handlers.len());
        let drained = tokio::time::timeout(config.drain_timeout, async {
            while let Some(finished) = handlers.join_next().await {
                log_handler_exit(finished);
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                "Aborting {} connection handlers still running after {:?}",
                handlers.len(),
                config.drain_timeout
            );
            handlers.abort_all();
        }
    }

    let cause = RpcError::communication_with("connection source stopped accepting", cause);
    if was_closed_locally {
        info!("RPC server closed");
    } else {
        error!("RPC server stopped unexpectedly: {}", cause);
    }
    (hooks.on_shutdown)(was_closed_locally, cause)
}

fn log_handler_exit(finished: std::result::Result<Result<()>, JoinError>) {
    match finished {
        Ok(Ok(())) => {}
        Ok(Err(e @ RpcError::StopHookViolation { .. })) => {
            error!("Connection handler gave up: {}", e)
        }
        Ok(Err(e)) => warn!("Connection handler ended with error: {}", e),
        Err(e) if e.is_cancelled() => debug!("Connection handler aborted"),
        Err(e) => error!("Connection handler panicked: {}", e),
    }
}
