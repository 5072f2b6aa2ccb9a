//! Per-connection server protocol.
//!
//! Each accepted connection runs:
//!
//! ```text
//! AWAIT_INVOCATION -> RUNNING -> PACKAGING -> REPLYING -> DONE
//!                     (+ WATCHING)
//! ```
//!
//! While the worker runs, a watcher reads the same connection. A
//! cancellation byte cancels the worker's token; end-of-stream (or server
//! shutdown) runs the invocation's `stop` hook and escalates a worker that
//! survives it.
//!
//! # Interruption bookkeeping
//!
//! The watcher records `interrupt_was_requested` and cancels the worker
//! while holding `InterruptState`'s mutex. Packaging samples the token and
//! the flag under the same mutex, so a result never reports a request
//! without the matching token state or the other way round.

use super::codec::Codec;
use super::hooks::ServerHooks;
use super::invocation::{ErasedInvocation, InvocationRegistry, Resolved, WorkerHandle};
use super::protocol::{read_frame, read_signal, write_frame, ConnectionSignal};
use super::result::RpcResult;
use super::server::Lifecycle;
use crate::cancel::CancellationToken;
use crate::error::ApplicationError;
use crate::transport::BoxConnection;
use crate::{Result, RpcError};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncWrite, ReadHalf};
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct InterruptState {
    requested: bool,
}

/// How the watcher retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchOutcome {
    WorkerFinished,
    CancelRequested,
    Stopped,
}

pub(crate) struct Dispatcher<C: Send + Sync + 'static> {
    context: Arc<C>,
    registry: InvocationRegistry<C>,
    codec: Arc<dyn Codec>,
    hooks: ServerHooks,
    lifecycle: Arc<Lifecycle>,
}

impl<C: Send + Sync + 'static> Dispatcher<C> {
    pub(crate) fn new(
        context: Arc<C>,
        registry: InvocationRegistry<C>,
        codec: Arc<dyn Codec>,
        hooks: ServerHooks,
        lifecycle: Arc<Lifecycle>,
    ) -> Self {
        Self {
            context,
            registry,
            codec,
            hooks,
            lifecycle,
        }
    }

    /// Serve one connection to completion. The connection is closed on return.
    pub(crate) async fn serve(self: Arc<Self>, connection: BoxConnection) -> Result<()> {
        let (mut reader, mut writer) = tokio::io::split(connection);

        let frame = tokio::select! {
            frame = read_frame(&mut reader) => frame,
            _ = self.lifecycle.shutdown.cancelled() => {
                Err(RpcError::communication("server closed before an invocation arrived"))
            }
        };
        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                return self.communication_fault(RpcError::communication(
                    "connection closed before an invocation arrived",
                ))
            }
            Err(e) => return self.communication_fault(e),
        };
        let envelope = match self.codec.decode_invocation(&frame) {
            Ok(envelope) => envelope,
            Err(e) => return self.communication_fault(e),
        };

        let invocation = match self.registry.resolve(envelope) {
            Resolved::Ready(invocation) => invocation,
            Resolved::UnknownMethod(method) => {
                warn!("Rejecting call to unregistered method '{}'", method);
                let error = ApplicationError::new(
                    ApplicationError::KIND_UNKNOWN_METHOD,
                    format!("no invocation registered for '{}'", method),
                );
                return self
                    .reply(&mut writer, &RpcResult::from_outcome(Err(error), false, false))
                    .await;
            }
            Resolved::Malformed { method, error } => {
                return self.communication_fault(RpcError::communication_with(
                    format!("malformed payload for '{}'", method),
                    error,
                ))
            }
        };
        let method = invocation.method();
        debug!("Dispatching '{}'", method);

        // RUNNING
        let token = CancellationToken::new();
        let (finished_tx, finished_rx) = watch::channel(false);
        let handle = WorkerHandle::new(token.clone(), finished_rx);
        let interruption = Arc::new(Mutex::new(InterruptState::default()));

        let mut worker = tokio::spawn(run_worker(
            invocation.clone(),
            self.context.clone(),
            token.clone(),
            finished_tx,
        ));
        let mut watcher = tokio::spawn(self.clone().watch(
            reader,
            invocation,
            handle,
            interruption.clone(),
        ));

        let mut watching = true;
        let joined = loop {
            tokio::select! {
                joined = &mut worker => break joined,
                watched = &mut watcher, if watching => {
                    watching = false;
                    match flatten_watch(watched) {
                        Ok(outcome) => debug!("Watcher for '{}' retired: {:?}", method, outcome),
                        Err(e) => {
                            // The worker ignored its stop hook; nobody is left to reply to.
                            worker.abort();
                            return Err(e);
                        }
                    }
                }
            }
        };

        // PACKAGING
        let outcome = joined.unwrap_or_else(|e| {
            Err(ApplicationError::new(
                ApplicationError::KIND_PANIC,
                format!("worker task failed: {}", e),
            ))
        });
        let result = {
            let state = interruption.lock().await;
            RpcResult::from_outcome(outcome, token.is_cancelled(), state.requested)
        };
        debug!(
            "'{}' finished: success={} interrupted={} interrupt_requested={}",
            method,
            result.is_success(),
            result.is_interrupted(),
            result.interrupt_was_requested()
        );

        // REPLYING
        let replied = self.reply(&mut writer, &result).await;

        // DONE
        if watching {
            match flatten_watch(watcher.await) {
                Ok(outcome) => debug!("Watcher for '{}' retired: {:?}", method, outcome),
                Err(e) => warn!("Watcher for '{}' failed after completion: {}", method, e),
            }
        }
        replied
    }

    async fn watch(
        self: Arc<Self>,
        mut reader: ReadHalf<BoxConnection>,
        invocation: Arc<dyn ErasedInvocation<C>>,
        worker: WorkerHandle,
        interruption: Arc<Mutex<InterruptState>>,
    ) -> Result<WatchOutcome> {
        let method = invocation.method();
        let signal = tokio::select! {
            biased;
            _ = worker.join() => return Ok(WatchOutcome::WorkerFinished),
            signal = read_signal(&mut reader) => signal,
            _ = self.lifecycle.shutdown.cancelled() => {
                debug!("Server closing; stopping '{}'", method);
                Ok(ConnectionSignal::Closed)
            }
        };

        match signal {
            Ok(ConnectionSignal::Cancel) => {
                let mut state = interruption.lock().await;
                state.requested = true;
                worker.interrupt();
                debug!("Caller requested cancellation of '{}'", method);
                return Ok(WatchOutcome::CancelRequested);
            }
            Ok(ConnectionSignal::Unexpected(byte)) => {
                let fault = RpcError::communication(format!(
                    "unexpected byte {:#04x} after '{}' invocation",
                    byte, method
                ));
                if let Err(e) = self.communication_fault(fault) {
                    warn!("{}", e);
                }
            }
            Ok(ConnectionSignal::Closed) => debug!("Caller of '{}' disconnected", method),
            Err(e) => debug!("Connection for '{}' failed: {}", method, e),
        }

        // Caller is gone without asking politely: the worker must terminate.
        let started = Instant::now();
        invocation.stop(&worker).await;
        if worker.is_alive() {
            let violation = RpcError::StopHookViolation {
                method: method.to_string(),
                elapsed: started.elapsed(),
            };
            (self.hooks.on_stop_violation)(&violation);
            return Err(violation);
        }
        Ok(WatchOutcome::Stopped)
    }

    async fn reply<W: AsyncWrite + Unpin>(&self, writer: &mut W, result: &RpcResult) -> Result<()> {
        let encoded = match self.codec.encode_result(result) {
            Ok(encoded) => encoded,
            Err(e) => return self.communication_fault(e),
        };
        if let Err(e) = write_frame(writer, &encoded).await {
            return self.communication_fault(e);
        }
        Ok(())
    }

    fn communication_fault(&self, cause: RpcError) -> Result<()> {
        (self.hooks.on_communication_fault)(self.lifecycle.was_closed_locally(), cause)
    }
}

async fn run_worker<C: Send + Sync + 'static>(
    invocation: Arc<dyn ErasedInvocation<C>>,
    context: Arc<C>,
    token: CancellationToken,
    finished: watch::Sender<bool>,
) -> std::result::Result<serde_json::Value, ApplicationError> {
    let outcome = AssertUnwindSafe(invocation.execute(&context, &token))
        .catch_unwind()
        .await;
    finished.send_replace(true);

    outcome.unwrap_or_else(|panic| {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "invocation panicked".to_string());
        Err(ApplicationError::new(ApplicationError::KIND_PANIC, message))
    })
}

fn flatten_watch(
    watched: std::result::Result<Result<WatchOutcome>, tokio::task::JoinError>,
) -> Result<WatchOutcome> {
    watched.map_err(|e| RpcError::communication_with("watcher task failed", e))?
}
