//! RPC client.
//!
//! Every call opens its own connection, writes one invocation and reads one
//! result. The exchange runs on a spawned task so the caller's cancellation
//! token can be watched while the read is in flight. Cancelling the token
//! never abandons the call: it sends the cancellation byte and keeps waiting
//! for the server's answer.

use super::codec::{Codec, JsonCodec};
use super::invocation::{Invocation, InvocationEnvelope};
use super::protocol::{read_frame, write_cancel, write_frame};
use super::result::RpcResult;
use crate::cancel::CancellationToken;
use crate::transport::ConnectionFactory;
use crate::{Result, RpcError};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

/// Client for calling invocations on a remote [`RpcServer`](super::RpcServer).
#[derive(Clone)]
pub struct RpcClient {
    factory: Arc<dyn ConnectionFactory>,
    codec: Arc<dyn Codec>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("codec", &self.codec.name())
            .finish_non_exhaustive()
    }
}

impl RpcClient {
    pub fn new(factory: impl ConnectionFactory + 'static) -> Self {
        Self {
            factory: Arc::new(factory),
            codec: Arc::new(JsonCodec),
        }
    }

    /// Use `codec` instead of JSON. The server must use the same codec.
    pub fn with_codec(mut self, codec: impl Codec) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    /// Call without a way to cancel.
    pub async fn call<I: Invocation>(&self, invocation: &I) -> Result<I::Output> {
        self.call_cancellable(invocation, &CancellationToken::new())
            .await
    }

    /// Call, forwarding cancellation of `cancel` to the server.
    ///
    /// A failure inside the invocation comes back as [`RpcError::Remote`].
    pub async fn call_cancellable<I: Invocation>(
        &self,
        invocation: &I,
        cancel: &CancellationToken,
    ) -> Result<I::Output> {
        self.call_for_result(invocation, cancel)
            .await?
            .into_outcome()
            .map_err(RpcError::Remote)
    }

    /// Call and return the full result, interruption metadata included.
    ///
    /// If `cancel` fires during the call it is still cancelled on return,
    /// whatever the outcome.
    pub async fn call_for_result<I: Invocation>(
        &self,
        invocation: &I,
        cancel: &CancellationToken,
    ) -> Result<RpcResult<I::Output>> {
        let call_id = Uuid::new_v4();
        let envelope = InvocationEnvelope::for_invocation(invocation)?;
        let request = self.codec.encode_invocation(&envelope)?;
        debug!(%call_id, "Calling '{}'", I::METHOD);

        let remote_cancel = CancellationToken::new();
        let (result_tx, mut result_rx) = oneshot::channel();
        let mut worker = tokio::spawn(run_call(
            Call {
                id: call_id,
                method: I::METHOD,
                factory: self.factory.clone(),
                codec: self.codec.clone(),
                request,
                remote_cancel: remote_cancel.clone(),
            },
            result_tx,
        ));
        let mut guard = CancelOnDrop::new(remote_cancel.clone());

        let mut interrupted = false;
        loop {
            tokio::select! {
                joined = &mut worker => {
                    if let Err(e) = joined {
                        warn!(%call_id, "Call worker for '{}' failed: {}", I::METHOD, e);
                    }
                    break;
                }
                _ = cancel.cancelled(), if !interrupted => {
                    interrupted = true;
                    remote_cancel.cancel();
                }
            }
        }
        guard.disarm();

        // The worker is done; the slot is either filled or its sender is gone.
        let outcome = loop {
            tokio::select! {
                biased;
                received = &mut result_rx => break received,
                _ = cancel.cancelled(), if !interrupted => interrupted = true,
            }
        };

        if interrupted {
            cancel.cancel();
        }

        let result = outcome
            .map_err(|_| RpcError::communication("call worker exited without a result"))??;
        debug!(
            %call_id,
            "'{}' returned: success={} interrupted={} interrupt_requested={}",
            I::METHOD,
            result.is_success(),
            result.is_interrupted(),
            result.interrupt_was_requested()
        );
        Ok(result.try_map(serde_json::from_value::<I::Output>)?)
    }
}

/// Everything the spawned worker needs to run one exchange.
struct Call {
    id: Uuid,
    method: &'static str,
    factory: Arc<dyn ConnectionFactory>,
    codec: Arc<dyn Codec>,
    request: Vec<u8>,
    remote_cancel: CancellationToken,
}

async fn run_call(call: Call, result_tx: oneshot::Sender<Result<RpcResult>>) {
    let outcome = exchange(&call).await;
    if let Err(e) = &outcome {
        debug!(call_id = %call.id, "'{}' failed: {}", call.method, e);
    }
    let _ = result_tx.send(outcome);
}

async fn exchange(call: &Call) -> Result<RpcResult> {
    let connection = call.factory.connect().await.map_err(|e| {
        RpcError::communication_with(format!("failed to connect for '{}'", call.method), e)
    })?;
    let (mut reader, mut writer) = tokio::io::split(connection);
    write_frame(&mut writer, &call.request).await?;

    let codec = call.codec.clone();
    let mut reader_task = tokio::spawn(async move {
        let frame = read_frame(&mut reader)
            .await?
            .ok_or_else(|| RpcError::communication("connection closed before a result arrived"))?;
        codec.decode_result(&frame)
    });

    let mut cancel_sent = false;
    loop {
        tokio::select! {
            read = &mut reader_task => {
                return read
                    .map_err(|e| RpcError::communication_with("result reader task failed", e))?;
            }
            _ = call.remote_cancel.cancelled(), if !cancel_sent => {
                cancel_sent = true;
                debug!(call_id = %call.id, "Requesting cancellation of '{}'", call.method);
                // A dead connection shows up on the read side.
                if let Err(e) = write_cancel(&mut writer).await {
                    debug!(call_id = %call.id, "Cancellation byte not delivered: {}", e);
                }
            }
        }
    }
}

/// Requests remote cancellation if the call future is dropped mid-call.
struct CancelOnDrop {
    token: Option<CancellationToken>,
}

impl CancelOnDrop {
    fn new(token: CancellationToken) -> Self {
        Self { token: Some(token) }
    }

    fn disarm(&mut self) {
        self.token = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
    }
}
