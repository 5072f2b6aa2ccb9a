//! End-to-end tests for RpcClient and RpcServer.
//!
//! Every test runs a real server on either the in-process transport or a
//! loopback TCP listener, with a `Calculator` context holding base `5`.

use interrupt_rpc::rpc::protocol::write_frame;
use interrupt_rpc::transport::memory;
use interrupt_rpc::{
    ApplicationError, CancellationToken, Codec, ConnectionFactory, Invocation,
    InvocationEnvelope, InvocationRegistry, JsonCodec, RpcClient, RpcResult, RpcServer,
    ServerConfig, ServerHooks, TcpConnectionSource,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Default)]
struct Calculator {
    base: i64,
    interrupted: AtomicUsize,
}

impl Calculator {
    fn new(base: i64) -> Self {
        Self {
            base,
            ..Default::default()
        }
    }
}

#[derive(Serialize, Deserialize)]
struct AddToBase {
    number: i64,
}

#[async_trait::async_trait]
impl Invocation for AddToBase {
    const METHOD: &'static str = "add_to_base";
    type Context = Calculator;
    type Output = i64;

    async fn execute(
        &self,
        calc: &Calculator,
        _cancel: &CancellationToken,
    ) -> Result<i64, ApplicationError> {
        Ok(calc.base + self.number)
    }
}

#[derive(Serialize, Deserialize)]
struct Reject {
    reason: String,
}

#[async_trait::async_trait]
impl Invocation for Reject {
    const METHOD: &'static str = "reject";
    type Context = Calculator;
    type Output = i64;

    async fn execute(
        &self,
        _calc: &Calculator,
        _cancel: &CancellationToken,
    ) -> Result<i64, ApplicationError> {
        Err(ApplicationError::new("rejected", self.reason.clone())
            .with_data(serde_json::json!({ "retryable": false })))
    }
}

#[derive(Serialize, Deserialize)]
struct Lookup;

#[async_trait::async_trait]
impl Invocation for Lookup {
    const METHOD: &'static str = "lookup";
    type Context = Calculator;
    type Output = Option<i64>;

    async fn execute(
        &self,
        _calc: &Calculator,
        _cancel: &CancellationToken,
    ) -> Result<Option<i64>, ApplicationError> {
        Ok(None)
    }
}

#[derive(Serialize, Deserialize)]
struct Explode;

#[async_trait::async_trait]
impl Invocation for Explode {
    const METHOD: &'static str = "explode";
    type Context = Calculator;
    type Output = ();

    async fn execute(
        &self,
        _calc: &Calculator,
        _cancel: &CancellationToken,
    ) -> Result<(), ApplicationError> {
        panic!("calculator on fire");
    }
}

#[derive(Serialize, Deserialize)]
struct Sleep {
    millis: u64,
}

#[async_trait::async_trait]
impl Invocation for Sleep {
    const METHOD: &'static str = "sleep";
    type Context = Calculator;
    type Output = ();

    async fn execute(
        &self,
        calc: &Calculator,
        cancel: &CancellationToken,
    ) -> Result<(), ApplicationError> {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(self.millis)) => Ok(()),
            _ = cancel.cancelled() => {
                calc.interrupted.fetch_add(1, Ordering::SeqCst);
                Err(ApplicationError::interrupted("sleep cut short"))
            }
        }
    }
}

fn registry() -> InvocationRegistry<Calculator> {
    InvocationRegistry::new()
        .register::<AddToBase>()
        .register::<Reject>()
        .register::<Lookup>()
        .register::<Explode>()
        .register::<Sleep>()
}

fn memory_server() -> (RpcServer, RpcClient, Arc<Calculator>) {
    let (connector, source) = memory::channel();
    let calc = Arc::new(Calculator::new(5));
    let server = RpcServer::start(source, calc.clone(), registry());
    (server, RpcClient::new(connector), calc)
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_add_to_base_over_memory() {
    let (server, client, _calc) = memory_server();

    assert_eq!(client.call(&AddToBase { number: 79 }).await.unwrap(), 84);

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_add_to_base_over_tcp() {
    let source = TcpConnectionSource::bind("127.0.0.1:0").await.unwrap();
    let client = RpcClient::new(source.connector());
    let server = RpcServer::start(source, Calculator::new(5), registry());

    assert_eq!(client.call(&AddToBase { number: 79 }).await.unwrap(), 84);

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_call_after_tcp_close_fails_fast() {
    let source = TcpConnectionSource::bind("127.0.0.1:0").await.unwrap();
    let client = RpcClient::new(source.connector());
    let server = RpcServer::start(source, Calculator::new(5), registry());
    assert_eq!(client.call(&AddToBase { number: 79 }).await.unwrap(), 84);

    server.close().await.unwrap();

    // The server handle stays alive; the listener must be gone regardless.
    let call = client.call(&AddToBase { number: 1 });
    let err = tokio::time::timeout(Duration::from_secs(3), call)
        .await
        .expect("call after close should not hang")
        .unwrap_err();
    assert!(err.is_communication());
    drop(server);
}

#[tokio::test]
async fn test_sequential_calls_fit_within_connection_cap() {
    let (connector, source) = memory::channel();
    let server = RpcServer::builder(Calculator::new(5), registry())
        .config(ServerConfig::new().with_max_connections(1))
        .start(source);
    let client = RpcClient::new(connector);

    for number in 0..50 {
        assert_eq!(client.call(&AddToBase { number }).await.unwrap(), 5 + number);
    }

    server.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_use_independent_connections() {
    let (server, client, _calc) = memory_server();

    let (a, b, c) = tokio::join!(
        client.call(&AddToBase { number: 79 }),
        client.call(&AddToBase { number: 90 }),
        client.call(&AddToBase { number: -5 }),
    );
    assert_eq!(a.unwrap(), 84);
    assert_eq!(b.unwrap(), 95);
    assert_eq!(c.unwrap(), 0);

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_remote_failure_keeps_error_intact() {
    let (server, client, _calc) = memory_server();

    let err = client
        .call(&Reject {
            reason: "odd numbers only".to_string(),
        })
        .await
        .unwrap_err();

    let remote = err.as_remote().expect("should be a remote failure");
    assert_eq!(remote.kind, "rejected");
    assert_eq!(remote.message, "odd numbers only");
    assert_eq!(remote.data, Some(serde_json::json!({ "retryable": false })));

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_absent_value_is_returned_as_is() {
    let (server, client, _calc) = memory_server();

    assert_eq!(client.call(&Lookup).await.unwrap(), None);

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_panicking_invocation_is_remote_failure() {
    let (server, client, _calc) = memory_server();

    let err = client.call(&Explode).await.unwrap_err();
    let remote = err.as_remote().expect("panic should come back as a failure");
    assert_eq!(remote.kind, ApplicationError::KIND_PANIC);
    assert!(remote.message.contains("calculator on fire"));

    // The server keeps serving.
    assert_eq!(client.call(&AddToBase { number: 1 }).await.unwrap(), 6);
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_unregistered_method_is_remote_failure() {
    let (connector, source) = memory::channel();
    let server = RpcServer::start(
        source,
        Calculator::new(5),
        InvocationRegistry::new().register::<AddToBase>(),
    );

    let err = RpcClient::new(connector).call(&Lookup).await.unwrap_err();
    assert_eq!(
        err.as_remote().map(|e| e.kind.as_str()),
        Some(ApplicationError::KIND_UNKNOWN_METHOD)
    );

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_pre_cancelled_call_still_completes() {
    let (server, client, _calc) = memory_server();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let value = client
        .call_cancellable(&AddToBase { number: 79 }, &cancel)
        .await
        .unwrap();

    assert_eq!(value, 84);
    assert!(cancel.is_cancelled());
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_cancel_mid_call_interrupts_remote_worker() {
    let (server, client, calc) = memory_server();

    let cancel = CancellationToken::new();
    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        })
    };

    let started = Instant::now();
    let result: RpcResult<()> = client
        .call_for_result(&Sleep { millis: 5_000 }, &cancel)
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(cancel.is_cancelled());
    assert!(result.interrupt_was_requested());
    assert!(result.is_interrupted());
    assert!(result.into_outcome().unwrap_err().is_interrupted());
    assert_eq!(calc.interrupted.load(Ordering::SeqCst), 1);

    canceller.await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_cancelled_call_surfaces_remote_interruption() {
    let (server, client, _calc) = memory_server();

    let cancel = CancellationToken::new();
    let call = client.call_cancellable(&Sleep { millis: 5_000 }, &cancel);
    let canceller = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    };
    let (err, ()) = tokio::join!(call, canceller);

    assert!(err.unwrap_err().as_remote().unwrap().is_interrupted());
    assert!(cancel.is_cancelled());
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_client_disconnect_stops_remote_worker() {
    let (connector, source) = memory::channel();
    let calc = Arc::new(Calculator::new(5));
    let server = RpcServer::builder(calc.clone(), registry())
        .hooks(ServerHooks::new().with_on_communication_fault(|_, _| Ok(())))
        .start(source);

    let mut connection = connector.connect().await.unwrap();
    let envelope = InvocationEnvelope::for_invocation(&Sleep { millis: 5_000 }).unwrap();
    write_frame(&mut connection, &JsonCodec.encode_invocation(&envelope).unwrap())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(connection);

    assert!(wait_until(|| calc.interrupted.load(Ordering::SeqCst) == 1).await);
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_server_close_unblocks_in_flight_call() {
    let (server, client, _calc) = memory_server();

    let call = tokio::spawn(async move { client.call(&Sleep { millis: 5_000 }).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    server.close().await.unwrap();

    let err = call.await.unwrap().unwrap_err();
    assert!(err.is_communication() || err.as_remote().is_some_and(|e| e.is_interrupted()));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_source_failure_is_reported_by_close() {
    let (connector, source) = memory::channel();
    let server = RpcServer::start(source, Calculator::new(5), registry());

    drop(connector);

    assert!(wait_until(|| server.is_closed()).await);
    assert!(server.close().await.unwrap_err().is_communication());
}

/// JSON codec that counts the messages it encodes.
#[derive(Default)]
struct CountingCodec {
    encoded: Arc<AtomicUsize>,
}

impl Codec for CountingCodec {
    fn name(&self) -> &'static str {
        "counting-json"
    }

    fn encode_invocation(&self, envelope: &InvocationEnvelope) -> interrupt_rpc::Result<Vec<u8>> {
        self.encoded.fetch_add(1, Ordering::SeqCst);
        JsonCodec.encode_invocation(envelope)
    }

    fn decode_invocation(&self, bytes: &[u8]) -> interrupt_rpc::Result<InvocationEnvelope> {
        JsonCodec.decode_invocation(bytes)
    }

    fn encode_result(&self, result: &RpcResult) -> interrupt_rpc::Result<Vec<u8>> {
        self.encoded.fetch_add(1, Ordering::SeqCst);
        JsonCodec.encode_result(result)
    }

    fn decode_result(&self, bytes: &[u8]) -> interrupt_rpc::Result<RpcResult> {
        JsonCodec.decode_result(bytes)
    }
}

#[tokio::test]
async fn test_custom_codec_is_used_by_both_sides() {
    let encoded = Arc::new(AtomicUsize::new(0));
    let (connector, source) = memory::channel();
    let server = RpcServer::builder(Calculator::new(5), registry())
        .codec(CountingCodec {
            encoded: encoded.clone(),
        })
        .start(source);
    let client = RpcClient::new(connector).with_codec(CountingCodec {
        encoded: encoded.clone(),
    });

    assert_eq!(client.call(&AddToBase { number: 79 }).await.unwrap(), 84);
    assert_eq!(encoded.load(Ordering::SeqCst), 2);

    server.close().await.unwrap();
}
