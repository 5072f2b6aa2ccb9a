//! `serve` and `call` subcommands.

use crate::invocations::{self, Add, Calculator, Sleep};
use anyhow::{Context, Result};
use clap::Subcommand;
use interrupt_rpc::{CancellationToken, RpcClient, RpcServer, TcpConnectionSource, TcpConnector};
use tracing::{info, warn};

/// Invocation to send with `call`.
#[derive(Subcommand, Debug)]
pub enum CallTarget {
    /// Add a number to the host's base
    Add {
        #[arg(allow_negative_numbers = true)]
        number: i64,
    },
    /// Sleep on the host for the given milliseconds
    Sleep { millis: u64 },
}

/// Serve until Ctrl-C, then close the server.
pub async fn serve(host: &str, port: u16, base: i64) -> Result<()> {
    let source = TcpConnectionSource::bind((host, port))
        .await
        .with_context(|| format!("failed to bind {}:{}", host, port))?;
    let addr = source.local_addr();
    let server = RpcServer::start(source, Calculator { base }, invocations::registry());

    // Print port for callers to read (intentional stdout for IPC)
    println!("RPC_PORT={}", addr.port());
    info!("Serving calculator with base {} on {}", base, addr);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, closing server");
    server.close().await?;
    Ok(())
}

/// Send one invocation; Ctrl-C asks the host to cancel it.
pub async fn call(host: &str, port: u16, target: CallTarget) -> Result<()> {
    let addr = tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("failed to resolve {}:{}", host, port))?
        .next()
        .with_context(|| format!("no address for {}:{}", host, port))?;
    let client = RpcClient::new(TcpConnector::new(addr));

    let cancel = CancellationToken::new();
    let on_ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received, asking the host to cancel");
                cancel.cancel();
            }
        })
    };

    let output = match target {
        CallTarget::Add { number } => client
            .call_cancellable(&Add { number }, &cancel)
            .await
            .map(|sum| sum.to_string()),
        CallTarget::Sleep { millis } => client
            .call_cancellable(&Sleep { millis }, &cancel)
            .await
            .map(|slept| format!("slept {} ms", slept)),
    };
    on_ctrl_c.abort();

    if cancel.is_cancelled() {
        warn!("Call was cancelled locally");
    }
    println!("{}", output?);
    Ok(())
}
