//! interrupt-rpc - demo host and caller for the interrupt-rpc library.
//!
//! `serve` hosts a calculator context over TCP and prints `RPC_PORT=<port>`
//! on stdout once it is accepting. `call` sends one invocation to a running
//! host; Ctrl-C during a call asks the host to cancel it.

mod commands;
mod invocations;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "interrupt-rpc")]
#[command(about = "Demo host and caller for interrupt-rpc")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Host a calculator and serve calls until Ctrl-C
    Serve {
        /// Port to listen on (0 = auto-assign)
        #[arg(short, long, default_value = "0")]
        port: u16,

        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Value every `add` call is added to
        #[arg(long, default_value = "0")]
        base: i64,
    },

    /// Call a running host
    Call {
        /// Port the host listens on
        #[arg(short, long)]
        port: u16,

        /// Host to connect to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[command(subcommand)]
        invocation: commands::CallTarget,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries the port line and call results.
    let default_level = if args.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if args.json_logs {
        subscriber.json().init();
    } else {
        subscriber.compact().init();
    }

    match args.command {
        Command::Serve { port, host, base } => commands::serve(&host, port, base).await,
        Command::Call {
            port,
            host,
            invocation,
        } => commands::call(&host, port, invocation).await,
    }
}
