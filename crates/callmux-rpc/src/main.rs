//! Callmux RPC host - a standalone executor for bridges.
//!
//! Serves a handful of named operations and a push queue over the callmux IPC
//! transport, so a bridge can be exercised against a real remote process.

mod handler;

use anyhow::Result;
use callmux_core::IpcServer;
use clap::Parser;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "callmux-rpc")]
#[command(about = "Executor host for callmux bridges")]
struct Args {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting callmux RPC host");

    let dispatch = Arc::new(handler::HostDispatch::new());
    let bind_addr = format!("{}:{}", args.host, args.port);
    let mut server = IpcServer::bind(dispatch, &bind_addr).await?;

    // Read by the launching process; keep this exact format.
    println!("RPC_PORT={}", server.port);

    info!("RPC host running on {}", server.addr());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    server.shutdown();

    Ok(())
}
