//! Fluss Gateway (fixed port)
//!
//! Starts the gateway on a known port without the handshake file or the
//! watchdog. Runs until Ctrl+C.
//!
//! Usage: `fluss-gateway-simple [PORT]`
//!
//! An invalid PORT falls back to 25333 with a warning.

use fluss_gateway::bridge::{FlussBridge, InMemoryConnector};
use fluss_gateway::config::{port_from_arg, GatewayConfig};
use fluss_gateway::gateway::GatewayServer;
use fluss_gateway::observability::init_tracing;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let arg = std::env::args().nth(1);
    let mut config = match GatewayConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            eprintln!("fluss-gateway-simple: {}", e);
            return ExitCode::FAILURE;
        }
    };
    config.port = port_from_arg(arg.as_deref());

    let bridge = Arc::new(FlussBridge::new(Arc::new(InMemoryConnector::new())));
    let handle = match GatewayServer::new(config).start(bridge.clone()).await {
        Ok(handle) => handle,
        Err(e) => {
            error!("Failed to start gateway: {}", e);
            eprintln!("fluss-gateway-simple: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let endpoint = handle.endpoint();
    println!("Fluss gateway started");
    println!("Listening port: {}", endpoint.port);
    println!("Callback port:  {}", endpoint.callback_port);
    println!("Entry point:    FlussBridge");
    println!("Waiting for clients, Ctrl+C to stop");

    if let Err(e) = signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
    }
    info!("Shutdown signal received");

    bridge.close().await;
    handle.shutdown().await;
    ExitCode::SUCCESS
}
