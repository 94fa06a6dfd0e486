//! Fluss Gateway (handshake mode)
//!
//! Started by the peer process. Binds on OS-assigned ports, publishes them to
//! the handshake file, then lives exactly as long as the peer's watchdog
//! keeps answering.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | _PYFLUSS_CONN_INFO_PATH | - | Handshake file to publish (required) |
//! | FLUSS_GATEWAY_CONFIG | - | TOML config file |
//! | FLUSS_GATEWAY_* | - | Overrides, see `config` |
//! | RUST_LOG | info | Log filter |
//!
//! ## Exit Status
//!
//! | Status | Meaning |
//! |--------|---------|
//! | 0 | Stopped by Ctrl+C |
//! | 1 | Setup failure, watchdog never registered, or peer died |

use fluss_gateway::bridge::{FlussBridge, InMemoryConnector};
use fluss_gateway::config::GatewayConfig;
use fluss_gateway::gateway::{handshake, GatewayServer, HandshakeRecord, WatchdogMonitor, HANDSHAKE_PATH_ENV};
use fluss_gateway::observability::init_tracing;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

fn fatal(msg: impl std::fmt::Display) -> ExitCode {
    error!("{}", msg);
    eprintln!("fluss-gateway: {}", msg);
    ExitCode::FAILURE
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let config = match GatewayConfig::load() {
        Ok(config) => config,
        Err(e) => return fatal(e),
    };
    let Some(handshake_path) = handshake::path_from_env() else {
        return fatal(format!("{} is not set", HANDSHAKE_PATH_ENV));
    };

    let bridge = Arc::new(FlussBridge::new(Arc::new(InMemoryConnector::new())));
    let handle = match GatewayServer::new(config.clone()).start(bridge.clone()).await {
        Ok(handle) => handle,
        Err(e) => return fatal(e),
    };

    let endpoint = handle.endpoint();
    let record = HandshakeRecord::new(endpoint.port, endpoint.callback_port);
    if let Err(e) = handshake::publish(&handshake_path, &record) {
        handle.shutdown().await;
        return fatal(e);
    }
    info!(
        "Published ports {}/{} to {}",
        endpoint.port,
        endpoint.callback_port,
        handshake_path.display()
    );

    let monitor = WatchdogMonitor::new(handle.registry(), config.watchdog.clone());
    let stop = handle.shutdown_token().child_token();
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
                stop.cancel();
            }
        });
    }

    let reason = monitor.run(stop).await;

    bridge.close().await;
    handle.shutdown().await;

    let code = reason.exit_code();
    info!("Exiting with status {} ({})", code, reason);
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
