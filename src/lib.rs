pub mod bridge;
pub mod config;
pub mod gateway;
pub mod observability;

pub use bridge::{FlussBridge, InMemoryConnector};
pub use config::{ConfigError, GatewayConfig, WatchdogConfig};
pub use gateway::{GatewayHandle, GatewayServer, TerminationReason, WatchdogMonitor};
