//! Gateway configuration
//!
//! Loaded in two layers: an optional TOML file named by
//! `FLUSS_GATEWAY_CONFIG`, then individual environment overrides.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | FLUSS_GATEWAY_CONFIG | - | Path to a TOML config file |
//! | FLUSS_GATEWAY_HOST | 127.0.0.1 | Bind address for both listeners |
//! | FLUSS_GATEWAY_PORT | 0 | Listener port (0 = OS-assigned) |
//! | FLUSS_GATEWAY_CALLBACK_PORT | 0 | Callback port (0 = allocate a free one) |
//! | FLUSS_GATEWAY_MAX_CONNECTIONS | 64 | Concurrent peer sessions |
//! | FLUSS_GATEWAY_CALL_TIMEOUT_MS | 5000 | Timeout for calls into the peer |
//! | FLUSS_GATEWAY_CHECK_INTERVAL_MS | 100 | Watchdog poll interval |
//! | FLUSS_GATEWAY_REGISTRATION_TIMEOUT_MS | 10000 | Wait for the peer's watchdog |
//! | FLUSS_GATEWAY_PING_TIMEOUT_MS | 5000 | Timeout for a single ping |

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "FLUSS_GATEWAY_CONFIG";

/// Port used by the fixed-port server when none is given
pub const DEFAULT_PORT: u16 = 25333;

// Explicit limits with _MIN/_MAX suffix
const MAX_CONNECTIONS_MAX: usize = 4096;
const CHECK_INTERVAL_MS_MIN: u64 = 1;
const CHECK_INTERVAL_MS_MAX: u64 = 60_000;
const TIMEOUT_MS_MIN: u64 = 1;
const TIMEOUT_MS_MAX: u64 = 600_000;

/// Error type for configuration loading
#[derive(Debug)]
pub enum ConfigError {
    /// Config file could not be read
    Io { path: PathBuf, source: std::io::Error },
    /// Config file is not valid TOML for [`GatewayConfig`]
    Parse { path: PathBuf, source: toml::de::Error },
    /// A value is outside its permitted range
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "Cannot read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "Cannot parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Liveness monitor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Registry key the peer publishes its liveness object under
    pub key: String,
    /// Interval between registry checks and between pings (default: 100ms)
    #[serde(with = "duration_millis")]
    pub check_interval: Duration,
    /// How long to wait for the peer to register (default: 10s)
    #[serde(with = "duration_millis")]
    pub registration_timeout: Duration,
    /// Upper bound on a single ping call (default: 5s)
    #[serde(with = "duration_millis")]
    pub ping_timeout: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        WatchdogConfig {
            key: crate::gateway::WATCHDOG_KEY.to_string(),
            check_interval: Duration::from_millis(100),
            registration_timeout: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(5),
        }
    }
}

impl WatchdogConfig {
    /// Configuration for tests (fast intervals)
    pub fn test() -> Self {
        WatchdogConfig {
            key: crate::gateway::WATCHDOG_KEY.to_string(),
            check_interval: Duration::from_millis(10),
            registration_timeout: Duration::from_millis(200),
            ping_timeout: Duration::from_millis(500),
        }
    }
}

/// Main gateway configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Bind address for the listener and callback listener
    pub host: IpAddr,
    /// Listener port; 0 lets the OS choose
    pub port: u16,
    /// Callback port; 0 allocates a free one
    pub callback_port: u16,
    /// Maximum concurrent peer sessions
    pub max_connections: usize,
    /// Timeout for calls into peer callback objects
    #[serde(with = "duration_millis")]
    pub call_timeout: Duration,
    pub watchdog: WatchdogConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            callback_port: 0,
            max_connections: 64,
            call_timeout: Duration::from_secs(5),
            watchdog: WatchdogConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Configuration for tests (OS-assigned ports, fast watchdog)
    pub fn test() -> Self {
        GatewayConfig {
            call_timeout: Duration::from_millis(500),
            watchdog: WatchdogConfig::test(),
            ..Self::default()
        }
    }

    /// Load from `FLUSS_GATEWAY_CONFIG` (if set) plus environment overrides
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) if !path.is_empty() => Self::from_file(Path::new(&path))?,
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply overrides read through `lookup`; unparsable values are ignored
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(lookup: &dyn Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            lookup(key).and_then(|s| s.trim().parse().ok())
        }
        let lookup: &dyn Fn(&str) -> Option<String> = &lookup;

        if let Some(host) = parsed(lookup, "FLUSS_GATEWAY_HOST") {
            self.host = host;
        }
        if let Some(port) = parsed(lookup, "FLUSS_GATEWAY_PORT") {
            self.port = port;
        }
        if let Some(port) = parsed(lookup, "FLUSS_GATEWAY_CALLBACK_PORT") {
            self.callback_port = port;
        }
        if let Some(n) = parsed(lookup, "FLUSS_GATEWAY_MAX_CONNECTIONS") {
            self.max_connections = n;
        }
        if let Some(ms) = parsed(lookup, "FLUSS_GATEWAY_CALL_TIMEOUT_MS") {
            self.call_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parsed(lookup, "FLUSS_GATEWAY_CHECK_INTERVAL_MS") {
            self.watchdog.check_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parsed(lookup, "FLUSS_GATEWAY_REGISTRATION_TIMEOUT_MS") {
            self.watchdog.registration_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parsed(lookup, "FLUSS_GATEWAY_PING_TIMEOUT_MS") {
            self.watchdog.ping_timeout = Duration::from_millis(ms);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 || self.max_connections > MAX_CONNECTIONS_MAX {
            return Err(ConfigError::Invalid(format!(
                "max_connections {} must be in 1..={}",
                self.max_connections, MAX_CONNECTIONS_MAX
            )));
        }
        if self.callback_port != 0 && self.callback_port == self.port {
            return Err(ConfigError::Invalid(format!(
                "callback_port {} must differ from port",
                self.callback_port
            )));
        }
        check_millis(
            "watchdog.check_interval",
            self.watchdog.check_interval,
            CHECK_INTERVAL_MS_MIN,
            CHECK_INTERVAL_MS_MAX,
        )?;
        check_millis("call_timeout", self.call_timeout, TIMEOUT_MS_MIN, TIMEOUT_MS_MAX)?;
        check_millis(
            "watchdog.registration_timeout",
            self.watchdog.registration_timeout,
            TIMEOUT_MS_MIN,
            TIMEOUT_MS_MAX,
        )?;
        check_millis(
            "watchdog.ping_timeout",
            self.watchdog.ping_timeout,
            TIMEOUT_MS_MIN,
            TIMEOUT_MS_MAX,
        )?;
        if self.watchdog.key.is_empty() {
            return Err(ConfigError::Invalid("watchdog.key is empty".to_string()));
        }
        Ok(())
    }
}

/// Listening port from a command-line argument.
///
/// No argument gives [`DEFAULT_PORT`]; an unparsable one logs a warning and
/// gives [`DEFAULT_PORT`] too.
pub fn port_from_arg(arg: Option<&str>) -> u16 {
    match arg {
        None => DEFAULT_PORT,
        Some(s) => match s.trim().parse::<u16>() {
            Ok(port) if port != 0 => port,
            _ => {
                tracing::warn!("Invalid port {:?}, using default port {}", s, DEFAULT_PORT);
                DEFAULT_PORT
            }
        },
    }
}

fn check_millis(name: &str, value: Duration, min: u64, max: u64) -> Result<(), ConfigError> {
    let ms = value.as_millis();
    if ms < u128::from(min) || ms > u128::from(max) {
        return Err(ConfigError::Invalid(format!(
            "{} {}ms must be in {}..={}ms",
            name, ms, min, max
        )));
    }
    Ok(())
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.port, 0);
        assert_eq!(config.watchdog.key, "Watchdog");
        assert_eq!(config.watchdog.check_interval, Duration::from_millis(100));
        assert_eq!(config.watchdog.registration_timeout, Duration::from_secs(10));
        assert!(config.validate().is_ok());
        assert!(GatewayConfig::test().validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("FLUSS_GATEWAY_PORT", "25333"),
            ("FLUSS_GATEWAY_CHECK_INTERVAL_MS", "250"),
            ("FLUSS_GATEWAY_MAX_CONNECTIONS", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = GatewayConfig::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.port, 25333);
        assert_eq!(config.watchdog.check_interval, Duration::from_millis(250));
        assert_eq!(config.max_connections, 64);
    }

    #[test]
    fn test_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        std::fs::write(
            &path,
            r#"
port = 26000
call_timeout = 750

[watchdog]
registration_timeout = 2000
"#,
        )
        .unwrap();

        let config = GatewayConfig::from_file(&path).unwrap();
        assert_eq!(config.port, 26000);
        assert_eq!(config.call_timeout, Duration::from_millis(750));
        assert_eq!(config.watchdog.registration_timeout, Duration::from_secs(2));
        assert_eq!(config.watchdog.check_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_invalid_toml_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "port = \"high\"").unwrap();

        let err = GatewayConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("bad.toml"));
    }

    #[test]
    fn test_port_from_arg() {
        assert_eq!(port_from_arg(None), 25333);
        assert_eq!(port_from_arg(Some("26000")), 26000);
        assert_eq!(port_from_arg(Some("abc")), DEFAULT_PORT);
        assert_eq!(port_from_arg(Some("70000")), DEFAULT_PORT);
        assert_eq!(port_from_arg(Some("0")), DEFAULT_PORT);
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let mut config = GatewayConfig::default();
        config.max_connections = 0;
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.watchdog.check_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.port = 30000;
        config.callback_port = 30000;
        assert!(config.validate().is_err());
    }
}
