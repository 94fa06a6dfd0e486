//! Logging setup
//!
//! Logs go to stderr so stdout stays free for the binaries' banners.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | RUST_LOG | info | Filter directives (e.g. `fluss_gateway=debug`) |
//! | FLUSS_GATEWAY_LOG_JSON | false | Emit JSON lines instead of text |

use tracing_subscriber::EnvFilter;

pub const LOG_JSON_ENV: &str = "FLUSS_GATEWAY_LOG_JSON";

/// Logging configuration loaded from environment variables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub filter: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            filter: "info".to_string(),
            json: false,
        }
    }
}

impl LogConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        LogConfig {
            filter: lookup(EnvFilter::DEFAULT_ENV)
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.filter),
            json: lookup(LOG_JSON_ENV)
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.json),
        }
    }
}

/// Install the global subscriber.
///
/// Returns false when one was already installed (tests, embedding).
pub fn init_tracing() -> bool {
    init_tracing_with(&LogConfig::from_env())
}

pub fn init_tracing_with(config: &LogConfig) -> bool {
    let filter = EnvFilter::try_new(&config.filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.is_ok()
}
