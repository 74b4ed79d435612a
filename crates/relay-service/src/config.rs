//! Room Relay configuration.
//!
//! Configuration is loaded from environment variables. The broker URL may
//! carry credentials and is redacted in Debug output.

use secrecy::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::broker::BackoffConfig;

/// Default WebSocket bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default health/metrics endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default per-connection outbound queue capacity.
pub const DEFAULT_OUTBOUND_BUFFER: usize = 256;

/// Default maximum inbound frame size in bytes.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

/// Default first broker reconnect delay.
pub const DEFAULT_BROKER_BACKOFF_MIN_MS: u64 = 500;

/// Default broker reconnect delay cap.
pub const DEFAULT_BROKER_BACKOFF_MAX_MS: u64 = 30_000;

/// Default relay instance ID prefix.
pub const DEFAULT_INSTANCE_ID_PREFIX: &str = "relay";

/// Which broker backs the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerKind {
    /// Redis pub/sub, shared by every relay instance.
    Redis,
    /// In-process bus; a single relay instance only.
    Memory,
}

/// Room Relay configuration.
#[derive(Clone)]
pub struct Config {
    /// Broker backend (default: redis).
    pub broker: BrokerKind,

    /// Redis connection URL. Required when `broker` is `Redis`.
    /// Protected by `SecretString` to prevent accidental logging.
    pub redis_url: Option<SecretString>,

    /// WebSocket server bind address (default: "0.0.0.0:8080").
    pub bind_address: String,

    /// Health endpoint bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Unique identifier for this relay instance.
    pub instance_id: String,

    /// Per-connection outbound queue capacity.
    pub outbound_buffer: usize,

    /// Maximum inbound WebSocket message size in bytes.
    pub max_frame_bytes: usize,

    /// Broker reconnect backoff bounds.
    pub broker_backoff: BackoffConfig,

    /// Emit JSON-formatted logs.
    pub log_json: bool,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("broker", &self.broker)
            .field(
                "redis_url",
                &self.redis_url.as_ref().map(|_| "[REDACTED]"),
            )
            .field("bind_address", &self.bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field("instance_id", &self.instance_id)
            .field("outbound_buffer", &self.outbound_buffer)
            .field("max_frame_bytes", &self.max_frame_bytes)
            .field("broker_backoff", &self.broker_backoff)
            .field("log_json", &self.log_json)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let broker = match vars.get("RELAY_BROKER").map(String::as_str) {
            None | Some("redis") => BrokerKind::Redis,
            Some("memory") => BrokerKind::Memory,
            Some(other) => {
                return Err(ConfigError::InvalidValue(format!(
                    "RELAY_BROKER must be `redis` or `memory`, got `{other}`"
                )))
            }
        };

        let redis_url = vars.get("REDIS_URL").cloned().map(SecretString::from);
        if broker == BrokerKind::Redis && redis_url.is_none() {
            return Err(ConfigError::MissingEnvVar("REDIS_URL".to_string()));
        }

        let bind_address = vars
            .get("RELAY_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("RELAY_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let outbound_buffer: usize =
            parse_or(vars, "RELAY_OUTBOUND_BUFFER", DEFAULT_OUTBOUND_BUFFER)?;
        if outbound_buffer == 0 {
            return Err(ConfigError::InvalidValue(
                "RELAY_OUTBOUND_BUFFER must be at least 1".to_string(),
            ));
        }

        let max_frame_bytes: usize =
            parse_or(vars, "RELAY_MAX_FRAME_BYTES", DEFAULT_MAX_FRAME_BYTES)?;
        if max_frame_bytes == 0 {
            return Err(ConfigError::InvalidValue(
                "RELAY_MAX_FRAME_BYTES must be at least 1".to_string(),
            ));
        }

        let backoff_min_ms: u64 = parse_or(
            vars,
            "RELAY_BROKER_BACKOFF_MIN_MS",
            DEFAULT_BROKER_BACKOFF_MIN_MS,
        )?;
        let backoff_max_ms: u64 = parse_or(
            vars,
            "RELAY_BROKER_BACKOFF_MAX_MS",
            DEFAULT_BROKER_BACKOFF_MAX_MS,
        )?;
        if backoff_min_ms == 0 || backoff_min_ms > backoff_max_ms {
            return Err(ConfigError::InvalidValue(format!(
                "broker backoff must satisfy 0 < min <= max, got min={backoff_min_ms}ms max={backoff_max_ms}ms"
            )));
        }

        let log_json = parse_or(vars, "RELAY_LOG_JSON", false)?;

        // Generate relay instance ID
        let instance_id = vars.get("RELAY_INSTANCE_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_INSTANCE_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            broker,
            redis_url,
            bind_address,
            health_bind_address,
            instance_id,
            outbound_buffer,
            max_frame_bytes,
            broker_backoff: BackoffConfig {
                min: Duration::from_millis(backoff_min_ms),
                max: Duration::from_millis(backoff_max_ms),
            },
            log_json,
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{name}: cannot parse `{raw}`"))),
    }
}
