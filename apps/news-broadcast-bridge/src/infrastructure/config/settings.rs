//! Bridge Configuration Settings
//!
//! Configuration types for the news bridge, loaded from environment variables.

use std::time::Duration;

use lapin::uri::{AMQPAuthority, AMQPUri, AMQPUserInfo};

/// Default broadcast exchange name.
pub const DEFAULT_EXCHANGE: &str = "xbuddy.broadcast";

/// Default AMQP connection name shown in the broker management UI.
pub const DEFAULT_CONNECTION_NAME: &str = "xbuddy-websocket-client";

/// Broker login credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    /// Create new credentials.
    #[must_use]
    pub const fn new(username: String, password: String) -> Self {
        Self { username, password }
    }

    /// Get the username.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Get the password.
    #[must_use]
    pub fn password(&self) -> &str {
        &self.password
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Broker connection and topology settings.
///
/// Loaded again at the start of every subscription attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    /// Broker host.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Login credentials.
    pub credentials: Credentials,
    /// Virtual host.
    pub vhost: String,
    /// Fan-out exchange to bind to.
    pub exchange: String,
    /// Unacknowledged deliveries allowed in flight.
    pub prefetch_count: u16,
    /// Client-provided connection name.
    pub connection_name: String,
}

impl BrokerSettings {
    /// Create settings with default port, vhost, exchange and prefetch.
    #[must_use]
    pub fn new(host: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            host: host.into(),
            port: 5672,
            credentials,
            vhost: "/".to_string(),
            exchange: DEFAULT_EXCHANGE.to_string(),
            prefetch_count: 10,
            connection_name: DEFAULT_CONNECTION_NAME.to_string(),
        }
    }

    /// Load broker settings from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `RABBIT_HOST`, `RABBIT_USER` or `RABBIT_PASSWORD`
    /// is missing or empty.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = required_env("RABBIT_HOST")?;
        let username = required_env("RABBIT_USER")?;
        let password = required_env("RABBIT_PASSWORD")?;

        let defaults = Self::new(host, Credentials::new(username, password));

        Ok(Self {
            port: parse_env_u16("RABBIT_PORT", defaults.port),
            vhost: parse_env_string("RABBIT_VHOST", &defaults.vhost),
            exchange: parse_env_string("NEWS_EXCHANGE", &defaults.exchange),
            prefetch_count: parse_env_u16("NEWS_PREFETCH_COUNT", defaults.prefetch_count),
            connection_name: parse_env_string("NEWS_CONNECTION_NAME", &defaults.connection_name),
            ..defaults
        })
    }

    /// Structured AMQP URI for these settings.
    ///
    /// Built field by field, so credentials and vhost need no escaping.
    #[must_use]
    pub fn amqp_uri(&self) -> AMQPUri {
        AMQPUri {
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.credentials.username().to_string(),
                    password: self.credentials.password().to_string(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost: self.vhost.clone(),
            ..AMQPUri::default()
        }
    }

    /// Broker location with the password masked, for logs.
    #[must_use]
    pub fn redacted_uri(&self) -> String {
        format!(
            "amqp://{}:***@{}:{} vhost={}",
            self.credentials.username(),
            self.host,
            self.port,
            self.vhost,
        )
    }
}

/// Reconnection settings for the broker supervisor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectSettings {
    /// Delay after the first failure.
    pub delay_initial: Duration,
    /// Maximum delay.
    pub delay_max: Duration,
    /// Symmetric jitter as a fraction of the delay.
    pub jitter_factor: f64,
    /// Consecutive failures before giving up (0 = unlimited).
    pub max_attempts: u32,
    /// Time allowed for a cancelled subscription to release its resources.
    pub teardown_grace: Duration,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            delay_initial: Duration::from_millis(1000),
            delay_max: Duration::from_secs(30),
            jitter_factor: 0.1,
            max_attempts: 10,
            teardown_grace: Duration::from_secs(5),
        }
    }
}

/// Per-client streaming settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientSettings {
    /// Capacity of each client's outbound queue.
    pub queue_capacity: usize,
    /// Maximum wait for queue space before the client is dropped.
    pub send_timeout: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            send_timeout: Duration::from_millis(5000),
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerSettings {
    /// WebSocket and status API port.
    pub http_port: u16,
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            http_port: 8000,
            health_port: 8082,
        }
    }
}

/// Complete bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Broker settings as of startup.
    pub broker: BrokerSettings,
    /// Reconnection settings.
    pub reconnect: ReconnectSettings,
    /// Per-client streaming settings.
    pub clients: ClientSettings,
    /// Server port settings.
    pub server: ServerSettings,
}

impl BridgeConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing.
    pub fn from_env() -> Result<Self, ConfigError> {
        let broker = BrokerSettings::from_env()?;

        let reconnect_defaults = ReconnectSettings::default();
        let reconnect = ReconnectSettings {
            delay_initial: parse_env_duration_millis(
                "NEWS_RECONNECT_DELAY_INITIAL_MS",
                reconnect_defaults.delay_initial,
            ),
            delay_max: parse_env_duration_secs(
                "NEWS_RECONNECT_DELAY_MAX_SECS",
                reconnect_defaults.delay_max,
            ),
            jitter_factor: parse_env_f64("NEWS_RECONNECT_JITTER", reconnect_defaults.jitter_factor)
                .clamp(0.0, 1.0),
            max_attempts: parse_env_u32(
                "NEWS_MAX_RECONNECT_ATTEMPTS",
                reconnect_defaults.max_attempts,
            ),
            teardown_grace: parse_env_duration_secs(
                "NEWS_TEARDOWN_GRACE_SECS",
                reconnect_defaults.teardown_grace,
            ),
        };

        let client_defaults = ClientSettings::default();
        let clients = ClientSettings {
            queue_capacity: parse_env_usize(
                "NEWS_CLIENT_QUEUE_CAPACITY",
                client_defaults.queue_capacity,
            )
            .max(1),
            send_timeout: parse_env_duration_millis(
                "NEWS_CLIENT_SEND_TIMEOUT_MS",
                client_defaults.send_timeout,
            ),
        };

        let server = ServerSettings {
            http_port: parse_env_u16("NEWS_HTTP_PORT", ServerSettings::default().http_port),
            health_port: parse_env_u16("NEWS_HEALTH_PORT", ServerSettings::default().health_port),
        };

        Ok(Self {
            broker,
            reconnect,
            clients,
            server,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
}

fn required_env(key: &str) -> Result<String, ConfigError> {
    let value = std::env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))?;
    if value.trim().is_empty() {
        return Err(ConfigError::EmptyValue(key.to_string()));
    }
    Ok(value)
}

fn parse_env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}

fn parse_env_duration_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_env_duration_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}
