//! Configuration Module
//!
//! Configuration loading for the bridge service.

mod settings;

pub use settings::{
    BridgeConfig, BrokerSettings, ClientSettings, ConfigError, Credentials, DEFAULT_CONNECTION_NAME,
    DEFAULT_EXCHANGE, ReconnectSettings, ServerSettings,
};
