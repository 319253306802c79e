//! Configuration Module
//!
//! Environment-driven configuration and validation for the session manager.

mod settings;

pub use settings::{
    ChannelSettings, ConfigError, ConnectionSettings, CredentialSettings, DEFAULT_API_URL,
    DEFAULT_MAX_RETRIES, DEFAULT_PRIVATE_WS_URL, DEFAULT_PUBLIC_WS_URL, DEFAULT_QUEUE_CAPACITY,
    ServiceSettings, SessionConfig,
};
