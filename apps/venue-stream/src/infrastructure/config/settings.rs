//! Session Configuration Settings
//!
//! Configuration types for the session manager, buildable in code or loaded
//! from environment variables.

use std::time::Duration;

use crate::domain::session::{ChannelKind, redact};
use crate::infrastructure::venue::credential::{DEFAULT_REFRESH_INTERVAL, MAX_REFRESH_INTERVAL};

/// Queue capacity used when none is configured.
pub const DEFAULT_QUEUE_CAPACITY: usize = 2000;

/// Retry cap used when none (or a non-positive one) is configured.
pub const DEFAULT_MAX_RETRIES: u32 = 100;

/// Default public stream endpoint.
pub const DEFAULT_PUBLIC_WS_URL: &str = "wss://fstream.binance.com/ws";

/// Default private stream base; the listen key is appended as a path segment.
pub const DEFAULT_PRIVATE_WS_URL: &str = "wss://fstream.binance.com/ws";

/// Default REST base for listen-key calls.
pub const DEFAULT_API_URL: &str = "https://fapi.binance.com";

/// Settings for one channel.
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    /// Whether the channel is started.
    pub enabled: bool,
    /// Endpoint URL.
    pub url: String,
    /// Consumer queue capacity (0 = default).
    pub queue_capacity: usize,
}

impl ChannelSettings {
    /// Enabled channel with default capacity.
    #[must_use]
    pub fn enabled(url: impl Into<String>) -> Self {
        Self {
            enabled: true,
            url: url.into(),
            queue_capacity: 0,
        }
    }

    /// Disabled channel.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            queue_capacity: 0,
        }
    }
}

/// Credential settings for the private channel.
#[derive(Clone, Default)]
pub struct CredentialSettings {
    /// REST base URL for listen-key calls.
    pub api_url: String,
    /// API key (required by the HTTP credential source).
    pub api_key: Option<String>,
    /// Refresh interval (`None` = default).
    pub refresh_interval: Option<Duration>,
}

impl std::fmt::Debug for CredentialSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialSettings")
            .field("api_url", &self.api_url)
            .field("api_key", &self.api_key.as_deref().map(redact))
            .field("refresh_interval", &self.refresh_interval)
            .finish()
    }
}

/// Connection behavior shared by both channels.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Retry cap for dials and credential calls (≤ 0 = default).
    pub max_retries: i64,
    /// Upper bound for one dial attempt.
    pub dial_timeout: Duration,
    /// Accept any server certificate.
    pub skip_tls_verify: bool,
    /// Client ping cadence (zero disables).
    pub heartbeat_interval: Duration,
    /// Silence after which a connection is considered dead.
    pub heartbeat_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            max_retries: i64::from(DEFAULT_MAX_RETRIES),
            dial_timeout: Duration::from_secs(10),
            skip_tls_verify: false,
            heartbeat_interval: Duration::ZERO,
            heartbeat_timeout: Duration::from_secs(60),
        }
    }
}

/// Complete session manager configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Public (market data) channel.
    pub public: ChannelSettings,
    /// Private (account) channel.
    pub private: ChannelSettings,
    /// Credential settings.
    pub credential: CredentialSettings,
    /// Connection behavior.
    pub connection: ConnectionSettings,
    /// Bound for `start()`.
    pub startup_timeout: Duration,
    /// Emit an `Initial` restart signal per session after startup.
    pub announce_initial: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            public: ChannelSettings::enabled(DEFAULT_PUBLIC_WS_URL),
            private: ChannelSettings {
                enabled: false,
                url: DEFAULT_PRIVATE_WS_URL.to_owned(),
                queue_capacity: 0,
            },
            credential: CredentialSettings {
                api_url: DEFAULT_API_URL.to_owned(),
                api_key: None,
                refresh_interval: None,
            },
            connection: ConnectionSettings::default(),
            startup_timeout: Duration::from_secs(10),
            announce_initial: false,
        }
    }
}

impl SessionConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is present but malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let public = ChannelSettings {
            enabled: parse_env_bool("STREAM_PUBLIC_ENABLED", true)?,
            url: env_or("VENUE_PUBLIC_WS_URL", DEFAULT_PUBLIC_WS_URL),
            queue_capacity: parse_env("STREAM_PUBLIC_QUEUE_CAPACITY", 0)?,
        };

        let private = ChannelSettings {
            enabled: parse_env_bool("STREAM_PRIVATE_ENABLED", false)?,
            url: env_or("VENUE_PRIVATE_WS_URL", DEFAULT_PRIVATE_WS_URL),
            queue_capacity: parse_env("STREAM_PRIVATE_QUEUE_CAPACITY", 0)?,
        };

        let credential = CredentialSettings {
            api_url: env_or("VENUE_API_URL", DEFAULT_API_URL),
            api_key: std::env::var("VENUE_API_KEY").ok().filter(|k| !k.is_empty()),
            refresh_interval: parse_env_opt::<u64>("STREAM_CREDENTIAL_REFRESH_SECS")?
                .map(Duration::from_secs),
        };

        let connection = ConnectionSettings {
            max_retries: parse_env("STREAM_MAX_RETRIES", defaults.connection.max_retries)?,
            dial_timeout: parse_env_duration_secs(
                "STREAM_DIAL_TIMEOUT_SECS",
                defaults.connection.dial_timeout,
            )?,
            skip_tls_verify: parse_env_bool("STREAM_SKIP_TLS_VERIFY", false)?,
            heartbeat_interval: parse_env_duration_secs(
                "STREAM_HEARTBEAT_INTERVAL_SECS",
                defaults.connection.heartbeat_interval,
            )?,
            heartbeat_timeout: parse_env_duration_secs(
                "STREAM_HEARTBEAT_TIMEOUT_SECS",
                defaults.connection.heartbeat_timeout,
            )?,
        };

        Ok(Self {
            public,
            private,
            credential,
            connection,
            startup_timeout: parse_env_duration_secs(
                "STREAM_STARTUP_TIMEOUT_SECS",
                defaults.startup_timeout,
            )?,
            announce_initial: parse_env_bool("STREAM_ANNOUNCE_INITIAL", false)?,
        })
    }

    /// Check the configuration and fill in defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if no channel is enabled, the refresh interval is out
    /// of bounds, or an enabled channel has no URL.
    pub fn validated(mut self) -> Result<Self, ConfigError> {
        if !self.public.enabled && !self.private.enabled {
            return Err(ConfigError::NoChannelEnabled);
        }

        for kind in ChannelKind::all() {
            let settings = self.channel(*kind);
            if settings.enabled && settings.url.trim().is_empty() {
                return Err(ConfigError::EmptyValue(format!("{kind} endpoint URL")));
            }
        }

        let interval = self.credential.refresh_interval.unwrap_or(DEFAULT_REFRESH_INTERVAL);
        if interval.is_zero() || interval > MAX_REFRESH_INTERVAL {
            return Err(ConfigError::InvalidRefreshInterval {
                interval,
                max: MAX_REFRESH_INTERVAL,
            });
        }
        self.credential.refresh_interval = Some(interval);

        if self.connection.max_retries <= 0 {
            self.connection.max_retries = i64::from(DEFAULT_MAX_RETRIES);
        }

        for settings in [&mut self.public, &mut self.private] {
            if settings.queue_capacity == 0 {
                settings.queue_capacity = DEFAULT_QUEUE_CAPACITY;
            }
        }

        if self.startup_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "startup timeout".into(),
                value: "0".into(),
            });
        }

        Ok(self)
    }

    /// Settings of one channel.
    #[must_use]
    pub const fn channel(&self, kind: ChannelKind) -> &ChannelSettings {
        match kind {
            ChannelKind::Public => &self.public,
            ChannelKind::Private => &self.private,
        }
    }

    /// Check if a channel is enabled.
    #[must_use]
    pub const fn is_enabled(&self, kind: ChannelKind) -> bool {
        self.channel(kind).enabled
    }

    /// Effective refresh interval.
    #[must_use]
    pub fn refresh_interval(&self) -> Duration {
        self.credential.refresh_interval.unwrap_or(DEFAULT_REFRESH_INTERVAL)
    }

    /// Effective retry cap.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        if self.connection.max_retries <= 0 {
            return DEFAULT_MAX_RETRIES;
        }
        u32::try_from(self.connection.max_retries).unwrap_or(u32::MAX)
    }
}

/// Settings used only by the binary.
#[derive(Debug, Clone, Default)]
pub struct ServiceSettings {
    /// Streams subscribed on the public channel after startup.
    pub subscriptions: Vec<String>,
    /// Prometheus listener port (0 = disabled).
    pub metrics_port: u16,
}

impl ServiceSettings {
    /// Create settings from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is present but malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let subscriptions = std::env::var("STREAM_SUBSCRIPTIONS")
            .map(|raw| parse_list(&raw))
            .unwrap_or_default();

        Ok(Self {
            subscriptions,
            metrics_port: parse_env("STREAM_METRICS_PORT", 0)?,
        })
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Value is empty.
    #[error("{0} cannot be empty")]
    EmptyValue(String),
    /// Value could not be parsed.
    #[error("invalid value {value:?} for {key}")]
    InvalidValue {
        /// Variable or setting name.
        key: String,
        /// Offending value.
        value: String,
    },
    /// Both channels are disabled.
    #[error("both public and private channels are disabled, enable at least one")]
    NoChannelEnabled,
    /// Refresh interval out of bounds.
    #[error("credential refresh interval {interval:?} must be positive and at most {max:?}")]
    InvalidRefreshInterval {
        /// Configured interval.
        interval: Duration,
        /// Upper bound.
        max: Duration,
    },
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_owned())
}

fn parse_env_opt<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_owned(),
                value: raw,
            }),
        _ => Ok(None),
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    Ok(parse_env_opt(key)?.unwrap_or(default))
}

fn parse_env_duration_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(parse_env_opt::<u64>(key)?.map_or(default, Duration::from_secs))
}

fn parse_env_bool(key: &str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => parse_bool(&raw).ok_or(ConfigError::InvalidValue {
            key: key.to_owned(),
            value: raw,
        }),
        _ => Ok(default),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}
