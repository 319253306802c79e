//! Session Types
//!
//! Types describing a logical streaming channel and its lifecycle:
//!
//! - [`ChannelKind`]: public (market data) or private (account events)
//! - [`SessionStatus`]: connection state of one channel session
//! - [`RestartSignal`]: "resynchronize from scratch" notification for consumers
//! - [`SessionCredential`]: venue-issued token authorizing the private channel

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

// =============================================================================
// Channel Kind
// =============================================================================

/// Logical streaming channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Market data channel, no authentication.
    Public,
    /// Account/order event channel, authorized by a session credential.
    Private,
}

impl ChannelKind {
    /// Both channel kinds, public first.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Public, Self::Private]
    }

    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
        }
    }

    /// Whether this channel requires a session credential.
    #[must_use]
    pub const fn requires_credential(&self) -> bool {
        matches!(self, Self::Private)
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Session Status
// =============================================================================

/// Connection state of a channel session.
///
/// Transitions per reconnect cycle are `Connected -> Reconnecting -> Connected`
/// or `Connected -> Reconnecting -> Failed`. `Failed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionStatus {
    /// No live connection (not yet connected, or stopped).
    #[default]
    Disconnected,
    /// Live connection, read loop running.
    Connected,
    /// Connection lost, redial in progress.
    Reconnecting,
    /// Retries exhausted; the session will not dial again.
    Failed,
}

impl SessionStatus {
    /// Check if the session has a live connection.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if the session gave up for good.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed)
    }

    /// Label used in logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }
}

// =============================================================================
// Restart Signal
// =============================================================================

/// Why a restart signal was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartCause {
    /// Session freshly initialized at manager startup.
    Initial,
    /// Session completed a reconnect.
    Reconnect,
}

impl RestartCause {
    /// Label used in logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Reconnect => "reconnect",
        }
    }
}

/// Tells consumers that state carried by a channel must be resynchronized.
///
/// Delivery is at-least-once; consumers must handle duplicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartSignal {
    /// Channel that (re)started.
    pub channel: ChannelKind,
    /// What triggered the signal.
    pub cause: RestartCause,
}

impl RestartSignal {
    /// Signal for a completed reconnect.
    #[must_use]
    pub const fn reconnect(channel: ChannelKind) -> Self {
        Self {
            channel,
            cause: RestartCause::Reconnect,
        }
    }

    /// Signal for a freshly initialized session.
    #[must_use]
    pub const fn initial(channel: ChannelKind) -> Self {
        Self {
            channel,
            cause: RestartCause::Initial,
        }
    }
}

// =============================================================================
// Session Credential
// =============================================================================

/// Venue-issued token authorizing the private stream (a listen key).
///
/// Never mutated: a refresh or re-issue installs a new value wholesale.
/// The `Debug` implementation redacts the token.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionCredential {
    token: String,
    issued_at: DateTime<Utc>,
    refresh_interval: Duration,
}

impl SessionCredential {
    /// Create a credential issued now.
    #[must_use]
    pub fn new(token: impl Into<String>, refresh_interval: Duration) -> Self {
        Self {
            token: token.into(),
            issued_at: Utc::now(),
            refresh_interval,
        }
    }

    /// The raw token.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// When this credential was installed.
    #[must_use]
    pub const fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    /// Interval at which this credential is refreshed.
    #[must_use]
    pub const fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    /// Token prefix safe for logging.
    #[must_use]
    pub fn redacted(&self) -> String {
        redact(&self.token)
    }
}

impl fmt::Debug for SessionCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredential")
            .field("token", &self.redacted())
            .field("issued_at", &self.issued_at)
            .field("refresh_interval", &self.refresh_interval)
            .finish()
    }
}

/// Keep the first four characters of a secret.
#[must_use]
pub fn redact(secret: &str) -> String {
    let prefix: String = secret.chars().take(4).collect();
    format!("{prefix}…")
}
