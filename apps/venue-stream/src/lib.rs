#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::items_after_statements
    )
)]

//! Venue Stream - Streaming Session Manager
//!
//! Maintains long-lived WebSocket connections to a trading venue's public
//! (market data) and private (account) streams, keeps the private stream's
//! listen key alive, recovers from disconnects and credential expiry, replays
//! subscriptions after reconnect, and hands raw frames to consumers through
//! bounded queues.
//!
//! # Layers (inside -> outside)
//!
//! - **Domain**: transport-free types
//!   - `session`: channel kinds, session status, restart signals, credentials
//!   - `subscription`: subscribe requests and the replay registry
//!
//! - **Application**: port definitions
//!   - `ports`: the session credential source
//!
//! - **Infrastructure**: adapters and external integrations
//!   - `venue`: dialer, channel sessions, credential refresh loop, manager
//!   - `config`: environment-driven configuration
//!   - `metrics`: Prometheus instrumentation
//!   - `telemetry`: tracing and OpenTelemetry
//!
//! # Data Flow
//!
//! ```text
//!                       +-----------------+
//!  public WS  --------> | ChannelSession  | --> bounded queue --> consumer
//!                       +-----------------+
//!                       +-----------------+
//!  private WS --------> | ChannelSession  | --> bounded queue --> consumer
//!                       +-----------------+
//!                         ^  expiry |
//!            reconnect    |         v
//!                       +-----------------+        +------------------+
//!                       | Refresh loop    | <----> | CredentialSource |
//!                       +-----------------+        +------------------+
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Session and subscription types with no transport dependencies.
pub mod domain;

/// Application layer - Port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::session::{
    ChannelKind, RestartCause, RestartSignal, SessionCredential, SessionStatus,
};
pub use domain::subscription::{SubscribeRequest, SubscriptionRegistry};

// Ports
pub use application::ports::{CredentialError, CredentialSource};

// Session manager
pub use infrastructure::venue::{
    HttpListenKeySource, ListenKeyConfig, ManagerError, ManagerState, SessionError,
    SessionFailure, SessionManager,
};

// Configuration
pub use infrastructure::config::{ConfigError, ServiceSettings, SessionConfig};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
