//! Venue Streaming Adapters
//!
//! WebSocket session management for the venue's public (market data) and
//! private (account) streams:
//!
//! - `dialer`: single connection attempt plus retrying dial
//! - `channel`: one self-healing streaming session
//! - `credential`: listen-key store and refresh loop
//! - `manager`: composition root and lifecycle
//! - `listen_key`: HTTP credential source

pub mod backoff;
pub mod channel;
pub mod codec;
pub mod credential;
pub mod dialer;
pub mod heartbeat;
pub mod listen_key;
pub mod manager;

pub use backoff::{RetryConfig, RetryPolicy};
pub use channel::{ChannelConfig, ChannelSession, ReconnectHandle, SessionError};
pub use credential::{
    CredentialKeeper, CredentialLoopError, CredentialRefresher, CredentialStore,
    DEFAULT_REFRESH_INTERVAL, MAX_REFRESH_INTERVAL,
};
pub use dialer::{DialError, Dialer, DialerConfig};
pub use heartbeat::HeartbeatConfig;
pub use listen_key::{HttpListenKeySource, ListenKeyConfig};
pub use manager::{ManagerError, ManagerState, SessionFailure, SessionManager};
