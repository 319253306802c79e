//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `CredentialSource`: issues and extends the ephemeral session credential
//!   (listen key) that authorizes the private stream

use async_trait::async_trait;

/// Errors returned by a credential source.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
    /// Request never reached the venue or the response was cut short.
    #[error("credential request failed: {0}")]
    Transport(String),

    /// Venue answered with a non-success status.
    #[error("credential request rejected with status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body as returned by the venue.
        body: String,
    },

    /// Response did not contain a token.
    #[error("credential response did not contain a token")]
    MissingToken,

    /// Source is misconfigured (e.g. no API key).
    #[error("credential source misconfigured: {0}")]
    Misconfigured(String),
}

/// Source of the session credential used by the private channel.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Issue a credential. May return a brand-new token or, depending on the
    /// venue, the still-valid current one.
    async fn issue(&self) -> Result<String, CredentialError>;

    /// Extend the validity of an existing token. No new token is returned.
    async fn refresh(&self, token: &str) -> Result<(), CredentialError>;
}
