//! WebSocket Dialer
//!
//! Opens one WebSocket connection, optionally retrying with backoff.
//!
//! Each attempt is bounded by the dial timeout. Failures are classified as
//! timeouts or transport errors because the private session reacts to a
//! timeout differently (a stale credential is the usual cause).
//!
//! With relaxed transport verification the TLS layer accepts any server
//! certificate. Only meant for test venues and intercepting proxies.

use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::backoff::RetryConfig;
use crate::domain::session::ChannelKind;

/// A connected WebSocket stream.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// =============================================================================
// Error Type
// =============================================================================

/// Errors that can occur while dialing.
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    /// The attempt did not complete within the dial timeout.
    #[error("dial timed out after {0:?}")]
    Timeout(Duration),

    /// Connection or handshake failed.
    #[error("dial failed: {0}")]
    Transport(#[source] Box<tungstenite::Error>),

    /// Stop requested while dialing or backing off.
    #[error("dial cancelled")]
    Cancelled,

    /// Every allowed attempt failed.
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Number of dial attempts made.
        attempts: u32,
        /// Error of the final attempt.
        last: Box<DialError>,
    },

    /// TLS client configuration could not be built.
    #[error("invalid TLS configuration: {0}")]
    Tls(String),
}

impl DialError {
    /// Check if the failure was a timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::RetriesExhausted { last, .. } => last.is_timeout(),
            _ => false,
        }
    }

    fn from_transport(error: tungstenite::Error, timeout: Duration) -> Self {
        match &error {
            tungstenite::Error::Io(io) if io.kind() == std::io::ErrorKind::TimedOut => {
                Self::Timeout(timeout)
            }
            _ => Self::Transport(Box::new(error)),
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the dialer.
#[derive(Debug, Clone)]
pub struct DialerConfig {
    /// Upper bound for a single connection attempt (TCP + TLS + upgrade).
    pub dial_timeout: Duration,
    /// Accept any server certificate.
    pub skip_tls_verify: bool,
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(10),
            skip_tls_verify: false,
        }
    }
}

// =============================================================================
// Dialer
// =============================================================================

/// Opens WebSocket connections.
#[derive(Debug, Clone)]
pub struct Dialer {
    config: DialerConfig,
    tls: Option<Arc<ClientConfig>>,
}

impl Dialer {
    /// Create a dialer.
    ///
    /// # Errors
    ///
    /// Returns `DialError::Tls` if the relaxed TLS configuration cannot be built.
    pub fn new(config: DialerConfig) -> Result<Self, DialError> {
        let tls = if config.skip_tls_verify {
            Some(Arc::new(insecure_client_config()?))
        } else {
            None
        };

        Ok(Self { config, tls })
    }

    /// Dial timeout in effect.
    #[must_use]
    pub const fn dial_timeout(&self) -> Duration {
        self.config.dial_timeout
    }

    /// Single connection attempt bounded by the dial timeout.
    ///
    /// # Errors
    ///
    /// Returns `DialError::Timeout` or `DialError::Transport`.
    pub async fn dial_once(&self, url: &str) -> Result<WsStream, DialError> {
        let connector = self.tls.as_ref().map(|tls| Connector::Rustls(Arc::clone(tls)));
        let attempt =
            tokio_tungstenite::connect_async_tls_with_config(url, None, true, connector);

        match tokio::time::timeout(self.config.dial_timeout, attempt).await {
            Ok(Ok((stream, _response))) => Ok(stream),
            Ok(Err(e)) => Err(DialError::from_transport(e, self.config.dial_timeout)),
            Err(_elapsed) => Err(DialError::Timeout(self.config.dial_timeout)),
        }
    }

    /// Dial with retries.
    ///
    /// Makes at most `retry.max_retries + 1` attempts, sleeping `n × unit`
    /// before retry `n`. A stop request during a sleep aborts without
    /// another attempt.
    ///
    /// # Errors
    ///
    /// Returns `DialError::Cancelled` on stop, `DialError::RetriesExhausted`
    /// when every attempt failed.
    pub async fn dial(
        &self,
        channel: ChannelKind,
        url: &str,
        retry: &RetryConfig,
        cancel: &CancellationToken,
    ) -> Result<WsStream, DialError> {
        let mut policy = retry.policy();

        loop {
            if cancel.is_cancelled() {
                return Err(DialError::Cancelled);
            }

            let error = match self.dial_once(url).await {
                Ok(stream) => {
                    if policy.retries() > 0 {
                        tracing::info!(
                            channel = channel.as_str(),
                            retries = policy.retries(),
                            "Connected after retrying"
                        );
                    }
                    return Ok(stream);
                }
                Err(e) => e,
            };

            let Some(delay) = policy.next_delay() else {
                tracing::warn!(
                    channel = channel.as_str(),
                    max_retries = retry.max_retries,
                    error = %error,
                    "Maximum dial retries reached, giving up"
                );
                return Err(DialError::RetriesExhausted {
                    attempts: policy.retries() + 1,
                    last: Box::new(error),
                });
            };

            tracing::warn!(
                channel = channel.as_str(),
                attempt = policy.retries(),
                delay_ms = delay.as_millis(),
                error = %error,
                "Failed to connect, retrying"
            );

            if !backoff_sleep(delay, cancel).await {
                return Err(DialError::Cancelled);
            }
        }
    }
}

/// Sleep for `delay` unless cancelled first. Returns `false` on cancellation.
pub async fn backoff_sleep(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}

// =============================================================================
// Relaxed TLS
// =============================================================================

fn insecure_client_config() -> Result<ClientConfig, DialError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let config = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| DialError::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
        .with_no_client_auth();

    Ok(config)
}

/// Certificate verifier that trusts every server certificate but still
/// checks handshake signatures.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
