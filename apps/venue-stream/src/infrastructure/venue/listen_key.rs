//! HTTP listen-key source.
//!
//! Issues and extends the private-stream listen key over the venue's REST
//! API. Retries live in the credential keeper; every call here is a single
//! request.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::application::ports::{CredentialError, CredentialSource};
use crate::domain::session::redact;

/// Listen-key endpoint of the futures API.
pub const DEFAULT_LISTEN_KEY_PATH: &str = "/fapi/v1/listenKey";

/// Header carrying the API key.
const API_KEY_HEADER: &str = "X-MBX-APIKEY";

/// Settings for [`HttpListenKeySource`].
#[derive(Clone)]
pub struct ListenKeyConfig {
    /// REST base URL, e.g. `https://fapi.binance.com`.
    pub api_url: String,
    /// API key.
    pub api_key: String,
    /// Endpoint path.
    pub path: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl std::fmt::Debug for ListenKeyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenKeyConfig")
            .field("api_url", &self.api_url)
            .field("api_key", &redact(&self.api_key))
            .field("path", &self.path)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ListenKeyConfig {
    /// Settings with the default path and a 10 s timeout.
    #[must_use]
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            api_key: api_key.into(),
            path: DEFAULT_LISTEN_KEY_PATH.to_owned(),
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Deserialize)]
struct ListenKeyResponse {
    #[serde(rename = "listenKey")]
    listen_key: Option<String>,
}

/// [`CredentialSource`] backed by the venue's listen-key endpoint.
#[derive(Clone)]
pub struct HttpListenKeySource {
    client: Client,
    url: String,
    api_key: String,
}

impl std::fmt::Debug for HttpListenKeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpListenKeySource")
            .field("url", &self.url)
            .field("api_key", &redact(&self.api_key))
            .finish_non_exhaustive()
    }
}

impl HttpListenKeySource {
    /// Create the source.
    ///
    /// # Errors
    ///
    /// Returns `CredentialError::Misconfigured` for an empty API key or when
    /// the HTTP client cannot be built.
    pub fn new(config: &ListenKeyConfig) -> Result<Self, CredentialError> {
        if config.api_key.trim().is_empty() {
            return Err(CredentialError::Misconfigured("API key is empty".into()));
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| CredentialError::Misconfigured(e.to_string()))?;

        Ok(Self {
            client,
            url: format!("{}{}", config.api_url.trim_end_matches('/'), config.path),
            api_key: config.api_key.clone(),
        })
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, CredentialError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(CredentialError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl CredentialSource for HttpListenKeySource {
    async fn issue(&self) -> Result<String, CredentialError> {
        let response = self
            .client
            .post(&self.url)
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
            .map_err(|e| CredentialError::Transport(e.to_string()))?;

        let body: ListenKeyResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| CredentialError::Transport(e.to_string()))?;

        match body.listen_key {
            Some(key) if !key.is_empty() => {
                tracing::debug!(token = %redact(&key), "Listen key issued");
                Ok(key)
            }
            _ => Err(CredentialError::MissingToken),
        }
    }

    async fn refresh(&self, token: &str) -> Result<(), CredentialError> {
        let response = self
            .client
            .put(&self.url)
            .header(API_KEY_HEADER, &self.api_key)
            .query(&[("listenKey", token)])
            .send()
            .await
            .map_err(|e| CredentialError::Transport(e.to_string()))?;

        Self::check(response).await?;
        tracing::debug!(token = %redact(token), "Listen key extended");
        Ok(())
    }
}
