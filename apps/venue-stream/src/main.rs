//! Venue Stream Binary
//!
//! Runs the streaming session manager against the configured venue and logs
//! what arrives.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin venue-stream
//! ```
//!
//! # Environment Variables
//!
//! ## Required (private channel only)
//! - `VENUE_API_KEY`: API key used to issue and extend the listen key
//!
//! ## Optional
//! - `VENUE_PUBLIC_WS_URL` / `VENUE_PRIVATE_WS_URL` / `VENUE_API_URL`: endpoints
//! - `STREAM_PUBLIC_ENABLED` / `STREAM_PRIVATE_ENABLED`: channel switches (default: true / false)
//! - `STREAM_PUBLIC_QUEUE_CAPACITY` / `STREAM_PRIVATE_QUEUE_CAPACITY`: queue sizes (default: 2000)
//! - `STREAM_CREDENTIAL_REFRESH_SECS`: listen-key refresh interval (default: 3300)
//! - `STREAM_MAX_RETRIES`: dial and credential retry cap (default: 100)
//! - `STREAM_SKIP_TLS_VERIFY`: accept any server certificate (default: false)
//! - `STREAM_DIAL_TIMEOUT_SECS` / `STREAM_STARTUP_TIMEOUT_SECS`: timeouts (default: 10 / 10)
//! - `STREAM_HEARTBEAT_INTERVAL_SECS` / `STREAM_HEARTBEAT_TIMEOUT_SECS`: client pings (default: 0 / 60)
//! - `STREAM_ANNOUNCE_INITIAL`: emit an initial restart signal per session (default: false)
//! - `STREAM_SUBSCRIPTIONS`: comma-separated public streams to subscribe after start
//! - `STREAM_METRICS_PORT`: Prometheus listener port (default: 0, disabled)
//! - `OTEL_ENABLED`, `OTEL_EXPORTER_OTLP_ENDPOINT`, `OTEL_SERVICE_NAME`: tracing export
//! - `RUST_LOG`: log filter (default: info)

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Bytes;
use venue_stream::infrastructure::config::ConfigError;
use venue_stream::infrastructure::telemetry;
use venue_stream::{
    ChannelKind, CredentialError, CredentialSource, HttpListenKeySource, ListenKeyConfig,
    RestartSignal, ServiceSettings, SessionConfig, SessionFailure, SessionManager, init_metrics,
};

/// Frames between progress log lines.
const PROGRESS_EVERY: u64 = 1_000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        anyhow::bail!("failed to install rustls crypto provider");
    }

    load_dotenv();

    let _telemetry_guard = telemetry::init().context("failed to initialize telemetry")?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting venue stream");

    let config = SessionConfig::from_env()?;
    let service = ServiceSettings::from_env()?;
    log_config(&config, &service);

    if let Some(addr) = init_metrics(service.metrics_port)? {
        tracing::info!(addr = %addr, "Metrics exporter listening");
    }

    let source = credential_source(&config)?;
    let manager = SessionManager::new(config, source)?;

    let enabled: Vec<ChannelKind> = ChannelKind::all()
        .iter()
        .copied()
        .filter(|kind| manager.config().is_enabled(*kind))
        .collect();

    for kind in &enabled {
        let rx = match kind {
            ChannelKind::Public => manager.take_public_messages()?,
            ChannelKind::Private => manager.take_private_messages()?,
        };
        tokio::spawn(consume_frames(*kind, rx));
    }
    tokio::spawn(log_restart_signals(manager.take_restart_signals()?));
    let failures = manager.take_failures()?;

    manager.start(manager.config().startup_timeout).await?;

    if !service.subscriptions.is_empty() {
        manager
            .subscribe_streams(service.subscriptions.iter().cloned())
            .await
            .context("initial subscription failed")?;
        tracing::info!(streams = ?service.subscriptions, "Subscribed");
    }

    tracing::info!("Venue stream ready");

    let outcome = tokio::select! {
        () = await_shutdown() => Ok(()),
        failed = await_all_failed(failures, enabled.len()) => {
            Err(anyhow::anyhow!("every enabled session failed: {failed}"))
        }
    };

    manager.stop().await;
    tracing::info!("Venue stream stopped");
    outcome
}

/// Credential source for the configured channels.
fn credential_source(config: &SessionConfig) -> Result<Arc<dyn CredentialSource>, ConfigError> {
    if !config.private.enabled {
        return Ok(Arc::new(NoCredentials));
    }

    let api_key = config
        .credential
        .api_key
        .clone()
        .ok_or_else(|| ConfigError::MissingEnvVar("VENUE_API_KEY".to_string()))?;

    let source = HttpListenKeySource::new(&ListenKeyConfig::new(
        config.credential.api_url.clone(),
        api_key,
    ))
    .map_err(|e| ConfigError::InvalidValue {
        key: "VENUE_API_KEY".to_string(),
        value: e.to_string(),
    })?;

    Ok(Arc::new(source))
}

/// Stand-in source when the private channel is off.
struct NoCredentials;

#[async_trait]
impl CredentialSource for NoCredentials {
    async fn issue(&self) -> Result<String, CredentialError> {
        Err(CredentialError::Misconfigured(
            "private channel disabled".into(),
        ))
    }

    async fn refresh(&self, _token: &str) -> Result<(), CredentialError> {
        Err(CredentialError::Misconfigured(
            "private channel disabled".into(),
        ))
    }
}

async fn consume_frames(kind: ChannelKind, mut rx: mpsc::Receiver<Bytes>) {
    let mut count: u64 = 0;
    while let Some(frame) = rx.recv().await {
        count += 1;
        tracing::trace!(channel = kind.as_str(), len = frame.len(), "Frame");
        if count % PROGRESS_EVERY == 0 {
            tracing::info!(channel = kind.as_str(), frames = count, "Frames received");
        }
    }
    tracing::debug!(channel = kind.as_str(), frames = count, "Frame consumer finished");
}

async fn log_restart_signals(mut rx: mpsc::UnboundedReceiver<RestartSignal>) {
    while let Some(signal) = rx.recv().await {
        tracing::info!(
            channel = signal.channel.as_str(),
            cause = signal.cause.as_str(),
            "Channel restarted, downstream state must be resynchronized"
        );
    }
}

/// Resolve once `expected` sessions have failed.
async fn await_all_failed(
    mut failures: mpsc::UnboundedReceiver<SessionFailure>,
    expected: usize,
) -> String {
    let mut seen = Vec::with_capacity(expected);
    while seen.len() < expected {
        let Some(failure) = failures.recv().await else {
            std::future::pending::<()>().await;
            continue;
        };
        tracing::error!(
            channel = failure.channel.as_str(),
            error = %failure.error,
            "Session failed permanently"
        );
        seen.push(format!("{}: {}", failure.channel, failure.error));
    }
    seen.join("; ")
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &SessionConfig, service: &ServiceSettings) {
    tracing::info!(
        public = config.public.enabled,
        private = config.private.enabled,
        max_retries = config.max_retries(),
        refresh_secs = config.refresh_interval().as_secs(),
        skip_tls_verify = config.connection.skip_tls_verify,
        subscriptions = service.subscriptions.len(),
        metrics_port = service.metrics_port,
        "Configuration loaded"
    );
    tracing::debug!(
        public_url = %config.public.url,
        private_url = %config.private.url,
        api_url = %config.credential.api_url,
        "Venue endpoints"
    );
}

/// Wait for SIGINT or SIGTERM.
async fn await_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
