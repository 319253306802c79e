//! Channel Session
//!
//! One long-lived WebSocket connection (public market data or private account
//! stream) with automatic recovery.
//!
//! # Connection Flow
//!
//! 1. `connect()` dials with bounded retries and keeps the write half.
//! 2. `run()` owns the read half: frames go to the consumer queue in arrival
//!    order, pings are answered, expiry notifications go to the refresh loop.
//! 3. On a read error, a heartbeat timeout or an external reconnect request
//!    the read loop reconnects. The connection lock is held from redial through
//!    subscription replay, so concurrent writes land after the replay batch.
//! 4. Exhausting the reconnect retries is terminal: the session reports
//!    `Failed` and never dials again.
//!
//! A stop request wins over reconnection at every decision point.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio::time::Interval;
use tokio_tungstenite::tungstenite::{self, Bytes, Message};
use tokio_util::sync::CancellationToken;

use super::backoff::RetryConfig;
use super::codec::{self, FrameKind};
use super::credential::{CredentialKeeper, ExpiryNotifier};
use super::dialer::{DialError, Dialer, WsStream, backoff_sleep};
use super::heartbeat::{HeartbeatAction, HeartbeatConfig, HeartbeatMonitor};
use crate::domain::session::{
    ChannelKind, RestartSignal, SessionCredential, SessionStatus, redact,
};
use crate::domain::subscription::{SubscribeRequest, SubscriptionRegistry};
use crate::infrastructure::metrics;

/// Write half of a connection.
pub type WsSink = SplitSink<WsStream, Message>;

/// Read half of a connection.
pub type WsSource = SplitStream<WsStream>;

/// Upper bound for closing a stale connection.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

// =============================================================================
// Error Type
// =============================================================================

/// Errors surfaced by a channel session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Initial dial failed for a reason other than retry exhaustion.
    #[error("{channel} dial failed: {source}")]
    Dial {
        /// Affected channel.
        channel: ChannelKind,
        /// Underlying dial error.
        #[source]
        source: DialError,
    },

    /// Every allowed (re)connect attempt failed. Terminal.
    #[error("{channel} session gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Affected channel.
        channel: ChannelKind,
        /// Number of dial attempts made.
        attempts: u32,
        /// Error of the final attempt.
        last: Box<DialError>,
    },

    /// The private channel has no credential to connect with.
    #[error("no session credential installed for the private channel")]
    MissingCredential,

    /// No live connection to write to.
    #[error("{0} session is not connected")]
    NotConnected(ChannelKind),

    /// Request could not be encoded.
    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),

    /// Writing to the socket failed.
    #[error("write failed: {0}")]
    Write(#[source] Box<tungstenite::Error>),

    /// Stop requested.
    #[error("session stopped")]
    Stopped,
}

impl SessionError {
    fn from_dial(channel: ChannelKind, error: DialError) -> Self {
        match error {
            DialError::Cancelled => Self::Stopped,
            DialError::RetriesExhausted { attempts, last } => Self::RetriesExhausted {
                channel,
                attempts,
                last,
            },
            source => Self::Dial { channel, source },
        }
    }

    /// Check if the error ends the session for good.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::RetriesExhausted { .. } | Self::Dial { .. })
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Per-session settings.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Which stream this session carries.
    pub kind: ChannelKind,
    /// Endpoint. For the private channel the credential is appended as a path
    /// segment.
    pub url: String,
    /// Backoff for the initial dial.
    pub dial_retry: RetryConfig,
    /// Backoff for reconnect dials.
    pub reconnect_retry: RetryConfig,
    /// Client-side liveness check.
    pub heartbeat: HeartbeatConfig,
}

impl ChannelConfig {
    /// Settings with default backoff (100 ms dial step, 500 ms reconnect step).
    #[must_use]
    pub fn new(kind: ChannelKind, url: impl Into<String>, max_retries: u32) -> Self {
        let dial_retry = RetryConfig {
            max_retries,
            ..RetryConfig::default()
        };
        Self {
            kind,
            url: url.into(),
            reconnect_retry: dial_retry.clone().with_unit(Duration::from_millis(500)),
            dial_retry,
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

// =============================================================================
// Reconnect Requests
// =============================================================================

/// Asks a session's read loop to reconnect. Requests made while nobody is
/// waiting are kept until the loop next checks or a reconnect completes.
#[derive(Debug, Clone, Default)]
pub struct ReconnectHandle {
    notify: Arc<Notify>,
    pending: Arc<AtomicBool>,
}

impl ReconnectHandle {
    /// Request a reconnect.
    pub fn request(&self) {
        self.pending.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Wait for the next request.
    pub async fn requested(&self) {
        loop {
            if self.pending.swap(false, Ordering::SeqCst) {
                return;
            }
            // A permit left by a cleared request wakes us with the flag unset.
            self.notify.notified().await;
        }
    }

    /// Drop a pending request. Returns `true` if one was pending.
    pub fn clear(&self) -> bool {
        self.pending.swap(false, Ordering::SeqCst)
    }
}

// =============================================================================
// Session
// =============================================================================

/// Why the read loop stopped reading.
#[derive(Debug)]
enum ReadOutcome {
    Stopped,
    ConsumerGone,
    Broken(String),
}

/// One logical streaming connection.
pub struct ChannelSession {
    config: ChannelConfig,
    dialer: Dialer,
    sink: tokio::sync::Mutex<Option<WsSink>>,
    status: Mutex<SessionStatus>,
    registry: SubscriptionRegistry,
    next_id: AtomicU64,
    outbound: mpsc::Sender<Bytes>,
    restarts: mpsc::UnboundedSender<RestartSignal>,
    credentials: Option<CredentialKeeper>,
    expiry: Option<ExpiryNotifier>,
    reconnect: ReconnectHandle,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ChannelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSession")
            .field("kind", &self.config.kind)
            .field("status", &*self.status.lock())
            .field("subscriptions", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl ChannelSession {
    /// Create a session. Nothing is dialed until `connect()`.
    #[must_use]
    pub fn new(
        config: ChannelConfig,
        dialer: Dialer,
        outbound: mpsc::Sender<Bytes>,
        restarts: mpsc::UnboundedSender<RestartSignal>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            dialer,
            sink: tokio::sync::Mutex::new(None),
            status: Mutex::new(SessionStatus::Disconnected),
            registry: SubscriptionRegistry::new(),
            next_id: AtomicU64::new(1),
            outbound,
            restarts,
            credentials: None,
            expiry: None,
            reconnect: ReconnectHandle::default(),
            cancel,
        }
    }

    /// Attach the credential keeper and expiry notifier (private channel).
    #[must_use]
    pub fn with_credentials(mut self, keeper: CredentialKeeper, expiry: ExpiryNotifier) -> Self {
        self.credentials = Some(keeper);
        self.expiry = Some(expiry);
        self
    }

    /// Channel kind.
    #[must_use]
    pub const fn kind(&self) -> ChannelKind {
        self.config.kind
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        *self.status.lock()
    }

    /// Handle for requesting a reconnect from outside the read loop.
    #[must_use]
    pub fn reconnect_handle(&self) -> ReconnectHandle {
        self.reconnect.clone()
    }

    /// Ask the read loop to reconnect.
    pub fn request_reconnect(&self) {
        self.reconnect.request();
    }

    /// Snapshot of recorded subscriptions.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<SubscribeRequest> {
        self.registry.entries()
    }

    /// Signal the session to stop.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Emit a `RestartSignal` with cause `Initial`.
    pub fn announce_initial(&self) {
        self.emit(RestartSignal::initial(self.config.kind));
    }

    /// Dial the endpoint with retries.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::RetriesExhausted` (terminal), `Stopped`, or
    /// `MissingCredential` for a private session without a credential.
    pub async fn connect(&self) -> Result<WsSource, SessionError> {
        let kind = self.config.kind;
        let url = self.endpoint_url()?;

        tracing::info!(channel = kind.as_str(), url = %self.display_url(&url), "Connecting");

        let stream = match self
            .dialer
            .dial(kind, &url, &self.config.dial_retry, &self.cancel)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                let error = SessionError::from_dial(kind, e);
                if error.is_terminal() {
                    self.set_status(SessionStatus::Failed);
                    metrics::record_session_failure(kind);
                }
                return Err(error);
            }
        };

        let (sink, source) = stream.split();
        *self.sink.lock().await = Some(sink);
        self.set_status(SessionStatus::Connected);
        metrics::set_connected(kind, true);

        tracing::info!(channel = kind.as_str(), "Connected");
        Ok(source)
    }

    /// Read loop. Returns `Ok` after a stop or when the consumer is gone, and
    /// the terminal error when reconnection gave up.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::RetriesExhausted` when reconnecting failed.
    pub async fn run(&self, mut source: WsSource) -> Result<(), SessionError> {
        let kind = self.config.kind;
        let mut heartbeat = HeartbeatMonitor::new(self.config.heartbeat.clone());

        loop {
            let reason = match self.read_until_broken(&mut source, &mut heartbeat).await {
                ReadOutcome::Stopped => {
                    self.shutdown().await;
                    return Ok(());
                }
                ReadOutcome::ConsumerGone => {
                    tracing::info!(channel = kind.as_str(), "Consumer dropped, closing session");
                    self.shutdown().await;
                    return Ok(());
                }
                ReadOutcome::Broken(reason) => reason,
            };

            if self.cancel.is_cancelled() {
                self.shutdown().await;
                return Ok(());
            }

            tracing::warn!(channel = kind.as_str(), reason = %reason, "Connection lost, reconnecting");

            match self.reconnect().await {
                Ok(fresh) => {
                    source = fresh;
                    heartbeat.reset();
                }
                Err(SessionError::Stopped) => {
                    self.shutdown().await;
                    return Ok(());
                }
                Err(e) => {
                    tracing::error!(channel = kind.as_str(), error = %e, "Session failed");
                    metrics::record_session_failure(kind);
                    return Err(e);
                }
            }
        }
    }

    /// Send a request on the live connection.
    ///
    /// Requests with id 0 get the next session id. On the public channel a
    /// successfully written original request is recorded for replay.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected`, `Encode` or `Write`.
    pub async fn write(&self, request: SubscribeRequest) -> Result<(), SessionError> {
        let mut guard = self.sink.lock().await;
        let sink = guard
            .as_mut()
            .ok_or(SessionError::NotConnected(self.config.kind))?;

        // Assigned under the lock so ids reach the wire in increasing order.
        let request = if request.id == 0 {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            request.with_id(id)
        } else {
            request
        };

        send_request(sink, &request).await?;

        // Recorded under the connection lock so a reconnect snapshot either
        // includes this request or runs before it was written.
        if self.config.kind == ChannelKind::Public && self.registry.record(&request) {
            tracing::debug!(
                id = request.id,
                method = %request.method,
                params = ?request.params,
                "Subscription recorded"
            );
        }
        Ok(())
    }

    // =========================================================================
    // Read Loop
    // =========================================================================

    async fn read_until_broken(
        &self,
        source: &mut WsSource,
        heartbeat: &mut HeartbeatMonitor,
    ) -> ReadOutcome {
        let mut ticker = heartbeat.ticker();

        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => return ReadOutcome::Stopped,

                () = self.reconnect.requested() => {
                    return ReadOutcome::Broken("reconnect requested".into());
                }

                () = next_tick(&mut ticker) => match heartbeat.on_tick() {
                    HeartbeatAction::SendPing => {
                        if let Err(e) = self.send_message(Message::Ping(Bytes::new())).await {
                            return ReadOutcome::Broken(format!("ping failed: {e}"));
                        }
                    }
                    HeartbeatAction::TimedOut => {
                        return ReadOutcome::Broken(format!(
                            "no traffic for {:?}",
                            heartbeat.silence()
                        ));
                    }
                },

                frame = source.next() => {
                    let message = match frame {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => return ReadOutcome::Broken(e.to_string()),
                        None => return ReadOutcome::Broken("stream ended".into()),
                    };
                    heartbeat.record_activity();

                    match message {
                        Message::Text(text) => {
                            if let Err(outcome) = self.deliver(Bytes::from(text)).await {
                                return outcome;
                            }
                        }
                        Message::Binary(data) => {
                            if let Err(outcome) = self.deliver(data).await {
                                return outcome;
                            }
                        }
                        Message::Ping(payload) => {
                            if let Err(e) = self.send_message(Message::Pong(payload)).await {
                                return ReadOutcome::Broken(format!("pong failed: {e}"));
                            }
                        }
                        Message::Close(frame) => {
                            return ReadOutcome::Broken(format!("closed by peer: {frame:?}"));
                        }
                        Message::Pong(_) | Message::Frame(_) => {}
                    }
                }
            }
        }
    }

    async fn deliver(&self, frame: Bytes) -> Result<(), ReadOutcome> {
        let kind = self.config.kind;

        if kind.requires_credential() && codec::inspect(&frame) == FrameKind::CredentialExpired {
            tracing::warn!(channel = kind.as_str(), "Credential expiry notification received");
            if let Some(expiry) = &self.expiry {
                expiry.notify();
            }
            return Ok(());
        }

        tracing::trace!(channel = kind.as_str(), len = frame.len(), "Frame received");

        // Blocks while the queue is full; only a stop interrupts it.
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(ReadOutcome::Stopped),
            sent = self.outbound.send(frame) => match sent {
                Ok(()) => {
                    metrics::record_frame_received(kind);
                    Ok(())
                }
                Err(_) => Err(ReadOutcome::ConsumerGone),
            },
        }
    }

    async fn send_message(&self, message: Message) -> Result<(), SessionError> {
        let mut guard = self.sink.lock().await;
        let sink = guard
            .as_mut()
            .ok_or(SessionError::NotConnected(self.config.kind))?;
        sink.send(message)
            .await
            .map_err(|e| SessionError::Write(Box::new(e)))
    }

    // =========================================================================
    // Reconnect
    // =========================================================================

    async fn reconnect(&self) -> Result<WsSource, SessionError> {
        let kind = self.config.kind;
        let previous = self.set_status(SessionStatus::Reconnecting);
        debug_assert_ne!(previous, SessionStatus::Reconnecting);
        metrics::set_connected(kind, false);

        let mut guard = self.sink.lock().await;
        if let Some(mut stale) = guard.take() {
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, stale.close()).await;
        }

        let mut policy = self.config.reconnect_retry.policy();

        loop {
            if self.cancel.is_cancelled() {
                self.set_status(SessionStatus::Disconnected);
                return Err(SessionError::Stopped);
            }

            // Rebuilt every attempt: the credential may have been replaced.
            let credential = self.credential()?;
            let url = self.url_for(credential.as_deref());

            let error = match self.dialer.dial_once(&url).await {
                Ok(stream) => {
                    let (mut sink, source) = stream.split();
                    match self.replay(&mut sink).await {
                        Ok(replayed) => {
                            *guard = Some(sink);
                            drop(guard);
                            self.finish_reconnect(
                                policy.retries(),
                                replayed,
                                credential.as_deref(),
                            );
                            return Ok(source);
                        }
                        Err(e) => DialError::Transport(Box::new(e)),
                    }
                }
                Err(e) => e,
            };

            metrics::record_reconnect_failure(kind);

            if kind.requires_credential() && error.is_timeout() {
                self.force_issue_credential().await;
            }

            let Some(delay) = policy.next_delay() else {
                self.set_status(SessionStatus::Failed);
                return Err(SessionError::RetriesExhausted {
                    channel: kind,
                    attempts: policy.retries() + 1,
                    last: Box::new(error),
                });
            };

            tracing::warn!(
                channel = kind.as_str(),
                attempt = policy.retries(),
                delay_ms = delay.as_millis(),
                error = %error,
                "Reconnect failed, retrying"
            );

            if !backoff_sleep(delay, &self.cancel).await {
                self.set_status(SessionStatus::Disconnected);
                return Err(SessionError::Stopped);
            }
        }
    }

    /// Re-send every recorded subscription in original order.
    async fn replay(&self, sink: &mut WsSink) -> Result<usize, tungstenite::Error> {
        if self.config.kind != ChannelKind::Public {
            return Ok(0);
        }

        let batch = self.registry.replay_batch();
        for request in &batch {
            let text = request
                .to_json()
                .map_err(|e| tungstenite::Error::Io(std::io::Error::other(e)))?;
            sink.send(Message::Text(text.into())).await?;
            metrics::record_subscription_sent(true);
        }
        Ok(batch.len())
    }

    fn finish_reconnect(
        &self,
        retries: u32,
        replayed: usize,
        dialed: Option<&SessionCredential>,
    ) {
        let kind = self.config.kind;

        // Requests made while this reconnect ran are satisfied by it, unless
        // the credential changed after the dial.
        if self.reconnect.clear() {
            let replaced = dialed.is_some_and(|dialed| {
                self.credential()
                    .ok()
                    .flatten()
                    .is_some_and(|current| current.token() != dialed.token())
            });
            if replaced {
                tracing::info!(
                    channel = kind.as_str(),
                    "Credential replaced during reconnect, reconnecting again"
                );
                self.reconnect.request();
            } else {
                tracing::debug!(
                    channel = kind.as_str(),
                    "Reconnect request absorbed by completed reconnect"
                );
            }
        }

        self.set_status(SessionStatus::Connected);
        metrics::set_connected(kind, true);
        metrics::record_reconnect(kind);

        tracing::info!(
            channel = kind.as_str(),
            retries,
            replayed,
            "Reconnected"
        );

        self.emit(RestartSignal::reconnect(kind));
    }

    async fn force_issue_credential(&self) {
        let Some(keeper) = &self.credentials else {
            return;
        };

        tracing::warn!(
            channel = self.config.kind.as_str(),
            "Dial timed out, issuing a fresh credential"
        );
        match keeper.force_issue_once().await {
            Ok(credential) => {
                tracing::info!(token = %credential.redacted(), "Fresh credential issued after dial timeout");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Credential issue after dial timeout failed");
            }
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn endpoint_url(&self) -> Result<String, SessionError> {
        Ok(self.url_for(self.credential()?.as_deref()))
    }

    /// Current credential for a private session, `None` for a public one.
    fn credential(&self) -> Result<Option<Arc<SessionCredential>>, SessionError> {
        if !self.config.kind.requires_credential() {
            return Ok(None);
        }

        self.credentials
            .as_ref()
            .and_then(CredentialKeeper::current)
            .map(Some)
            .ok_or(SessionError::MissingCredential)
    }

    fn url_for(&self, credential: Option<&SessionCredential>) -> String {
        match credential {
            Some(credential) => format!(
                "{}/{}",
                self.config.url.trim_end_matches('/'),
                credential.token()
            ),
            None => self.config.url.clone(),
        }
    }

    fn display_url(&self, url: &str) -> String {
        if !self.config.kind.requires_credential() {
            return url.to_owned();
        }
        match url.rsplit_once('/') {
            Some((base, token)) => format!("{base}/{}", redact(token)),
            None => redact(url),
        }
    }

    fn set_status(&self, status: SessionStatus) -> SessionStatus {
        std::mem::replace(&mut *self.status.lock(), status)
    }

    fn emit(&self, signal: RestartSignal) {
        if let Err(mpsc::error::SendError(signal)) = self.restarts.send(signal) {
            tracing::debug!(
                channel = signal.channel.as_str(),
                cause = signal.cause.as_str(),
                "Restart signal dropped, no receiver"
            );
        }
    }

    async fn shutdown(&self) {
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await;
        }
        self.set_status(SessionStatus::Disconnected);
        metrics::set_connected(self.config.kind, false);
        tracing::info!(channel = self.config.kind.as_str(), "Session closed");
    }
}

async fn send_request(sink: &mut WsSink, request: &SubscribeRequest) -> Result<(), SessionError> {
    let text = request.to_json()?;
    sink.send(Message::Text(text.into()))
        .await
        .map_err(|e| SessionError::Write(Box::new(e)))?;
    metrics::record_subscription_sent(request.is_replay);
    Ok(())
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
