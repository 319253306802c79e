//! Session Manager
//!
//! Composition root for the channel sessions and the credential refresh loop.
//! Owns the manager lifecycle:
//!
//! ```text
//! Uninitialized -> Starting -> Running -> Stopped
//!                     |
//!                     +-> Failed
//! ```
//!
//! Consumers take their receivers (public frames, private frames, restart
//! signals, session failures) once, before or after `start()`.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{join_all, try_join_all};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Bytes;
use tokio_util::sync::CancellationToken;

use super::backoff::RetryConfig;
use super::channel::{ChannelConfig, ChannelSession, SessionError};
use super::credential::{
    CredentialKeeper, CredentialLoopError, CredentialRefresher, CredentialStore, expiry_channel,
};
use super::dialer::{DialError, Dialer, DialerConfig};
use super::heartbeat::HeartbeatConfig;
use crate::application::ports::CredentialSource;
use crate::domain::session::{ChannelKind, RestartSignal, SessionCredential, SessionStatus};
use crate::domain::subscription::SubscribeRequest;
use crate::infrastructure::config::{ConfigError, SessionConfig};
use crate::infrastructure::metrics::CredentialOp;

/// How long `stop()` waits for tasks before aborting them.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// =============================================================================
// State
// =============================================================================

/// Manager lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    /// Created, not started.
    Uninitialized,
    /// `start()` in progress.
    Starting,
    /// All enabled sessions connected.
    Running,
    /// Stopped by the operator.
    Stopped,
    /// Startup failed. Terminal.
    Failed,
}

impl ManagerState {
    /// Label used in logs and errors.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ManagerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors returned by the session manager.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Dialer could not be built.
    #[error("dialer setup failed: {0}")]
    Dialer(#[from] DialError),

    /// Operation not allowed in the current state.
    #[error("cannot {operation} while {state}")]
    InvalidState {
        /// Attempted operation.
        operation: &'static str,
        /// State at the time.
        state: ManagerState,
    },

    /// Startup did not complete in time.
    #[error("startup timed out after {0:?}")]
    StartupTimeout(Duration),

    /// Initial credential could not be obtained.
    #[error("initial credential issue failed: {0}")]
    Credential(#[from] CredentialLoopError),

    /// A session failed during startup or a write failed.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// A session task ended without reporting.
    #[error("{0} session task ended before reporting readiness")]
    StartupAborted(ChannelKind),

    /// The channel is not enabled.
    #[error("{0} channel is disabled")]
    ChannelDisabled(ChannelKind),

    /// The receiver was already handed out.
    #[error("{0} receiver already taken")]
    ReceiverTaken(&'static str),
}

/// Terminal failure of one session, delivered on the failure stream.
#[derive(Debug)]
pub struct SessionFailure {
    /// Failed channel.
    pub channel: ChannelKind,
    /// Why it failed.
    pub error: SessionError,
}

// =============================================================================
// Manager
// =============================================================================

struct SessionSlot {
    session: Arc<ChannelSession>,
    messages: Mutex<Option<mpsc::Receiver<Bytes>>>,
}

/// Owns both channel sessions, the credential and the refresh loop.
pub struct SessionManager {
    config: SessionConfig,
    state: Mutex<ManagerState>,
    public: Option<SessionSlot>,
    private: Option<SessionSlot>,
    keeper: Option<CredentialKeeper>,
    refresher: Mutex<Option<CredentialRefresher>>,
    restarts: Mutex<Option<mpsc::UnboundedReceiver<RestartSignal>>>,
    failures: Mutex<Option<mpsc::UnboundedReceiver<SessionFailure>>>,
    failure_tx: mpsc::UnboundedSender<SessionFailure>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("state", &*self.state.lock())
            .field("public", &self.public.as_ref().map(|s| s.session.status()))
            .field("private", &self.private.as_ref().map(|s| s.session.status()))
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Build the manager. Validates the configuration; nothing touches the
    /// network until `start()`.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::Config` for an invalid configuration.
    pub fn new(
        config: SessionConfig,
        credential_source: Arc<dyn CredentialSource>,
    ) -> Result<Self, ManagerError> {
        let config = config.validated()?;
        let max_retries = config.max_retries();

        let dialer = Dialer::new(DialerConfig {
            dial_timeout: config.connection.dial_timeout,
            skip_tls_verify: config.connection.skip_tls_verify,
        })?;

        let cancel = CancellationToken::new();
        let (restart_tx, restart_rx) = mpsc::unbounded_channel();
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();

        let heartbeat = HeartbeatConfig::new(
            config.connection.heartbeat_interval,
            config.connection.heartbeat_timeout,
        );
        let slot = |kind: ChannelKind| {
            let settings = config.channel(kind);
            let (tx, rx) = mpsc::channel(settings.queue_capacity);
            let mut channel = ChannelConfig::new(kind, settings.url.clone(), max_retries);
            channel.heartbeat = heartbeat.clone();
            let session = ChannelSession::new(
                channel,
                dialer.clone(),
                tx,
                restart_tx.clone(),
                cancel.child_token(),
            );
            (session, rx)
        };

        let public = config.public.enabled.then(|| {
            let (session, rx) = slot(ChannelKind::Public);
            SessionSlot {
                session: Arc::new(session),
                messages: Mutex::new(Some(rx)),
            }
        });

        let (private, keeper, refresher) = if config.private.enabled {
            let keeper = CredentialKeeper::new(
                credential_source,
                Arc::new(CredentialStore::new()),
                config.refresh_interval(),
                RetryConfig {
                    max_retries,
                    ..RetryConfig::default()
                },
            );
            let (notifier, expiry_rx) = expiry_channel();
            let (session, rx) = slot(ChannelKind::Private);
            let session = Arc::new(session.with_credentials(keeper.clone(), notifier));
            let refresher = CredentialRefresher::new(
                keeper.clone(),
                config.refresh_interval(),
                expiry_rx,
                Some(session.reconnect_handle()),
            )
            .map_err(ManagerError::Credential)?;

            (
                Some(SessionSlot {
                    session,
                    messages: Mutex::new(Some(rx)),
                }),
                Some(keeper),
                Some(refresher),
            )
        } else {
            (None, None, None)
        };

        Ok(Self {
            config,
            state: Mutex::new(ManagerState::Uninitialized),
            public,
            private,
            keeper,
            refresher: Mutex::new(refresher),
            restarts: Mutex::new(Some(restart_rx)),
            failures: Mutex::new(Some(failure_rx)),
            failure_tx,
            tasks: Mutex::new(Vec::new()),
            cancel,
        })
    }

    /// Effective (validated) configuration.
    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ManagerState {
        *self.state.lock()
    }

    /// Status of one session, `None` if the channel is disabled.
    #[must_use]
    pub fn status(&self, kind: ChannelKind) -> Option<SessionStatus> {
        self.slot(kind).map(|slot| slot.session.status())
    }

    /// Current session credential (private channel only).
    #[must_use]
    pub fn credential(&self) -> Option<Arc<SessionCredential>> {
        self.keeper.as_ref().and_then(CredentialKeeper::current)
    }

    /// Subscriptions recorded on the public channel.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<SubscribeRequest> {
        self.public
            .as_ref()
            .map(|slot| slot.session.subscriptions())
            .unwrap_or_default()
    }

    // =========================================================================
    // Receivers
    // =========================================================================

    /// Take the public frame receiver.
    ///
    /// # Errors
    ///
    /// Returns `ChannelDisabled` or `ReceiverTaken`.
    pub fn take_public_messages(&self) -> Result<mpsc::Receiver<Bytes>, ManagerError> {
        self.take_messages(ChannelKind::Public)
    }

    /// Take the private frame receiver.
    ///
    /// # Errors
    ///
    /// Returns `ChannelDisabled` or `ReceiverTaken`.
    pub fn take_private_messages(&self) -> Result<mpsc::Receiver<Bytes>, ManagerError> {
        self.take_messages(ChannelKind::Private)
    }

    /// Take the restart signal receiver.
    ///
    /// # Errors
    ///
    /// Returns `ReceiverTaken` on the second call.
    pub fn take_restart_signals(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<RestartSignal>, ManagerError> {
        self.restarts
            .lock()
            .take()
            .ok_or(ManagerError::ReceiverTaken("restart signal"))
    }

    /// Take the session failure receiver.
    ///
    /// # Errors
    ///
    /// Returns `ReceiverTaken` on the second call.
    pub fn take_failures(&self) -> Result<mpsc::UnboundedReceiver<SessionFailure>, ManagerError> {
        self.failures
            .lock()
            .take()
            .ok_or(ManagerError::ReceiverTaken("session failure"))
    }

    fn take_messages(&self, kind: ChannelKind) -> Result<mpsc::Receiver<Bytes>, ManagerError> {
        let slot = self.slot(kind).ok_or(ManagerError::ChannelDisabled(kind))?;
        slot.messages
            .lock()
            .take()
            .ok_or(ManagerError::ReceiverTaken(kind.as_str()))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start every enabled session and wait until all are connected.
    ///
    /// On any failure, or when `timeout` elapses, everything started so far is
    /// torn down and the manager ends in `Failed`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless uninitialized, `StartupTimeout`, or the
    /// credential/session error that aborted startup.
    pub async fn start(&self, timeout: Duration) -> Result<(), ManagerError> {
        self.transition("start", &[ManagerState::Uninitialized], ManagerState::Starting)?;

        tracing::info!(
            public = self.public.is_some(),
            private = self.private.is_some(),
            timeout_secs = timeout.as_secs_f64(),
            "Starting session manager"
        );

        let result = match tokio::time::timeout(timeout, self.start_sessions()).await {
            Ok(result) => result,
            Err(_elapsed) => Err(ManagerError::StartupTimeout(timeout)),
        };

        if let Err(e) = result {
            tracing::error!(error = %e, "Session manager startup failed");
            self.cancel.cancel();
            self.join_tasks().await;
            let mut state = self.state.lock();
            if *state == ManagerState::Starting {
                *state = ManagerState::Failed;
            }
            return Err(e);
        }

        let refresher = self.refresher.lock().take();
        if let Some(refresher) = refresher {
            let cancel = self.cancel.child_token();
            self.tasks.lock().push(tokio::spawn(refresher.run(cancel)));
        }

        if self.config.announce_initial {
            for slot in self.slots() {
                slot.session.announce_initial();
            }
        }

        self.transition("finish start", &[ManagerState::Starting], ManagerState::Running)?;
        tracing::info!("Session manager running");
        Ok(())
    }

    async fn start_sessions(&self) -> Result<(), ManagerError> {
        if let Some(keeper) = &self.keeper {
            keeper
                .issue_with_retry(CredentialOp::Issue, &self.cancel)
                .await?;
        }

        let mut ready = Vec::new();
        for slot in self.slots() {
            let session = Arc::clone(&slot.session);
            let kind = session.kind();
            let (ready_tx, ready_rx) = oneshot::channel();
            let failures = self.failure_tx.clone();

            self.tasks
                .lock()
                .push(tokio::spawn(drive_session(session, ready_tx, failures)));

            ready.push(async move {
                match ready_rx.await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(ManagerError::Session(e)),
                    Err(_) => Err(ManagerError::StartupAborted(kind)),
                }
            });
        }

        try_join_all(ready).await?;
        Ok(())
    }

    /// Close every session and halt the refresh loop. Idempotent.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock();
            match *state {
                ManagerState::Stopped | ManagerState::Failed => return,
                _ => *state = ManagerState::Stopped,
            }
        }

        tracing::info!("Stopping session manager");
        self.cancel.cancel();
        self.join_tasks().await;
        tracing::info!("Session manager stopped");
    }

    async fn join_tasks(&self) {
        let handles = std::mem::take(&mut *self.tasks.lock());
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();

        if tokio::time::timeout(SHUTDOWN_GRACE, join_all(handles))
            .await
            .is_err()
        {
            tracing::warn!(
                grace_secs = SHUTDOWN_GRACE.as_secs(),
                "Tasks did not finish within the grace period, aborting"
            );
            for abort in aborts {
                abort.abort();
            }
        }
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Write a subscription request to the public channel.
    ///
    /// Returns once the request is on the socket; venue acknowledgment is not
    /// awaited.
    ///
    /// # Errors
    ///
    /// Returns `ChannelDisabled` or the session write error.
    pub async fn subscribe(&self, request: SubscribeRequest) -> Result<(), ManagerError> {
        let slot = self
            .public
            .as_ref()
            .ok_or(ManagerError::ChannelDisabled(ChannelKind::Public))?;
        slot.session.write(request).await?;
        Ok(())
    }

    /// Subscribe to streams by name.
    ///
    /// # Errors
    ///
    /// See [`Self::subscribe`].
    pub async fn subscribe_streams(
        &self,
        streams: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<(), ManagerError> {
        self.subscribe(SubscribeRequest::subscribe(streams)).await
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    const fn slot(&self, kind: ChannelKind) -> Option<&SessionSlot> {
        match kind {
            ChannelKind::Public => self.public.as_ref(),
            ChannelKind::Private => self.private.as_ref(),
        }
    }

    fn slots(&self) -> impl Iterator<Item = &SessionSlot> {
        self.public.iter().chain(self.private.iter())
    }

    fn transition(
        &self,
        operation: &'static str,
        from: &[ManagerState],
        to: ManagerState,
    ) -> Result<(), ManagerError> {
        let mut state = self.state.lock();
        if !from.contains(&*state) {
            return Err(ManagerError::InvalidState {
                operation,
                state: *state,
            });
        }
        *state = to;
        Ok(())
    }
}

/// Connect, report readiness, then run the read loop until stop or failure.
async fn drive_session(
    session: Arc<ChannelSession>,
    ready: oneshot::Sender<Result<(), SessionError>>,
    failures: mpsc::UnboundedSender<SessionFailure>,
) {
    let source = match session.connect().await {
        Ok(source) => {
            let _ = ready.send(Ok(()));
            source
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    if let Err(error) = session.run(source).await {
        let _ = failures.send(SessionFailure {
            channel: session.kind(),
            error,
        });
    }
}
