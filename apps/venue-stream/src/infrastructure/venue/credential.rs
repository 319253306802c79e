//! Session Credential Handling
//!
//! - [`CredentialStore`]: copy-on-write slot holding the current credential.
//! - [`CredentialKeeper`]: couples the store with the [`CredentialSource`] and
//!   wraps its calls in bounded retries.
//! - [`CredentialRefresher`]: background loop that extends the credential on a
//!   fixed timer and replaces it when the venue reports it expired.
//!
//! Both loop paths install wholesale. If a refresh and a force-issue overlap,
//! whichever finishes last wins; either value is valid.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::backoff::RetryConfig;
use super::channel::ReconnectHandle;
use super::dialer::backoff_sleep;
use crate::application::ports::{CredentialError, CredentialSource};
use crate::domain::session::SessionCredential;
use crate::infrastructure::metrics::{self, CredentialOp};

/// Longest allowed refresh interval. The venue expires a listen key 60
/// minutes after its last extension.
pub const MAX_REFRESH_INTERVAL: Duration = Duration::from_secs(59 * 60 + 50);

/// Refresh interval used when none is configured.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(55 * 60);

/// Capacity of the expiry notification queue.
pub const EXPIRY_QUEUE_CAPACITY: usize = 10;

// =============================================================================
// Error Type
// =============================================================================

/// Errors from the credential keeper and refresh loop.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialLoopError {
    /// Refresh interval outside `(0, MAX_REFRESH_INTERVAL]`.
    #[error("refresh interval {interval:?} must be positive and at most {max:?}")]
    InvalidInterval {
        /// Requested interval.
        interval: Duration,
        /// Upper bound.
        max: Duration,
    },

    /// Every allowed attempt failed.
    #[error("credential {operation} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Operation that failed (`issue` or `refresh`).
        operation: &'static str,
        /// Number of calls made.
        attempts: u32,
        /// Error of the final call.
        last: CredentialError,
    },

    /// Stop requested while retrying.
    #[error("credential operation cancelled")]
    Cancelled,

    /// Refresh requested before any credential was installed.
    #[error("no credential installed")]
    NoCredential,
}

/// Validate a refresh interval.
///
/// # Errors
///
/// Returns `CredentialLoopError::InvalidInterval` unless
/// `0 < interval <= MAX_REFRESH_INTERVAL`.
pub fn validate_refresh_interval(interval: Duration) -> Result<Duration, CredentialLoopError> {
    if interval.is_zero() || interval > MAX_REFRESH_INTERVAL {
        return Err(CredentialLoopError::InvalidInterval {
            interval,
            max: MAX_REFRESH_INTERVAL,
        });
    }
    Ok(interval)
}

// =============================================================================
// Store
// =============================================================================

/// Shared slot for the current session credential.
#[derive(Debug, Default)]
pub struct CredentialStore {
    current: RwLock<Option<Arc<SessionCredential>>>,
}

impl CredentialStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the current credential.
    #[must_use]
    pub fn current(&self) -> Option<Arc<SessionCredential>> {
        self.current.read().clone()
    }

    /// Current token, if any.
    #[must_use]
    pub fn token(&self) -> Option<String> {
        self.current.read().as_ref().map(|c| c.token().to_owned())
    }

    /// Replace the credential, returning the previous one.
    pub fn install(&self, credential: SessionCredential) -> Option<Arc<SessionCredential>> {
        self.swap(Arc::new(credential))
    }

    /// Replace the credential with a shared one, returning the previous one.
    pub fn swap(&self, credential: Arc<SessionCredential>) -> Option<Arc<SessionCredential>> {
        self.current.write().replace(credential)
    }
}

// =============================================================================
// Keeper
// =============================================================================

/// Credential source plus store, with retrying operations.
#[derive(Clone)]
pub struct CredentialKeeper {
    source: Arc<dyn CredentialSource>,
    store: Arc<CredentialStore>,
    refresh_interval: Duration,
    retry: RetryConfig,
}

impl std::fmt::Debug for CredentialKeeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialKeeper")
            .field("store", &self.store)
            .field("refresh_interval", &self.refresh_interval)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl CredentialKeeper {
    /// Create a keeper.
    #[must_use]
    pub fn new(
        source: Arc<dyn CredentialSource>,
        store: Arc<CredentialStore>,
        refresh_interval: Duration,
        retry: RetryConfig,
    ) -> Self {
        Self {
            source,
            store,
            refresh_interval,
            retry,
        }
    }

    /// The shared store.
    #[must_use]
    pub const fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// Snapshot of the current credential.
    #[must_use]
    pub fn current(&self) -> Option<Arc<SessionCredential>> {
        self.store.current()
    }

    /// Issue a credential with retries and install it.
    ///
    /// # Errors
    ///
    /// Returns `RetriesExhausted` or `Cancelled`.
    pub async fn issue_with_retry(
        &self,
        op: CredentialOp,
        cancel: &CancellationToken,
    ) -> Result<Arc<SessionCredential>, CredentialLoopError> {
        let source = &self.source;
        let token = self
            .with_retry("issue", op, cancel, move || source.issue())
            .await?;

        Ok(self.install(token))
    }

    /// Extend the current credential with retries.
    ///
    /// # Errors
    ///
    /// Returns `NoCredential`, `RetriesExhausted` or `Cancelled`.
    pub async fn refresh_with_retry(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), CredentialLoopError> {
        let current = self.current().ok_or(CredentialLoopError::NoCredential)?;
        let source = &self.source;
        let token = current.token();

        self.with_retry("refresh", CredentialOp::Refresh, cancel, move || {
            source.refresh(token)
        })
        .await?;

        tracing::info!(token = %current.redacted(), "Session credential refreshed");
        Ok(())
    }

    /// Single issue attempt, installed on success.
    ///
    /// # Errors
    ///
    /// Returns the source error.
    pub async fn force_issue_once(&self) -> Result<Arc<SessionCredential>, CredentialError> {
        match self.source.issue().await {
            Ok(token) => {
                metrics::record_credential_operation(CredentialOp::ForceIssue, true);
                Ok(self.install(token))
            }
            Err(e) => {
                metrics::record_credential_operation(CredentialOp::ForceIssue, false);
                Err(e)
            }
        }
    }

    fn install(&self, token: String) -> Arc<SessionCredential> {
        let credential = Arc::new(SessionCredential::new(token, self.refresh_interval));
        tracing::info!(token = %credential.redacted(), "Session credential installed");
        self.store.swap(Arc::clone(&credential));
        credential
    }

    async fn with_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        op: CredentialOp,
        cancel: &CancellationToken,
        mut call: F,
    ) -> Result<T, CredentialLoopError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CredentialError>>,
    {
        let mut policy = self.retry.policy();

        loop {
            if cancel.is_cancelled() {
                return Err(CredentialLoopError::Cancelled);
            }

            let error = match call().await {
                Ok(value) => {
                    metrics::record_credential_operation(op, true);
                    return Ok(value);
                }
                Err(e) => e,
            };
            metrics::record_credential_operation(op, false);

            let Some(delay) = policy.next_delay() else {
                return Err(CredentialLoopError::RetriesExhausted {
                    operation,
                    attempts: policy.retries() + 1,
                    last: error,
                });
            };

            tracing::warn!(
                operation,
                attempt = policy.retries(),
                delay_ms = delay.as_millis(),
                error = %error,
                "Credential call failed, retrying"
            );

            if !backoff_sleep(delay, cancel).await {
                return Err(CredentialLoopError::Cancelled);
            }
        }
    }
}

// =============================================================================
// Expiry Notifications
// =============================================================================

/// Sender half used by the private read loop to report an expired credential.
#[derive(Debug, Clone)]
pub struct ExpiryNotifier {
    tx: mpsc::Sender<()>,
}

impl ExpiryNotifier {
    /// Report an expiry without blocking. Returns `false` if the
    /// notification was dropped (queue full or loop gone).
    pub fn notify(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(())) => {
                tracing::debug!("Expiry notification already pending");
                false
            }
            Err(mpsc::error::TrySendError::Closed(())) => false,
        }
    }
}

/// Create the expiry notification queue.
#[must_use]
pub fn expiry_channel() -> (ExpiryNotifier, mpsc::Receiver<()>) {
    let (tx, rx) = mpsc::channel(EXPIRY_QUEUE_CAPACITY);
    (ExpiryNotifier { tx }, rx)
}

// =============================================================================
// Refresh Loop
// =============================================================================

/// Background loop keeping the credential valid.
#[derive(Debug)]
pub struct CredentialRefresher {
    keeper: CredentialKeeper,
    interval: Duration,
    expiry_rx: mpsc::Receiver<()>,
    reconnect: Option<ReconnectHandle>,
}

impl CredentialRefresher {
    /// Create the loop.
    ///
    /// # Errors
    ///
    /// Returns `CredentialLoopError::InvalidInterval` for an out-of-range
    /// interval.
    pub fn new(
        keeper: CredentialKeeper,
        interval: Duration,
        expiry_rx: mpsc::Receiver<()>,
        reconnect: Option<ReconnectHandle>,
    ) -> Result<Self, CredentialLoopError> {
        Ok(Self {
            keeper,
            interval: validate_refresh_interval(interval)?,
            expiry_rx,
            reconnect,
        })
    }

    /// Run until cancelled.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            interval_secs = self.interval.as_secs(),
            "Credential refresh loop started"
        );

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => break,

                Some(()) = self.expiry_rx.recv() => {
                    self.on_expiry(&cancel).await;
                }

                _ = ticker.tick() => {
                    self.on_tick(&cancel).await;
                }
            }
        }

        tracing::info!("Credential refresh loop stopped");
    }

    async fn on_tick(&self, cancel: &CancellationToken) {
        match self.keeper.refresh_with_retry(cancel).await {
            Ok(()) | Err(CredentialLoopError::Cancelled) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Scheduled credential refresh failed, will retry next tick");
            }
        }
    }

    async fn on_expiry(&mut self, cancel: &CancellationToken) {
        metrics::record_credential_expired();
        let previous = self.keeper.current();
        tracing::warn!(
            token = previous.as_ref().map(|c| c.redacted()).unwrap_or_default(),
            "Venue reported the session credential expired, issuing a new one"
        );

        let issued = self
            .keeper
            .issue_with_retry(CredentialOp::ForceIssue, cancel)
            .await;

        // Notifications queued while issuing refer to the credential just
        // handled. Later ones come after the reconnect request below and are
        // kept.
        for _ in 0..self.expiry_rx.len() {
            if self.expiry_rx.try_recv().is_err() {
                break;
            }
        }

        match issued {
            Ok(credential) => {
                if previous.is_some_and(|p| p.token() == credential.token()) {
                    tracing::warn!("Venue returned the same credential after expiry");
                }
                if let Some(reconnect) = &self.reconnect {
                    reconnect.request();
                }
            }
            Err(CredentialLoopError::Cancelled) => {}
            Err(e) => {
                tracing::error!(error = %e, "Could not replace expired credential, keeping the old one");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::application::ports::MockCredentialSource;

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig::new(Duration::from_millis(1), Duration::from_millis(5), 0.0, max_retries)
    }

    fn keeper(source: MockCredentialSource, retries: u32) -> CredentialKeeper {
        CredentialKeeper::new(
            Arc::new(source),
            Arc::new(CredentialStore::new()),
            DEFAULT_REFRESH_INTERVAL,
            fast_retry(retries),
        )
    }

    #[test]
    fn interval_bounds() {
        assert!(validate_refresh_interval(Duration::ZERO).is_err());
        assert!(validate_refresh_interval(Duration::from_secs(1)).is_ok());
        assert!(validate_refresh_interval(DEFAULT_REFRESH_INTERVAL).is_ok());
        assert!(validate_refresh_interval(MAX_REFRESH_INTERVAL).is_ok());
        assert_eq!(
            validate_refresh_interval(Duration::from_secs(3600)),
            Err(CredentialLoopError::InvalidInterval {
                interval: Duration::from_secs(3600),
                max: MAX_REFRESH_INTERVAL,
            })
        );
    }

    #[test]
    fn store_replaces_wholesale() {
        let store = CredentialStore::new();
        assert!(store.current().is_none());

        assert!(store.install(SessionCredential::new("first", Duration::from_secs(1))).is_none());
        let held = store.current().unwrap();

        let previous = store.install(SessionCredential::new("second", Duration::from_secs(1)));
        assert_eq!(previous.unwrap().token(), "first");
        assert_eq!(held.token(), "first");
        assert_eq!(store.token().as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn issue_retries_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut source = MockCredentialSource::new();
        source.expect_issue().times(3).returning(move || {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(CredentialError::Transport("connection reset".into()))
            } else {
                Ok("key-1".into())
            }
        });

        let keeper = keeper(source, 5);
        let credential = keeper
            .issue_with_retry(CredentialOp::Issue, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(credential.token(), "key-1");
        assert_eq!(keeper.store().token().as_deref(), Some("key-1"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn issue_gives_up_after_cap() {
        let mut source = MockCredentialSource::new();
        source
            .expect_issue()
            .times(3)
            .returning(|| Err(CredentialError::MissingToken));

        let keeper = keeper(source, 2);
        let err = keeper
            .issue_with_retry(CredentialOp::Issue, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            CredentialLoopError::RetriesExhausted {
                operation: "issue",
                attempts: 3,
                last: CredentialError::MissingToken,
            }
        );
        assert!(keeper.current().is_none());
    }

    #[tokio::test]
    async fn refresh_without_credential_fails() {
        let keeper = keeper(MockCredentialSource::new(), 1);
        let err = keeper
            .refresh_with_retry(&CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, CredentialLoopError::NoCredential);
    }

    #[tokio::test]
    async fn refresh_sends_current_token() {
        let mut source = MockCredentialSource::new();
        source
            .expect_refresh()
            .withf(|token| token == "key-1")
            .times(1)
            .returning(|_| Ok(()));

        let keeper = keeper(source, 1);
        keeper
            .store()
            .install(SessionCredential::new("key-1", DEFAULT_REFRESH_INTERVAL));

        keeper
            .refresh_with_retry(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(keeper.store().token().as_deref(), Some("key-1"));
    }

    #[tokio::test]
    async fn force_issue_failure_keeps_old_credential() {
        let mut source = MockCredentialSource::new();
        source.expect_issue().times(1).returning(|| {
            Err(CredentialError::Status {
                status: 500,
                body: "oops".into(),
            })
        });

        let keeper = keeper(source, 1);
        keeper
            .store()
            .install(SessionCredential::new("old", DEFAULT_REFRESH_INTERVAL));

        assert!(keeper.force_issue_once().await.is_err());
        assert_eq!(keeper.store().token().as_deref(), Some("old"));
    }

    #[tokio::test]
    async fn cancelled_retry_stops() {
        let mut source = MockCredentialSource::new();
        source
            .expect_issue()
            .returning(|| Err(CredentialError::Transport("down".into())));

        let keeper = CredentialKeeper::new(
            Arc::new(source),
            Arc::new(CredentialStore::new()),
            DEFAULT_REFRESH_INTERVAL,
            RetryConfig::new(Duration::from_secs(30), Duration::from_secs(30), 0.0, 10),
        );
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        let handle = tokio::spawn(async move {
            keeper.issue_with_retry(CredentialOp::Issue, &child).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap_err(), CredentialLoopError::Cancelled);
    }

    #[test]
    fn refresher_rejects_bad_interval() {
        let (_notifier, rx) = expiry_channel();
        let result = CredentialRefresher::new(
            keeper(MockCredentialSource::new(), 1),
            MAX_REFRESH_INTERVAL + Duration::from_secs(1),
            rx,
            None,
        );
        assert!(matches!(
            result,
            Err(CredentialLoopError::InvalidInterval { .. })
        ));
    }

    #[tokio::test]
    async fn expiry_installs_new_credential_and_requests_reconnect() {
        let mut source = MockCredentialSource::new();
        source.expect_issue().returning(|| Ok("fresh".into()));

        let keeper = keeper(source, 1);
        keeper
            .store()
            .install(SessionCredential::new("stale", DEFAULT_REFRESH_INTERVAL));

        let reconnect = ReconnectHandle::default();
        let (notifier, rx) = expiry_channel();
        let refresher = CredentialRefresher::new(
            keeper.clone(),
            DEFAULT_REFRESH_INTERVAL,
            rx,
            Some(reconnect.clone()),
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(refresher.run(cancel.clone()));

        assert!(notifier.notify());
        tokio::time::timeout(Duration::from_secs(1), reconnect.requested())
            .await
            .unwrap();

        assert_eq!(keeper.store().token().as_deref(), Some("fresh"));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn queued_expiries_collapse_but_later_ones_are_handled() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut source = MockCredentialSource::new();
        source.expect_issue().returning(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("key-{n}"))
        });

        let keeper = keeper(source, 1);
        keeper
            .store()
            .install(SessionCredential::new("key-0", DEFAULT_REFRESH_INTERVAL));

        let reconnect = ReconnectHandle::default();
        let (notifier, rx) = expiry_channel();
        let refresher = CredentialRefresher::new(
            keeper.clone(),
            DEFAULT_REFRESH_INTERVAL,
            rx,
            Some(reconnect.clone()),
        )
        .unwrap();

        // Burst from the expired connection: one issue.
        for _ in 0..3 {
            assert!(notifier.notify());
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(refresher.run(cancel.clone()));

        tokio::time::timeout(Duration::from_secs(1), reconnect.requested())
            .await
            .unwrap();
        assert_eq!(keeper.store().token().as_deref(), Some("key-1"));

        // The fresh connection reports expiry right away.
        assert!(notifier.notify());
        tokio::time::timeout(Duration::from_secs(1), reconnect.requested())
            .await
            .unwrap();
        assert_eq!(keeper.store().token().as_deref(), Some("key-2"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn timer_refreshes_periodically() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut source = MockCredentialSource::new();
        source.expect_refresh().returning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let keeper = keeper(source, 1);
        keeper
            .store()
            .install(SessionCredential::new("key", DEFAULT_REFRESH_INTERVAL));

        let (_notifier, rx) = expiry_channel();
        let refresher =
            CredentialRefresher::new(keeper, Duration::from_millis(20), rx, None).unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(refresher.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(150)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert!(calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn failed_refresh_is_not_fatal() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut source = MockCredentialSource::new();
        source.expect_refresh().returning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(CredentialError::Transport("down".into()))
        });

        let keeper = keeper(source, 0);
        keeper
            .store()
            .install(SessionCredential::new("key", DEFAULT_REFRESH_INTERVAL));

        let (_notifier, rx) = expiry_channel();
        let refresher =
            CredentialRefresher::new(keeper, Duration::from_millis(20), rx, None).unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(refresher.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!handle.is_finished());
        cancel.cancel();
        handle.await.unwrap();

        assert!(calls.load(Ordering::SeqCst) >= 2);
    }
}
