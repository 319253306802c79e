//! Subscription Registry
//!
//! Records every subscription request successfully written to the public
//! channel so a fresh connection can reproduce it after a reconnect.
//!
//! # Design
//!
//! - Append-only, in send order. Requests are recorded only after the
//!   write succeeded, never before.
//! - Replay takes a snapshot of the whole registry and marks each entry as
//!   a replay; replayed sends are never recorded again.
//! - The registry holds exactly what a new connection must re-send to match
//!   what consumers currently expect.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

// =============================================================================
// Subscribe Request
// =============================================================================

/// Method name for adding streams.
pub const METHOD_SUBSCRIBE: &str = "SUBSCRIBE";

/// Method name for removing streams.
pub const METHOD_UNSUBSCRIBE: &str = "UNSUBSCRIBE";

/// A control request written to the public channel.
///
/// Serialized as `{"id":1,"method":"SUBSCRIBE","params":["btcusdt@ticker"]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    /// Request id echoed by the venue in its acknowledgment (0 = assign on send).
    pub id: u64,
    /// Request method (`SUBSCRIBE`, `UNSUBSCRIBE`, ...).
    pub method: String,
    /// Stream names the method applies to.
    pub params: Vec<String>,
    /// Set only while the request is being replayed after a reconnect.
    #[serde(skip)]
    pub is_replay: bool,
}

impl SubscribeRequest {
    /// Create a request with an explicit method.
    #[must_use]
    pub fn new(method: impl Into<String>, params: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            id: 0,
            method: method.into(),
            params: params.into_iter().map(Into::into).collect(),
            is_replay: false,
        }
    }

    /// Subscribe to the given streams.
    #[must_use]
    pub fn subscribe(streams: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::new(METHOD_SUBSCRIBE, streams)
    }

    /// Unsubscribe from the given streams.
    #[must_use]
    pub fn unsubscribe(streams: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::new(METHOD_UNSUBSCRIBE, streams)
    }

    /// Set the request id.
    #[must_use]
    pub const fn with_id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }

    /// Copy of this request flagged as a replay.
    #[must_use]
    pub fn as_replay(&self) -> Self {
        Self {
            is_replay: true,
            ..self.clone()
        }
    }

    /// Serialize to the wire format.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Ordered record of subscription requests sent on the public channel.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: Mutex<Vec<SubscribeRequest>>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request that was successfully written.
    ///
    /// Replays are ignored. Returns `true` if the request was appended.
    pub fn record(&self, request: &SubscribeRequest) -> bool {
        if request.is_replay {
            return false;
        }

        self.entries.lock().push(request.clone());
        true
    }

    /// Snapshot of all entries in original order, flagged for replay.
    #[must_use]
    pub fn replay_batch(&self) -> Vec<SubscribeRequest> {
        self.entries
            .lock()
            .iter()
            .map(SubscribeRequest::as_replay)
            .collect()
    }

    /// Snapshot of the recorded entries as stored.
    #[must_use]
    pub fn entries(&self) -> Vec<SubscribeRequest> {
        self.entries.lock().clone()
    }

    /// Number of recorded requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
