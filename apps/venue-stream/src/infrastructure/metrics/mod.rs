//! Prometheus Metrics Module
//!
//! Exposes session manager metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Frames**: inbound frames forwarded per channel
//! - **Connections**: connection state per channel, reconnects and failures
//! - **Credentials**: issue/refresh calls by outcome, expiry notifications
//! - **Subscriptions**: subscribe requests written to the public channel
//!
//! # Integration
//!
//! The exporter serves `/metrics` on its own HTTP listener. Without an
//! installed recorder the recording functions are no-ops.

use std::net::SocketAddr;
use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::domain::session::ChannelKind;

// =============================================================================
// Recorder Installation
// =============================================================================

static INSTALLED: OnceLock<SocketAddr> = OnceLock::new();

/// Install the Prometheus recorder with an HTTP listener on `port`.
///
/// Returns the listen address, or `None` when `port` is zero (metrics
/// disabled). Calling it again after a successful install is a no-op.
///
/// # Errors
///
/// Returns an error if the listener or recorder cannot be installed.
pub fn init_metrics(port: u16) -> Result<Option<SocketAddr>, BuildError> {
    if port == 0 {
        return Ok(None);
    }
    if let Some(addr) = INSTALLED.get() {
        return Ok(Some(*addr));
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    register_metrics();

    Ok(Some(*INSTALLED.get_or_init(|| addr)))
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "venue_stream_frames_received_total",
        "Total frames forwarded to consumers"
    );

    describe_gauge!(
        "venue_stream_connected",
        "Whether the channel currently holds a live connection (1) or not (0)"
    );
    describe_counter!(
        "venue_stream_reconnects_total",
        "Total successful reconnections"
    );
    describe_counter!(
        "venue_stream_reconnect_failures_total",
        "Total failed reconnect dial attempts"
    );
    describe_counter!(
        "venue_stream_session_failures_total",
        "Total sessions that exhausted their retries"
    );

    describe_counter!(
        "venue_stream_credential_operations_total",
        "Credential issue and refresh calls by outcome"
    );
    describe_counter!(
        "venue_stream_credential_expired_total",
        "Credential expiry notifications pushed by the venue"
    );

    describe_counter!(
        "venue_stream_subscriptions_sent_total",
        "Subscribe requests written to the public channel"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Credential operation label.
#[derive(Debug, Clone, Copy)]
pub enum CredentialOp {
    /// Startup issue.
    Issue,
    /// Scheduled refresh.
    Refresh,
    /// Issue forced by expiry or a dial timeout.
    ForceIssue,
}

impl CredentialOp {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Issue => "issue",
            Self::Refresh => "refresh",
            Self::ForceIssue => "force_issue",
        }
    }
}

const fn outcome(success: bool) -> &'static str {
    if success { "success" } else { "failure" }
}

/// Record a frame forwarded to the consumer queue.
pub fn record_frame_received(channel: ChannelKind) {
    counter!(
        "venue_stream_frames_received_total",
        "channel" => channel.as_str()
    )
    .increment(1);
}

/// Update the connection gauge for a channel.
pub fn set_connected(channel: ChannelKind, connected: bool) {
    gauge!(
        "venue_stream_connected",
        "channel" => channel.as_str()
    )
    .set(if connected { 1.0 } else { 0.0 });
}

/// Record a completed reconnect.
pub fn record_reconnect(channel: ChannelKind) {
    counter!(
        "venue_stream_reconnects_total",
        "channel" => channel.as_str()
    )
    .increment(1);
}

/// Record a failed reconnect dial.
pub fn record_reconnect_failure(channel: ChannelKind) {
    counter!(
        "venue_stream_reconnect_failures_total",
        "channel" => channel.as_str()
    )
    .increment(1);
}

/// Record a session that gave up.
pub fn record_session_failure(channel: ChannelKind) {
    counter!(
        "venue_stream_session_failures_total",
        "channel" => channel.as_str()
    )
    .increment(1);
}

/// Record a credential call.
pub fn record_credential_operation(op: CredentialOp, success: bool) {
    counter!(
        "venue_stream_credential_operations_total",
        "operation" => op.as_str(),
        "outcome" => outcome(success)
    )
    .increment(1);
}

/// Record an expiry notification.
pub fn record_credential_expired() {
    counter!("venue_stream_credential_expired_total").increment(1);
}

/// Record a subscribe request written to the socket.
pub fn record_subscription_sent(replay: bool) {
    counter!(
        "venue_stream_subscriptions_sent_total",
        "replay" => if replay { "true" } else { "false" }
    )
    .increment(1);
}

// =============================================================================
// Tests
// =============================================================================
